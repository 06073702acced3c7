//! MappingDetail persistence. Historized per (mapping reference, target
//! column), same flip-and-insert discipline as the mapping itself.

use chrono::Utc;
use sqlx::any::AnyRow;

use dwl_schemas::codes::ScdType;
use dwl_schemas::{LogicVerified, MapLogic, MappingDetail, MappingDetailDraft};

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows::{self, yn};
use crate::sql::SqlValue;
use crate::store::{tables, Store};

const COLUMNS: &str = "id, mapping_reference, target_column, target_data_type, \
     primary_key_flag, primary_key_sequence, description, map_logic, key_columns, \
     value_column, combination_code, execution_sequence, scd_type, \
     logic_verified_flag, logic_verified_at, default_value, is_required, \
     derivation_flag, derivation_formula, current_flag, created_by, created_at";

pub async fn current(
    store: &Store,
    mapping_reference: &str,
    target_column: &str,
) -> Result<Option<MappingDetail>, StoreError> {
    let t = store.meta_object(tables::MAPPING_DETAILS);
    let row = store
        .query_opt(
            &format!(
                "select {COLUMNS} from {t} \
                 where mapping_reference = :reference and target_column = :column \
                 and current_flag = 'Y'"
            ),
            &[
                ("reference", SqlValue::from(mapping_reference)),
                ("column", SqlValue::from(target_column)),
            ],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

/// All current details of a mapping, in execution order (combination code,
/// then execution sequence): the order compilation consumes them in.
pub async fn all_current(
    store: &Store,
    mapping_reference: &str,
) -> Result<Vec<MappingDetail>, StoreError> {
    let t = store.meta_object(tables::MAPPING_DETAILS);
    let rows = store
        .query(
            &format!(
                "select {COLUMNS} from {t} \
                 where mapping_reference = :reference and current_flag = 'Y' \
                 order by combination_code, execution_sequence, target_column"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    rows.iter().map(decode).collect()
}

pub async fn upsert(
    store: &Store,
    ids: &IdProvider,
    draft: &MappingDetailDraft,
    actor: &str,
) -> Result<(i64, bool), StoreError> {
    if let Some(existing) = current(store, &draft.mapping_reference, &draft.target_column).await? {
        if existing.draft == *draft {
            return Ok((existing.id, false));
        }
        let id = ids.next_id(entity::MAPPING_DETAIL).await?;
        let t = store.meta_object(tables::MAPPING_DETAILS);
        let mut tx = store.begin().await?;
        tx.exec(
            &format!("update {t} set current_flag = 'N' where id = :id"),
            &[("id", SqlValue::from(existing.id))],
        )
        .await?;
        tx.exec(&insert_sql(&t), &insert_params(id, draft, actor))
            .await?;
        tx.commit().await?;
        return Ok((id, true));
    }

    let id = ids.next_id(entity::MAPPING_DETAIL).await?;
    let t = store.meta_object(tables::MAPPING_DETAILS);
    store.exec(&insert_sql(&t), &insert_params(id, draft, actor)).await?;
    Ok((id, true))
}

/// Remove every version of one detail.
pub async fn delete(
    store: &Store,
    mapping_reference: &str,
    target_column: &str,
) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::MAPPING_DETAILS);
    store
        .exec(
            &format!(
                "delete from {t} where mapping_reference = :reference \
                 and target_column = :column"
            ),
            &[
                ("reference", SqlValue::from(mapping_reference)),
                ("column", SqlValue::from(target_column)),
            ],
        )
        .await
}

pub async fn delete_all(store: &Store, mapping_reference: &str) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::MAPPING_DETAILS);
    store
        .exec(
            &format!("delete from {t} where mapping_reference = :reference"),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await
}

fn insert_sql(table: &str) -> String {
    format!(
        "insert into {table} ({COLUMNS}) values (\
         :id, :mapping_reference, :target_column, :target_data_type, \
         :primary_key_flag, :primary_key_sequence, :description, :map_logic, \
         :key_columns, :value_column, :combination_code, :execution_sequence, \
         :scd_type, :logic_verified_flag, :logic_verified_at, :default_value, \
         :is_required, :derivation_flag, :derivation_formula, 'Y', :actor, :now)"
    )
}

fn insert_params<'a>(
    id: i64,
    draft: &'a MappingDetailDraft,
    actor: &'a str,
) -> Vec<(&'static str, SqlValue)> {
    vec![
        ("id", SqlValue::from(id)),
        (
            "mapping_reference",
            SqlValue::from(draft.mapping_reference.as_str()),
        ),
        ("target_column", SqlValue::from(draft.target_column.as_str())),
        (
            "target_data_type",
            SqlValue::from(draft.target_data_type.as_str()),
        ),
        (
            "primary_key_flag",
            SqlValue::from(yn(draft.is_primary_key())),
        ),
        (
            "primary_key_sequence",
            SqlValue::from(draft.primary_key_sequence.map(i64::from)),
        ),
        ("description", SqlValue::from(draft.description.clone())),
        ("map_logic", SqlValue::from(draft.map_logic.as_stored())),
        (
            "key_columns",
            SqlValue::from(draft.key_columns.join(",")),
        ),
        ("value_column", SqlValue::from(draft.value_column.as_str())),
        (
            "combination_code",
            SqlValue::from(i64::from(draft.combination_code)),
        ),
        (
            "execution_sequence",
            SqlValue::from(i64::from(draft.execution_sequence)),
        ),
        ("scd_type", SqlValue::from(i64::from(draft.scd_type.as_number()))),
        (
            "logic_verified_flag",
            SqlValue::from(yn(draft.logic_verified.is_some())),
        ),
        (
            "logic_verified_at",
            SqlValue::from(draft.logic_verified.map(|lv| lv.verified_at)),
        ),
        ("default_value", SqlValue::from(draft.default_value.clone())),
        ("is_required", SqlValue::from(yn(draft.is_required))),
        (
            "derivation_flag",
            SqlValue::from(yn(draft.derivation_formula.is_some())),
        ),
        (
            "derivation_formula",
            SqlValue::from(draft.derivation_formula.clone()),
        ),
        ("actor", SqlValue::from(actor)),
        ("now", SqlValue::from(Utc::now())),
    ]
}

fn decode(row: &AnyRow) -> Result<MappingDetail, StoreError> {
    let logic_verified = match (
        rows::flag(row, "logic_verified_flag")?,
        rows::opt_date(row, "logic_verified_at")?,
    ) {
        (true, Some(verified_at)) => Some(LogicVerified { verified_at }),
        _ => None,
    };

    let key_columns = rows::text(row, "key_columns")?
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let draft = MappingDetailDraft {
        mapping_reference: rows::text(row, "mapping_reference")?,
        target_column: rows::text(row, "target_column")?,
        target_data_type: rows::text(row, "target_data_type")?,
        primary_key_sequence: rows::opt_int(row, "primary_key_sequence")?.map(|v| v as i32),
        description: rows::opt_text(row, "description")?,
        map_logic: MapLogic::from_stored(
            &crate::store::column_value(row, "map_logic")?.read_large_text(),
        ),
        key_columns,
        value_column: rows::text(row, "value_column")?,
        combination_code: rows::int(row, "combination_code")? as i32,
        execution_sequence: rows::int(row, "execution_sequence")? as i32,
        scd_type: ScdType::from_number(rows::int(row, "scd_type")? as i32)?,
        logic_verified,
        default_value: rows::opt_text(row, "default_value")?,
        is_required: rows::flag(row, "is_required")?,
        derivation_formula: if rows::flag(row, "derivation_flag")? {
            rows::opt_text(row, "derivation_formula")?
        } else {
            None
        },
    };

    Ok(MappingDetail {
        id: rows::int(row, "id")?,
        draft,
        current_flag: rows::flag(row, "current_flag")?,
        created_by: rows::text(row, "created_by")?,
        created_at: rows::ts(row, "created_at")?,
    })
}
