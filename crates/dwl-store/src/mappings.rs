//! Mapping persistence. Historized jointly with its details: an upsert that
//! changes any relevant field flips the old current row to `N` and inserts
//! the new one.

use chrono::Utc;
use sqlx::any::AnyRow;

use dwl_schemas::codes::{CheckpointStrategy, FrequencyCode, StatusFlag, TableType};
use dwl_schemas::{CheckpointSpec, LogicVerified, Mapping, MappingDraft};

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows::{self, yn};
use crate::sql::SqlValue;
use crate::store::{tables, Store};

const COLUMNS: &str = "id, reference, description, target_schema, target_table_type, \
     target_table_name, frequency_code, source_system, logic_verified_flag, \
     logic_verified_at, status_flag, block_process_rows, target_connection_id, \
     checkpoint_strategy, checkpoint_column, checkpoint_enabled, current_flag, \
     created_by, created_at";

pub async fn current(store: &Store, reference: &str) -> Result<Option<Mapping>, StoreError> {
    let t = store.meta_object(tables::MAPPINGS);
    let row = store
        .query_opt(
            &format!("select {COLUMNS} from {t} where reference = :reference and current_flag = 'Y'"),
            &[("reference", SqlValue::from(reference))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

pub async fn references_of_active(store: &Store) -> Result<Vec<String>, StoreError> {
    let t = store.meta_object(tables::MAPPINGS);
    let rows = store
        .query(
            &format!(
                "select reference from {t} where current_flag = 'Y' and status_flag = 'A' \
                 order by reference"
            ),
            &[],
        )
        .await?;
    rows.iter().map(|r| rows::text(r, "reference")).collect()
}

/// Insert-or-historize. Equality is over the whole draft; large-text fields
/// are already read-back strings by the time they reach the draft.
pub async fn upsert(
    store: &Store,
    ids: &IdProvider,
    draft: &MappingDraft,
    actor: &str,
) -> Result<(i64, bool), StoreError> {
    if let Some(existing) = current(store, &draft.reference).await? {
        if existing.draft == *draft {
            return Ok((existing.id, false));
        }
        let id = ids.next_id(entity::MAPPING).await?;
        let t = store.meta_object(tables::MAPPINGS);
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

    let id = ids.next_id(entity::MAPPING).await?;
    let t = store.meta_object(tables::MAPPINGS);
    store.exec(&insert_sql(&t), &insert_params(id, draft, actor)).await?;
    Ok((id, true))
}

/// Flip the activation flag on the current row in place. Status is not a
/// historized attribute; activation is an operational act, not a new
/// version of the contract.
pub async fn set_status(
    store: &Store,
    reference: &str,
    status: StatusFlag,
) -> Result<bool, StoreError> {
    let t = store.meta_object(tables::MAPPINGS);
    let n = store
        .exec(
            &format!(
                "update {t} set status_flag = :status \
                 where reference = :reference and current_flag = 'Y'"
            ),
            &[
                ("status", SqlValue::from(status.as_code())),
                ("reference", SqlValue::from(reference)),
            ],
        )
        .await?;
    Ok(n > 0)
}

/// Remove every version of a mapping. The compiler refuses this while a
/// job flow still references it.
pub async fn delete(store: &Store, reference: &str) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::MAPPINGS);
    store
        .exec(
            &format!("delete from {t} where reference = :reference"),
            &[("reference", SqlValue::from(reference))],
        )
        .await
}

fn insert_sql(table: &str) -> String {
    format!(
        "insert into {table} ({COLUMNS}) values (\
         :id, :reference, :description, :target_schema, :target_table_type, \
         :target_table_name, :frequency_code, :source_system, :logic_verified_flag, \
         :logic_verified_at, :status_flag, :block_process_rows, :target_connection_id, \
         :checkpoint_strategy, :checkpoint_column, :checkpoint_enabled, 'Y', \
         :actor, :now)"
    )
}

fn insert_params<'a>(id: i64, draft: &'a MappingDraft, actor: &'a str) -> Vec<(&'static str, SqlValue)> {
    vec![
        ("id", SqlValue::from(id)),
        ("reference", SqlValue::from(draft.reference.as_str())),
        ("description", SqlValue::from(draft.description.clone())),
        ("target_schema", SqlValue::from(draft.target_schema.as_str())),
        (
            "target_table_type",
            SqlValue::from(draft.target_table_type.as_code()),
        ),
        (
            "target_table_name",
            SqlValue::from(draft.target_table_name.as_str()),
        ),
        (
            "frequency_code",
            SqlValue::from(draft.frequency_code.as_code()),
        ),
        ("source_system", SqlValue::from(draft.source_system.clone())),
        (
            "logic_verified_flag",
            SqlValue::from(yn(draft.logic_verified.is_some())),
        ),
        (
            "logic_verified_at",
            SqlValue::from(draft.logic_verified.map(|lv| lv.verified_at)),
        ),
        ("status_flag", SqlValue::from(draft.status_flag.as_code())),
        (
            "block_process_rows",
            SqlValue::from(draft.block_process_rows),
        ),
        (
            "target_connection_id",
            SqlValue::from(draft.target_connection_id),
        ),
        (
            "checkpoint_strategy",
            SqlValue::from(draft.checkpoint.strategy.as_code()),
        ),
        (
            "checkpoint_column",
            SqlValue::from(draft.checkpoint.column.clone()),
        ),
        (
            "checkpoint_enabled",
            SqlValue::from(yn(draft.checkpoint.enabled)),
        ),
        ("actor", SqlValue::from(actor)),
        ("now", SqlValue::from(Utc::now())),
    ]
}

fn decode(row: &AnyRow) -> Result<Mapping, StoreError> {
    let logic_verified = match (
        rows::flag(row, "logic_verified_flag")?,
        rows::opt_date(row, "logic_verified_at")?,
    ) {
        (true, Some(verified_at)) => Some(LogicVerified { verified_at }),
        _ => None,
    };

    let draft = MappingDraft {
        reference: rows::text(row, "reference")?,
        description: rows::opt_text(row, "description")?,
        target_schema: rows::text(row, "target_schema")?,
        target_table_type: rows::text(row, "target_table_type")?.parse::<TableType>()?,
        target_table_name: rows::text(row, "target_table_name")?,
        frequency_code: rows::text(row, "frequency_code")?.parse::<FrequencyCode>()?,
        source_system: rows::opt_text(row, "source_system")?,
        logic_verified,
        status_flag: rows::text(row, "status_flag")?.parse::<StatusFlag>()?,
        block_process_rows: rows::int(row, "block_process_rows")?,
        target_connection_id: rows::opt_int(row, "target_connection_id")?,
        checkpoint: CheckpointSpec {
            strategy: rows::text(row, "checkpoint_strategy")?.parse::<CheckpointStrategy>()?,
            column: rows::opt_text(row, "checkpoint_column")?,
            enabled: rows::flag(row, "checkpoint_enabled")?,
        },
    };

    Ok(Mapping {
        id: rows::int(row, "id")?,
        draft,
        current_flag: rows::flag(row, "current_flag")?,
        created_by: rows::text(row, "created_by")?,
        created_at: rows::ts(row, "created_at")?,
    })
}
