//! Structured validation errors written by the compiler. Informational
//! only; nothing reads them back on the hot path.

use chrono::Utc;
use sqlx::any::AnyRow;

use dwl_schemas::ErrorRecord;

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows;
use crate::sql::SqlValue;
use crate::store::{tables, Store};

pub async fn insert(
    store: &Store,
    ids: &IdProvider,
    mapping_reference: Option<&str>,
    code: i32,
    procedure_name: &str,
    params: &[String],
    message: &str,
) -> Result<i64, StoreError> {
    let id = ids.next_id(entity::ERROR_RECORD).await?;
    let t = store.meta_object(tables::ERROR_RECORDS);
    store
        .exec(
            &format!(
                "insert into {t} (id, mapping_reference, code, procedure_name, params, \
                 message, created_at) \
                 values (:id, :reference, :code, :procedure, :params, :message, :now)"
            ),
            &[
                ("id", SqlValue::from(id)),
                (
                    "reference",
                    SqlValue::from(mapping_reference.map(str::to_string)),
                ),
                ("code", SqlValue::from(i64::from(code))),
                ("procedure", SqlValue::from(procedure_name)),
                ("params", SqlValue::from(serde_json::to_string(params)?)),
                ("message", SqlValue::from(message)),
                ("now", SqlValue::from(Utc::now())),
            ],
        )
        .await?;
    Ok(id)
}

pub async fn for_mapping(
    store: &Store,
    mapping_reference: &str,
) -> Result<Vec<ErrorRecord>, StoreError> {
    let t = store.meta_object(tables::ERROR_RECORDS);
    let rows = store
        .query(
            &format!(
                "select id, mapping_reference, code, procedure_name, params, message, \
                 created_at from {t} \
                 where mapping_reference = :reference order by id desc"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    rows.iter().map(decode).collect()
}

fn decode(row: &AnyRow) -> Result<ErrorRecord, StoreError> {
    Ok(ErrorRecord {
        id: rows::int(row, "id")?,
        mapping_reference: rows::opt_text(row, "mapping_reference")?,
        code: rows::int(row, "code")? as i32,
        procedure_name: rows::text(row, "procedure_name")?,
        params: serde_json::from_str(&rows::text(row, "params")?)?,
        message: rows::text(row, "message")?,
        created_at: rows::ts(row, "created_at")?,
    })
}
