//! JobFlow persistence. Regenerated on any mapping/detail change; exactly
//! one current row per mapping reference.

use chrono::Utc;
use sqlx::any::AnyRow;

use dwl_schemas::JobFlow;

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows;
use crate::sql::SqlValue;
use crate::store::{tables, Store};

const COLUMNS: &str = "id, mapping_reference, dw_logic, block_process_rows, \
     target_connection_id, dependency_id, current_flag, created_by, created_at";

pub async fn current(store: &Store, reference: &str) -> Result<Option<JobFlow>, StoreError> {
    let t = store.meta_object(tables::JOB_FLOWS);
    let row = store
        .query_opt(
            &format!(
                "select {COLUMNS} from {t} \
                 where mapping_reference = :reference and current_flag = 'Y'"
            ),
            &[("reference", SqlValue::from(reference))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

pub async fn by_id(store: &Store, id: i64) -> Result<Option<JobFlow>, StoreError> {
    let t = store.meta_object(tables::JOB_FLOWS);
    let row = store
        .query_opt(
            &format!("select {COLUMNS} from {t} where id = :id"),
            &[("id", SqlValue::from(id))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

/// Every current flow: the dependency DAG is validated over this set.
pub async fn all_current(store: &Store) -> Result<Vec<JobFlow>, StoreError> {
    let t = store.meta_object(tables::JOB_FLOWS);
    let rows = store
        .query(
            &format!(
                "select {COLUMNS} from {t} where current_flag = 'Y' order by mapping_reference"
            ),
            &[],
        )
        .await?;
    rows.iter().map(decode).collect()
}

pub async fn exists_for(store: &Store, reference: &str) -> Result<bool, StoreError> {
    Ok(current(store, reference).await?.is_some())
}

/// Insert-or-historize the compiled plan. An identical plan keeps the
/// existing row (compilation is idempotent for an unchanged mapping).
pub async fn upsert(
    store: &Store,
    ids: &IdProvider,
    reference: &str,
    dw_logic: &str,
    block_process_rows: i64,
    target_connection_id: Option<i64>,
    dependency_id: Option<i64>,
    actor: &str,
) -> Result<(i64, bool), StoreError> {
    if let Some(existing) = current(store, reference).await? {
        let unchanged = existing.dw_logic == dw_logic
            && existing.block_process_rows == block_process_rows
            && existing.target_connection_id == target_connection_id
            && existing.dependency_id == dependency_id;
        if unchanged {
            return Ok((existing.id, false));
        }
        let id = ids.next_id(entity::JOB_FLOW).await?;
        let t = store.meta_object(tables::JOB_FLOWS);
        let mut tx = store.begin().await?;
        tx.exec(
            &format!("update {t} set current_flag = 'N' where id = :id"),
            &[("id", SqlValue::from(existing.id))],
        )
        .await?;
        tx.exec(
            &insert_sql(&t),
            &insert_params(
                id,
                reference,
                dw_logic,
                block_process_rows,
                target_connection_id,
                dependency_id,
                actor,
            ),
        )
        .await?;
        tx.commit().await?;
        return Ok((id, true));
    }

    let id = ids.next_id(entity::JOB_FLOW).await?;
    let t = store.meta_object(tables::JOB_FLOWS);
    store
        .exec(
            &insert_sql(&t),
            &insert_params(
                id,
                reference,
                dw_logic,
                block_process_rows,
                target_connection_id,
                dependency_id,
                actor,
            ),
        )
        .await?;
    Ok((id, true))
}

pub async fn delete_for(store: &Store, reference: &str) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::JOB_FLOWS);
    store
        .exec(
            &format!("delete from {t} where mapping_reference = :reference"),
            &[("reference", SqlValue::from(reference))],
        )
        .await
}

fn insert_sql(table: &str) -> String {
    format!(
        "insert into {table} ({COLUMNS}) values (\
         :id, :reference, :dw_logic, :block_process_rows, :target_connection_id, \
         :dependency_id, 'Y', :actor, :now)"
    )
}

fn insert_params<'a>(
    id: i64,
    reference: &'a str,
    dw_logic: &'a str,
    block_process_rows: i64,
    target_connection_id: Option<i64>,
    dependency_id: Option<i64>,
    actor: &'a str,
) -> Vec<(&'static str, SqlValue)> {
    vec![
        ("id", SqlValue::from(id)),
        ("reference", SqlValue::from(reference)),
        ("dw_logic", SqlValue::from(dw_logic)),
        ("block_process_rows", SqlValue::from(block_process_rows)),
        ("target_connection_id", SqlValue::from(target_connection_id)),
        ("dependency_id", SqlValue::from(dependency_id)),
        ("actor", SqlValue::from(actor)),
        ("now", SqlValue::from(Utc::now())),
    ]
}

fn decode(row: &AnyRow) -> Result<JobFlow, StoreError> {
    Ok(JobFlow {
        id: rows::int(row, "id")?,
        mapping_reference: rows::text(row, "mapping_reference")?,
        dw_logic: crate::store::column_value(row, "dw_logic")?.read_large_text(),
        block_process_rows: rows::int(row, "block_process_rows")?,
        target_connection_id: rows::opt_int(row, "target_connection_id")?,
        dependency_id: rows::opt_int(row, "dependency_id")?,
        current_flag: rows::flag(row, "current_flag")?,
        created_at: rows::ts(row, "created_at")?,
    })
}
