//! Run-log persistence and the per-mapping execution lease.
//!
//! Opening a run inserts the IP row; a partial unique index on
//! `(mapping_reference) where status = 'IP'` makes the lease race-free.
//! Every subsequent write is compare-and-set on `(id, 'IP', session_id)`;
//! zero rows affected means the lease was taken away (janitor or stop) and
//! surfaces as [`StoreError::LeaseLost`].

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use uuid::Uuid;

use dwl_schemas::codes::RunStatus;
use dwl_schemas::RunLog;

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows;
use crate::sql::SqlValue;
use crate::store::{tables, Store};

const COLUMNS: &str = "id, mapping_reference, session_id, status, started_at, ended_at, \
     heartbeat_at, rows_read, rows_written, rows_failed, message, checkpoint_value";

#[derive(Debug, Clone, Default)]
pub struct RunLogFilter {
    pub mapping_reference: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
}

/// Acquire the lease: insert the IP row. `None` when another attempt is
/// already in flight for this mapping.
pub async fn open(
    store: &Store,
    ids: &IdProvider,
    mapping_reference: &str,
    session_id: Uuid,
) -> Result<Option<i64>, StoreError> {
    let id = ids.next_id(entity::RUN_LOG).await?;
    let t = store.meta_object(tables::RUN_LOGS);
    let now = Utc::now();
    let result = store
        .exec(
            &format!(
                "insert into {t} (id, mapping_reference, session_id, status, started_at, \
                 heartbeat_at, rows_read, rows_written, rows_failed) \
                 values (:id, :reference, :session, 'IP', :now, :now, 0, 0, 0)"
            ),
            &[
                ("id", SqlValue::from(id)),
                ("reference", SqlValue::from(mapping_reference)),
                ("session", SqlValue::from(session_id)),
                ("now", SqlValue::from(now)),
            ],
        )
        .await;

    match result {
        Ok(_) => Ok(Some(id)),
        Err(e) if e.is_unique_violation() => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn heartbeat(store: &Store, id: i64, session_id: Uuid) -> Result<(), StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let n = store
        .exec(
            &format!(
                "update {t} set heartbeat_at = :now \
                 where id = :id and status = 'IP' and session_id = :session"
            ),
            &[
                ("now", SqlValue::from(Utc::now())),
                ("id", SqlValue::from(id)),
                ("session", SqlValue::from(session_id)),
            ],
        )
        .await?;
    if n == 0 {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

/// Add chunk totals and refresh the heartbeat in one write.
pub async fn add_progress(
    store: &Store,
    id: i64,
    session_id: Uuid,
    rows_read: i64,
    rows_written: i64,
    rows_failed: i64,
) -> Result<(), StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let n = store
        .exec(
            &format!(
                "update {t} set rows_read = rows_read + :rows_read, \
                 rows_written = rows_written + :rows_written, \
                 rows_failed = rows_failed + :rows_failed, \
                 heartbeat_at = :now \
                 where id = :id and status = 'IP' and session_id = :session"
            ),
            &[
                ("rows_read", SqlValue::from(rows_read)),
                ("rows_written", SqlValue::from(rows_written)),
                ("rows_failed", SqlValue::from(rows_failed)),
                ("now", SqlValue::from(Utc::now())),
                ("id", SqlValue::from(id)),
                ("session", SqlValue::from(session_id)),
            ],
        )
        .await?;
    if n == 0 {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

/// Publish a checkpoint value. Callers are responsible for monotonicity
/// (the run coordinator only publishes the committed frontier).
pub async fn set_checkpoint(
    store: &Store,
    id: i64,
    session_id: Uuid,
    value: &str,
) -> Result<(), StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let n = store
        .exec(
            &format!(
                "update {t} set checkpoint_value = :value, heartbeat_at = :now \
                 where id = :id and status = 'IP' and session_id = :session"
            ),
            &[
                ("value", SqlValue::from(value)),
                ("now", SqlValue::from(Utc::now())),
                ("id", SqlValue::from(id)),
                ("session", SqlValue::from(session_id)),
            ],
        )
        .await?;
    if n == 0 {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

/// Terminal transition by the owner. Releases the lease.
pub async fn finish(
    store: &Store,
    id: i64,
    session_id: Uuid,
    status: RunStatus,
    message: Option<&str>,
) -> Result<(), StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let n = store
        .exec(
            &format!(
                "update {t} set status = :status, message = :message, ended_at = :now \
                 where id = :id and status = 'IP' and session_id = :session"
            ),
            &[
                ("status", SqlValue::from(status.as_code())),
                ("message", SqlValue::from(message.map(str::to_string))),
                ("now", SqlValue::from(Utc::now())),
                ("id", SqlValue::from(id)),
                ("session", SqlValue::from(session_id)),
            ],
        )
        .await?;
    if n == 0 {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

/// Force-fail in-flight runs of a mapping: the STOP path, and the only
/// writer allowed to break someone else's lease. Returns how many rows
/// were flipped.
pub async fn mark_stopped(store: &Store, mapping_reference: &str) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    store
        .exec(
            &format!(
                "update {t} set status = 'FL', message = 'stopped', ended_at = :now \
                 where mapping_reference = :reference and status = 'IP'"
            ),
            &[
                ("now", SqlValue::from(Utc::now())),
                ("reference", SqlValue::from(mapping_reference)),
            ],
        )
        .await
}

pub async fn current_ip(
    store: &Store,
    mapping_reference: &str,
) -> Result<Option<RunLog>, StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let row = store
        .query_opt(
            &format!(
                "select {COLUMNS} from {t} \
                 where mapping_reference = :reference and status = 'IP'"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

pub async fn by_id(store: &Store, id: i64) -> Result<Option<RunLog>, StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let row = store
        .query_opt(
            &format!("select {COLUMNS} from {t} where id = :id"),
            &[("id", SqlValue::from(id))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

/// The last durable checkpoint of a mapping, across attempts. Authoritative
/// for resume.
pub async fn latest_checkpoint(
    store: &Store,
    mapping_reference: &str,
) -> Result<Option<String>, StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let row = store
        .query_opt(
            &format!(
                "select checkpoint_value from {t} \
                 where mapping_reference = :reference and checkpoint_value is not null \
                 order by id desc limit 1"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    match row {
        Some(r) => rows::opt_text(&r, "checkpoint_value"),
        None => Ok(None),
    }
}

/// End time of the most recent successful run, if any. Feeds the schedule's
/// `last_run_at`.
pub async fn last_completed_at(
    store: &Store,
    mapping_reference: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let row = store
        .query_opt(
            &format!(
                "select ended_at from {t} \
                 where mapping_reference = :reference and status = 'PC' \
                 order by id desc limit 1"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    match row {
        Some(r) => rows::opt_ts(&r, "ended_at"),
        None => Ok(None),
    }
}

pub async fn list(store: &Store, filter: &RunLogFilter) -> Result<Vec<RunLog>, StoreError> {
    let t = store.meta_object(tables::RUN_LOGS);
    let mut sql = format!("select {COLUMNS} from {t} where 1 = 1");
    let mut params: Vec<(&str, SqlValue)> = Vec::new();
    if let Some(reference) = &filter.mapping_reference {
        sql.push_str(" and mapping_reference = :reference");
        params.push(("reference", SqlValue::from(reference.as_str())));
    }
    if let Some(status) = filter.status {
        sql.push_str(" and status = :status");
        params.push(("status", SqlValue::from(status.as_code())));
    }
    sql.push_str(" order by id desc limit :limit");
    params.push(("limit", SqlValue::from(filter.limit.unwrap_or(100))));

    store.query(&sql, &params).await?.iter().map(decode).collect()
}

fn decode(row: &AnyRow) -> Result<RunLog, StoreError> {
    Ok(RunLog {
        id: rows::int(row, "id")?,
        mapping_reference: rows::text(row, "mapping_reference")?,
        session_id: rows::uuid(row, "session_id")?,
        status: rows::text(row, "status")?.parse::<RunStatus>()?,
        started_at: rows::ts(row, "started_at")?,
        ended_at: rows::opt_ts(row, "ended_at")?,
        heartbeat_at: rows::opt_ts(row, "heartbeat_at")?,
        rows_read: rows::int(row, "rows_read")?,
        rows_written: rows::int(row, "rows_written")?,
        rows_failed: rows::int(row, "rows_failed")?,
        message: rows::opt_text(row, "message")?,
        checkpoint_value: rows::opt_text(row, "checkpoint_value")?,
    })
}
