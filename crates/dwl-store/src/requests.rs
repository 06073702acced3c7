//! The durable request queue. Producers append; the scheduler claims.
//!
//! Claiming is exactly-once: on Postgres the claim rides
//! `for update skip locked`, on SQLite the single-writer UPDATE is already
//! race-free. A janitor may return stuck CLAIMED rows to NEW, but only
//! after verifying the previous claimant's lease has expired (no fresh
//! heartbeat on an in-flight run log).

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;

use dwl_schemas::codes::{LoadType, RequestStatus, RequestType};
use dwl_schemas::{HistoryWindow, Request, RunPayload};

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows::{self, yn};
use crate::sql::SqlValue;
use crate::store::{tables, Store};

const COLUMNS: &str = "id, mapping_reference, request_type, load_type, history_start, \
     history_end, history_truncate, status, message, requested_at, claimed_at, \
     completed_at, claimant_id";

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub mapping_reference: Option<String>,
    pub status: Option<RequestStatus>,
    pub limit: Option<i64>,
}

pub async fn enqueue(
    store: &Store,
    ids: &IdProvider,
    request_type: RequestType,
    mapping_reference: &str,
    payload: &RunPayload,
) -> Result<i64, StoreError> {
    let id = ids.next_id(entity::REQUEST).await?;
    let t = store.meta_object(tables::REQUESTS);
    let history = payload.history.as_ref();
    store
        .exec(
            &format!(
                "insert into {t} (id, mapping_reference, request_type, load_type, \
                 history_start, history_end, history_truncate, status, requested_at) \
                 values (:id, :reference, :request_type, :load_type, :history_start, \
                 :history_end, :history_truncate, 'NEW', :now)"
            ),
            &[
                ("id", SqlValue::from(id)),
                ("reference", SqlValue::from(mapping_reference)),
                ("request_type", SqlValue::from(request_type.as_code())),
                ("load_type", SqlValue::from(payload.load_type.as_code())),
                ("history_start", SqlValue::from(history.map(|h| h.start_date))),
                ("history_end", SqlValue::from(history.map(|h| h.end_date))),
                (
                    "history_truncate",
                    SqlValue::from(history.map(|h| yn(h.truncate).to_string())),
                ),
                ("now", SqlValue::from(Utc::now())),
            ],
        )
        .await?;
    Ok(id)
}

/// Claim up to `max_n` NEW requests in `requested_at` order, oldest first,
/// optionally restricted to one request type (the poll loop services STOP
/// before RUN).
pub async fn claim_next(
    store: &Store,
    claimant_id: &str,
    max_n: i64,
    request_type: Option<RequestType>,
) -> Result<Vec<Request>, StoreError> {
    let t = store.meta_object(tables::REQUESTS);
    let type_filter = match request_type {
        Some(_) => " and request_type = :request_type",
        None => "",
    };

    let sql = if store.dialect().supports_skip_locked() {
        format!(
            "with to_claim as (\
                 select id from {t} \
                 where status = 'NEW'{type_filter} \
                 order by requested_at asc, id asc \
                 limit :max_n \
                 for update skip locked\
             ) \
             update {t} \
                set status = 'CLAIMED', claimant_id = :claimant, claimed_at = :now \
              where id in (select id from to_claim) \
             returning {COLUMNS}"
        )
    } else {
        format!(
            "update {t} \
                set status = 'CLAIMED', claimant_id = :claimant, claimed_at = :now \
              where id in (\
                 select id from {t} \
                 where status = 'NEW'{type_filter} \
                 order by requested_at asc, id asc \
                 limit :max_n\
              ) \
             returning {COLUMNS}"
        )
    };

    let mut params = vec![
        ("max_n", SqlValue::from(max_n)),
        ("claimant", SqlValue::from(claimant_id)),
        ("now", SqlValue::from(Utc::now())),
    ];
    if let Some(rt) = request_type {
        params.push(("request_type", SqlValue::from(rt.as_code())));
    }

    let mut claimed: Vec<Request> = store
        .query(&sql, &params)
        .await?
        .iter()
        .map(decode)
        .collect::<Result<_, _>>()?;
    // RETURNING order is not guaranteed; restore queue order.
    claimed.sort_by_key(|r| (r.requested_at, r.id));
    Ok(claimed)
}

pub async fn complete(
    store: &Store,
    id: i64,
    status: RequestStatus,
    message: Option<&str>,
) -> Result<(), StoreError> {
    let t = store.meta_object(tables::REQUESTS);
    store
        .exec(
            &format!(
                "update {t} set status = :status, message = :message, completed_at = :now \
                 where id = :id"
            ),
            &[
                ("status", SqlValue::from(status.as_code())),
                ("message", SqlValue::from(message.map(str::to_string))),
                ("now", SqlValue::from(Utc::now())),
                ("id", SqlValue::from(id)),
            ],
        )
        .await?;
    Ok(())
}

/// Whether a RUN for this mapping is already waiting or claimed. The sync
/// loop checks this before enqueueing, so a slow poll loop does not pile
/// up duplicate work items.
pub async fn run_pending(store: &Store, mapping_reference: &str) -> Result<bool, StoreError> {
    let t = store.meta_object(tables::REQUESTS);
    let row = store
        .query_opt(
            &format!(
                "select id from {t} \
                 where mapping_reference = :reference and request_type = 'RUN' \
                 and status in ('NEW', 'CLAIMED') \
                 limit 1"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    Ok(row.is_some())
}

/// Hand a claimed request back to the queue untouched (e.g. its dependency
/// is still in flight).
pub async fn release(store: &Store, id: i64) -> Result<(), StoreError> {
    let t = store.meta_object(tables::REQUESTS);
    store
        .exec(
            &format!(
                "update {t} set status = 'NEW', claimant_id = null, claimed_at = null \
                 where id = :id and status = 'CLAIMED'"
            ),
            &[("id", SqlValue::from(id))],
        )
        .await?;
    Ok(())
}

/// Whether a STOP for this mapping is outstanding. Executors poll this
/// between chunks.
pub async fn stop_pending(store: &Store, mapping_reference: &str) -> Result<bool, StoreError> {
    let t = store.meta_object(tables::REQUESTS);
    let row = store
        .query_opt(
            &format!(
                "select id from {t} \
                 where mapping_reference = :reference and request_type = 'STOP' \
                 and status in ('NEW', 'CLAIMED') \
                 limit 1"
            ),
            &[("reference", SqlValue::from(mapping_reference))],
        )
        .await?;
    Ok(row.is_some())
}

/// Return stuck CLAIMED rows to NEW once the claimant's lease is provably
/// gone: claimed before the cutoff and no in-flight run log with a
/// heartbeat after it.
pub async fn janitor_release(store: &Store, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::REQUESTS);
    let rl = store.meta_object(tables::RUN_LOGS);
    store
        .exec(
            &format!(
                "update {t} \
                    set status = 'NEW', claimant_id = null, claimed_at = null \
                  where status = 'CLAIMED' \
                    and claimed_at < :cutoff \
                    and not exists (\
                        select 1 from {rl} rl \
                        where rl.mapping_reference = {t}.mapping_reference \
                          and rl.status = 'IP' \
                          and rl.heartbeat_at > :cutoff\
                    )"
            ),
            &[("cutoff", SqlValue::from(cutoff))],
        )
        .await
}

pub async fn list(store: &Store, filter: &RequestFilter) -> Result<Vec<Request>, StoreError> {
    let t = store.meta_object(tables::REQUESTS);
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
    sql.push_str(" order by requested_at desc, id desc limit :limit");
    params.push(("limit", SqlValue::from(filter.limit.unwrap_or(100))));

    store.query(&sql, &params).await?.iter().map(decode).collect()
}

fn decode(row: &AnyRow) -> Result<Request, StoreError> {
    let history = match (
        rows::opt_date(row, "history_start")?,
        rows::opt_date(row, "history_end")?,
    ) {
        (Some(start_date), Some(end_date)) => Some(HistoryWindow {
            start_date,
            end_date,
            truncate: rows::opt_flag(row, "history_truncate")?.unwrap_or(false),
        }),
        _ => None,
    };

    Ok(Request {
        id: rows::int(row, "id")?,
        mapping_reference: rows::text(row, "mapping_reference")?,
        request_type: rows::text(row, "request_type")?.parse::<RequestType>()?,
        payload: RunPayload {
            load_type: rows::text(row, "load_type")?.parse::<LoadType>()?,
            history,
        },
        status: rows::text(row, "status")?.parse::<RequestStatus>()?,
        message: rows::opt_text(row, "message")?,
        requested_at: rows::ts(row, "requested_at")?,
        claimed_at: rows::opt_ts(row, "claimed_at")?,
        completed_at: rows::opt_ts(row, "completed_at")?,
        claimant_id: rows::opt_text(row, "claimant_id")?,
    })
}
