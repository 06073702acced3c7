//! Schedule persistence. Not historized: the scheduler mutates
//! `last_run_at` / `next_run_at` in place on every sync tick.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;

use dwl_schemas::codes::{FrequencyCode, StatusFlag};
use dwl_schemas::{Schedule, ScheduleDraft};

use crate::error::StoreError;
use crate::ids::{entity, IdProvider};
use crate::rows;
use crate::sql::SqlValue;
use crate::store::{tables, Store};

const COLUMNS: &str = "id, job_flow_id, mapping_reference, frequency_code, frequency_day, \
     hour_of_day, minute_of_hour, start_date, end_date, status_flag, last_run_at, \
     next_run_at, created_at, updated_at";

pub async fn for_mapping(store: &Store, reference: &str) -> Result<Option<Schedule>, StoreError> {
    let t = store.meta_object(tables::SCHEDULES);
    let row = store
        .query_opt(
            &format!("select {COLUMNS} from {t} where mapping_reference = :reference"),
            &[("reference", SqlValue::from(reference))],
        )
        .await?;
    row.map(|r| decode(&r)).transpose()
}

/// Schedules the sync loop walks: active on both the schedule and its
/// mapping.
pub async fn all_active(store: &Store) -> Result<Vec<Schedule>, StoreError> {
    let t = store.meta_object(tables::SCHEDULES);
    let m = store.meta_object(tables::MAPPINGS);
    let rows = store
        .query(
            &format!(
                "select s.id, s.job_flow_id, s.mapping_reference, s.frequency_code, \
                        s.frequency_day, s.hour_of_day, s.minute_of_hour, s.start_date, \
                        s.end_date, s.status_flag, s.last_run_at, s.next_run_at, \
                        s.created_at, s.updated_at \
                 from {t} s \
                 join {m} m on m.reference = s.mapping_reference and m.current_flag = 'Y' \
                 where s.status_flag = 'A' and m.status_flag = 'A' \
                 order by s.mapping_reference"
            ),
            &[],
        )
        .await?;
    rows.iter().map(decode).collect()
}

/// Create or replace the single schedule of a mapping (created/updated
/// together with the mapping).
pub async fn upsert(
    store: &Store,
    ids: &IdProvider,
    job_flow_id: i64,
    draft: &ScheduleDraft,
) -> Result<i64, StoreError> {
    let t = store.meta_object(tables::SCHEDULES);
    let now = Utc::now();

    if let Some(existing) = for_mapping(store, &draft.mapping_reference).await? {
        store
            .exec(
                &format!(
                    "update {t} set job_flow_id = :job_flow_id, frequency_code = :frequency_code, \
                     frequency_day = :frequency_day, hour_of_day = :hour_of_day, \
                     minute_of_hour = :minute_of_hour, start_date = :start_date, \
                     end_date = :end_date, status_flag = :status_flag, \
                     next_run_at = null, updated_at = :now \
                     where id = :id"
                ),
                &[
                    ("job_flow_id", SqlValue::from(job_flow_id)),
                    (
                        "frequency_code",
                        SqlValue::from(draft.frequency_code.as_code()),
                    ),
                    ("frequency_day", SqlValue::from(draft.frequency_day.clone())),
                    ("hour_of_day", SqlValue::from(i64::from(draft.hour_of_day))),
                    (
                        "minute_of_hour",
                        SqlValue::from(i64::from(draft.minute_of_hour)),
                    ),
                    ("start_date", SqlValue::from(draft.start_date)),
                    ("end_date", SqlValue::from(draft.end_date)),
                    ("status_flag", SqlValue::from(draft.status_flag.as_code())),
                    ("now", SqlValue::from(now)),
                    ("id", SqlValue::from(existing.id)),
                ],
            )
            .await?;
        return Ok(existing.id);
    }

    let id = ids.next_id(entity::SCHEDULE).await?;
    store
        .exec(
            &format!(
                "insert into {t} ({COLUMNS}) values (\
                 :id, :job_flow_id, :reference, :frequency_code, :frequency_day, \
                 :hour_of_day, :minute_of_hour, :start_date, :end_date, :status_flag, \
                 null, null, :now, :now2)"
            ),
            &[
                ("id", SqlValue::from(id)),
                ("job_flow_id", SqlValue::from(job_flow_id)),
                ("reference", SqlValue::from(draft.mapping_reference.as_str())),
                (
                    "frequency_code",
                    SqlValue::from(draft.frequency_code.as_code()),
                ),
                ("frequency_day", SqlValue::from(draft.frequency_day.clone())),
                ("hour_of_day", SqlValue::from(i64::from(draft.hour_of_day))),
                (
                    "minute_of_hour",
                    SqlValue::from(i64::from(draft.minute_of_hour)),
                ),
                ("start_date", SqlValue::from(draft.start_date)),
                ("end_date", SqlValue::from(draft.end_date)),
                ("status_flag", SqlValue::from(draft.status_flag.as_code())),
                ("now", SqlValue::from(now)),
                ("now2", SqlValue::from(now)),
            ],
        )
        .await?;
    Ok(id)
}

pub async fn set_next_run(
    store: &Store,
    id: i64,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    let t = store.meta_object(tables::SCHEDULES);
    store
        .exec(
            &format!(
                "update {t} set next_run_at = :next_run_at, updated_at = :now where id = :id"
            ),
            &[
                ("next_run_at", SqlValue::from(next_run_at)),
                ("now", SqlValue::from(Utc::now())),
                ("id", SqlValue::from(id)),
            ],
        )
        .await?;
    Ok(())
}

/// After a successful run: `last_run_at` takes the run's end time and the
/// next fire time is recomputed by the caller.
pub async fn record_run(
    store: &Store,
    reference: &str,
    last_run_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let t = store.meta_object(tables::SCHEDULES);
    store
        .exec(
            &format!(
                "update {t} set last_run_at = :last_run_at, updated_at = :now \
                 where mapping_reference = :reference"
            ),
            &[
                ("last_run_at", SqlValue::from(last_run_at)),
                ("now", SqlValue::from(Utc::now())),
                ("reference", SqlValue::from(reference)),
            ],
        )
        .await?;
    Ok(())
}

pub async fn delete_for(store: &Store, reference: &str) -> Result<u64, StoreError> {
    let t = store.meta_object(tables::SCHEDULES);
    store
        .exec(
            &format!("delete from {t} where mapping_reference = :reference"),
            &[("reference", SqlValue::from(reference))],
        )
        .await
}

fn decode(row: &AnyRow) -> Result<Schedule, StoreError> {
    Ok(Schedule {
        id: rows::int(row, "id")?,
        job_flow_id: rows::int(row, "job_flow_id")?,
        mapping_reference: rows::text(row, "mapping_reference")?,
        frequency_code: rows::text(row, "frequency_code")?.parse::<FrequencyCode>()?,
        frequency_day: rows::opt_text(row, "frequency_day")?,
        hour_of_day: rows::int(row, "hour_of_day")? as u32,
        minute_of_hour: rows::int(row, "minute_of_hour")? as u32,
        start_date: rows::date(row, "start_date")?,
        end_date: rows::opt_date(row, "end_date")?,
        status_flag: rows::text(row, "status_flag")?.parse::<StatusFlag>()?,
        last_run_at: rows::opt_ts(row, "last_run_at")?,
        next_run_at: rows::opt_ts(row, "next_run_at")?,
    })
}
