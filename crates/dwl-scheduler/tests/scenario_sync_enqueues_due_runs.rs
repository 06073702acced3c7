//! Scenario: the sync loop turns due schedules into RUN requests.
//!
//! # Invariants under test
//! - a schedule that is not yet due gets its next fire time computed but
//!   no request (weekly Monday 09:30 seen on a Wednesday);
//! - a due schedule enqueues exactly one RUN, even across repeated ticks;
//! - an in-flight run suppresses the enqueue.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use dwl_compiler::Compiler;
use dwl_engine::ExecutionEngine;
use dwl_scheduler::Scheduler;
use dwl_schemas::codes::{FrequencyCode, RequestStatus};
use dwl_store::requests::RequestFilter;
use dwl_store::{requests, run_logs, schedules};
use dwl_testkit::{
    detail_draft, mapping_draft, schedule_draft, sqlite_harness, TestHarness, TEST_ACTOR,
};

const SOURCE_SQL: &str = "select id, name from customers";

async fn scheduler_with_mapping(
    h: &TestHarness,
    frequency: FrequencyCode,
    frequency_day: Option<&str>,
) -> anyhow::Result<Arc<Scheduler>> {
    let compiler = Compiler::new(
        h.store.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        TEST_ACTOR,
    );
    h.seed_source("customers", &[(1, "Ada")]).await?;
    h.create_target("customer_dim", &[("cust_id", "integer"), ("cust_name", "text")])
        .await?;
    compiler
        .upsert_mapping(&mapping_draft("CUST_DIM", "customer_dim"))
        .await?;
    compiler
        .upsert_mapping_detail(&detail_draft(
            "CUST_DIM", "cust_id", "id", SOURCE_SQL, Some(1), 1,
        ))
        .await?;
    compiler.compile("CUST_DIM").await?;
    compiler.activate("CUST_DIM").await?;

    let mut schedule = schedule_draft("CUST_DIM", frequency);
    schedule.frequency_day = frequency_day.map(str::to_string);
    compiler.upsert_schedule(&schedule).await?;

    let engine = Arc::new(ExecutionEngine::new(
        h.config.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        TEST_ACTOR,
    ));
    Ok(Arc::new(Scheduler::new(
        h.config.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        engine,
    )))
}

#[tokio::test]
async fn weekly_schedule_waits_for_its_monday() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let scheduler = scheduler_with_mapping(&h, FrequencyCode::Weekly, Some("MON")).await?;

    // Wednesday 2026-07-29 10:00 UTC.
    let now = Utc.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap();
    let enqueued = scheduler.sync_tick(now).await?;
    assert_eq!(enqueued, 0);

    let schedule = schedules::for_mapping(&h.store, "CUST_DIM").await?.unwrap();
    // Next Monday 09:30.
    assert_eq!(
        schedule.next_run_at,
        Some(Utc.with_ymd_and_hms(2026, 8, 3, 9, 30, 0).unwrap())
    );
    assert!(!requests::run_pending(&h.store, "CUST_DIM").await?);

    Ok(())
}

#[tokio::test]
async fn due_schedule_enqueues_exactly_once() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let scheduler = scheduler_with_mapping(&h, FrequencyCode::Daily, None).await?;

    // Past 09:30: due.
    let now = Utc.with_ymd_and_hms(2026, 7, 29, 9, 30, 0).unwrap();
    assert_eq!(scheduler.sync_tick(now).await?, 1);
    assert!(requests::run_pending(&h.store, "CUST_DIM").await?);

    // The slot was consumed: next fire time moved to tomorrow.
    let schedule = schedules::for_mapping(&h.store, "CUST_DIM").await?.unwrap();
    assert_eq!(
        schedule.next_run_at,
        Some(Utc.with_ymd_and_hms(2026, 7, 30, 9, 30, 0).unwrap())
    );

    // Second tick while the request sits in the queue: no duplicate.
    assert_eq!(scheduler.sync_tick(now).await?, 0);
    let all = requests::list(
        &h.store,
        &RequestFilter {
            status: Some(RequestStatus::New),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(all.len(), 1);

    Ok(())
}

#[tokio::test]
async fn in_flight_run_suppresses_the_enqueue() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let scheduler = scheduler_with_mapping(&h, FrequencyCode::Daily, None).await?;

    run_logs::open(&h.store, &h.ids, "CUST_DIM", uuid::Uuid::new_v4())
        .await?
        .expect("lease acquired");

    let now = Utc.with_ymd_and_hms(2026, 7, 29, 9, 30, 0).unwrap();
    assert_eq!(scheduler.sync_tick(now).await?, 0);
    assert!(!requests::run_pending(&h.store, "CUST_DIM").await?);

    Ok(())
}
