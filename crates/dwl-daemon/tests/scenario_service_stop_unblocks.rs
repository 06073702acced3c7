//! Scenario: STOP through the service facade.
//!
//! # Invariant under test
//! `enqueue_stop` plus one scheduler poll tick force-fails an in-flight
//! run with message "stopped", the projections reflect it, and a
//! subsequent RUN for the same mapping is accepted.

use std::sync::Arc;

use dwl_compiler::Compiler;
use dwl_daemon::service::Service;
use dwl_engine::ExecutionEngine;
use dwl_scheduler::Scheduler;
use dwl_schemas::codes::{RequestStatus, RequestType, RunStatus};
use dwl_schemas::RunPayload;
use dwl_store::requests::RequestFilter;
use dwl_store::run_logs::RunLogFilter;
use dwl_store::run_logs;
use dwl_testkit::{sqlite_harness, TEST_ACTOR};
use uuid::Uuid;

#[tokio::test]
async fn stop_through_the_facade_frees_the_mapping() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let compiler = Compiler::new(
        h.store.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        TEST_ACTOR,
    );
    let service = Service::new(h.store.clone(), Arc::clone(&h.ids), compiler);
    let engine = Arc::new(ExecutionEngine::new(
        h.config.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        TEST_ACTOR,
    ));
    let scheduler = Scheduler::new(
        h.config.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        engine,
    );

    // An in-flight run holds the lease.
    let run_id = run_logs::open(&h.store, &h.ids, "CUST_DIM", Uuid::new_v4())
        .await?
        .expect("lease acquired");

    let stop_id = service.enqueue_stop("CUST_DIM").await?;
    scheduler.poll_tick().await?;

    // The run-log projection shows the distinguished terminal state.
    let logs = service
        .run_logs(RunLogFilter {
            mapping_reference: Some("CUST_DIM".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].id, run_id);
    assert_eq!(logs[0].status, RunStatus::Failed);
    assert_eq!(logs[0].message.as_deref(), Some("stopped"));

    // The STOP request is serviced.
    let done = service
        .requests(RequestFilter {
            status: Some(RequestStatus::Done),
            ..Default::default()
        })
        .await?;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, stop_id);
    assert_eq!(done[0].request_type, RequestType::Stop);

    // The mapping is runnable again: a fresh RUN queues and the lease is
    // free.
    service.enqueue_run("CUST_DIM", RunPayload::regular()).await?;
    assert!(dwl_store::requests::run_pending(&h.store, "CUST_DIM").await?);
    assert!(run_logs::open(&h.store, &h.ids, "CUST_DIM", Uuid::new_v4())
        .await?
        .is_some());

    Ok(())
}
