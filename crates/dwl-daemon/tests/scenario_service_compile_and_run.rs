//! Scenario: the typed service facade, end to end.
//!
//! # Invariants under test
//! - `compile_mapping` validates and produces the current job flow, and is
//!   idempotent for an unchanged mapping;
//! - `enqueue_run` feeds the scheduler's poll loop, which executes the
//!   flow to completion;
//! - `run_logs` / `requests` are faithful read-only projections of the
//!   run's lifecycle.

use std::sync::Arc;
use std::time::Duration;

use dwl_compiler::{Compiler, CompilerError};
use dwl_daemon::service::Service;
use dwl_engine::ExecutionEngine;
use dwl_scheduler::Scheduler;
use dwl_schemas::codes::{RequestStatus, RunStatus};
use dwl_schemas::{RunLog, RunPayload};
use dwl_store::requests::RequestFilter;
use dwl_store::run_logs::RunLogFilter;
use dwl_store::job_flows;
use dwl_testkit::{detail_draft, mapping_draft, sqlite_harness, TestHarness, TEST_ACTOR};

const SOURCE_SQL: &str = "select id, name from customers";

fn service_for(h: &TestHarness) -> Service {
    let compiler = Compiler::new(
        h.store.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        TEST_ACTOR,
    );
    Service::new(h.store.clone(), Arc::clone(&h.ids), compiler)
}

fn scheduler_for(h: &TestHarness) -> Scheduler {
    let engine = Arc::new(ExecutionEngine::new(
        h.config.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        TEST_ACTOR,
    ));
    Scheduler::new(
        h.config.clone(),
        h.store.clone(),
        Arc::clone(&h.ids),
        engine,
    )
}

async fn seed_mapping(h: &TestHarness, service: &Service) -> anyhow::Result<()> {
    h.seed_source("customers", &[(1, "Ada"), (2, "Bob")]).await?;
    h.create_target("customer_dim", &[("cust_id", "integer"), ("cust_name", "text")])
        .await?;
    service
        .compiler()
        .upsert_mapping(&mapping_draft("CUST_DIM", "customer_dim"))
        .await?;
    service
        .compiler()
        .upsert_mapping_detail(&detail_draft(
            "CUST_DIM", "cust_id", "id", SOURCE_SQL, Some(1), 1,
        ))
        .await?;
    service
        .compiler()
        .upsert_mapping_detail(&detail_draft(
            "CUST_DIM", "cust_name", "name", SOURCE_SQL, None, 2,
        ))
        .await?;
    Ok(())
}

/// The dispatch is asynchronous; poll the projection until the run leaves
/// IP (or give up).
async fn wait_for_terminal_run(service: &Service, reference: &str) -> anyhow::Result<RunLog> {
    for _ in 0..200 {
        let logs = service
            .run_logs(RunLogFilter {
                mapping_reference: Some(reference.to_string()),
                ..Default::default()
            })
            .await?;
        if let Some(log) = logs.iter().find(|l| l.status != RunStatus::InProgress) {
            return Ok(log.clone());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("run never reached a terminal state");
}

#[tokio::test]
async fn compile_through_the_facade_is_idempotent() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let service = service_for(&h);
    seed_mapping(&h, &service).await?;

    let flow_id = service.compile_mapping("CUST_DIM").await?;
    let flow = job_flows::current(&h.store, "CUST_DIM").await?.unwrap();
    assert_eq!(flow.id, flow_id);

    // Unchanged mapping: same current flow row.
    assert_eq!(service.compile_mapping("CUST_DIM").await?, flow_id);
    assert_eq!(h.count("select count(*) as n from dwl_job_flows").await?, 1);

    // A mapping that does not exist is a structured rejection, not a crash.
    let err = service.compile_mapping("NO_SUCH_MAPPING").await.unwrap_err();
    assert!(matches!(err, CompilerError::Validation(_)));

    Ok(())
}

#[tokio::test]
async fn enqueued_run_is_dispatched_and_projected() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let service = service_for(&h);
    seed_mapping(&h, &service).await?;
    service.compile_mapping("CUST_DIM").await?;

    let request_id = service.enqueue_run("CUST_DIM", RunPayload::regular()).await?;
    let queued = service
        .requests(RequestFilter {
            status: Some(RequestStatus::New),
            ..Default::default()
        })
        .await?;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, request_id);

    // One poll tick claims and dispatches it.
    let scheduler = scheduler_for(&h);
    scheduler.poll_tick().await?;

    let log = wait_for_terminal_run(&service, "CUST_DIM").await?;
    assert_eq!(log.status, RunStatus::Complete);
    assert_eq!(log.rows_read, 2);
    assert_eq!(log.rows_written, 2);
    assert_eq!(h.count("select count(*) as n from customer_dim").await?, 2);

    // The request reaches its terminal state once the run concludes.
    for _ in 0..200 {
        let done = service
            .requests(RequestFilter {
                status: Some(RequestStatus::Done),
                ..Default::default()
            })
            .await?;
        if done.iter().any(|r| r.id == request_id) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("request never completed");
}

#[tokio::test]
async fn projections_filter_by_mapping_and_status() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;
    let service = service_for(&h);
    seed_mapping(&h, &service).await?;
    service.compile_mapping("CUST_DIM").await?;

    service.enqueue_run("CUST_DIM", RunPayload::regular()).await?;
    service.enqueue_stop("OTHER_MAPPING").await?;

    let for_mapping = service
        .requests(RequestFilter {
            mapping_reference: Some("CUST_DIM".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(for_mapping.len(), 1);

    // No runs yet: the run-log projection is empty, not an error.
    let logs = service
        .run_logs(RunLogFilter {
            mapping_reference: Some("CUST_DIM".to_string()),
            ..Default::default()
        })
        .await?;
    assert!(logs.is_empty());

    Ok(())
}
