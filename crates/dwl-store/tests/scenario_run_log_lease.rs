//! Scenario: the IP run-log row is the per-mapping lease.
//!
//! # Invariant under test
//! At most one IP row per mapping; every owner write is compare-and-set on
//! (id, IP, session) and loses cleanly once the row is taken away.

use dwl_schemas::codes::RunStatus;
use dwl_store::{run_logs, StoreError};
use dwl_testkit::sqlite_harness;
use uuid::Uuid;

#[tokio::test]
async fn second_open_is_refused_while_in_flight() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    let session_a = Uuid::new_v4();
    let first = run_logs::open(&h.store, &h.ids, "M1", session_a).await?;
    assert!(first.is_some());

    // Same mapping: lease busy.
    let second = run_logs::open(&h.store, &h.ids, "M1", Uuid::new_v4()).await?;
    assert!(second.is_none());

    // Other mappings are unaffected.
    assert!(run_logs::open(&h.store, &h.ids, "M2", Uuid::new_v4())
        .await?
        .is_some());

    // Finishing releases the lease; the mapping can run again.
    run_logs::finish(
        &h.store,
        first.unwrap(),
        session_a,
        RunStatus::Complete,
        None,
    )
    .await?;
    assert!(run_logs::open(&h.store, &h.ids, "M1", Uuid::new_v4())
        .await?
        .is_some());

    Ok(())
}

#[tokio::test]
async fn writes_with_a_foreign_session_lose_the_lease() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    let owner = Uuid::new_v4();
    let id = run_logs::open(&h.store, &h.ids, "M1", owner)
        .await?
        .expect("lease acquired");

    run_logs::heartbeat(&h.store, id, owner).await?;
    run_logs::add_progress(&h.store, id, owner, 100, 90, 10).await?;
    run_logs::set_checkpoint(&h.store, id, owner, "430").await?;

    let intruder = Uuid::new_v4();
    assert!(matches!(
        run_logs::heartbeat(&h.store, id, intruder).await,
        Err(StoreError::LeaseLost)
    ));
    assert!(matches!(
        run_logs::finish(&h.store, id, intruder, RunStatus::Complete, None).await,
        Err(StoreError::LeaseLost)
    ));

    let log = run_logs::by_id(&h.store, id).await?.expect("row exists");
    assert_eq!(log.rows_read, 100);
    assert_eq!(log.rows_written, 90);
    assert_eq!(log.rows_failed, 10);
    assert_eq!(log.checkpoint_value.as_deref(), Some("430"));
    assert_eq!(log.status, RunStatus::InProgress);

    Ok(())
}

#[tokio::test]
async fn stop_breaks_the_lease_and_the_owner_notices() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    let owner = Uuid::new_v4();
    let id = run_logs::open(&h.store, &h.ids, "M1", owner)
        .await?
        .expect("lease acquired");

    let flipped = run_logs::mark_stopped(&h.store, "M1").await?;
    assert_eq!(flipped, 1);

    let log = run_logs::by_id(&h.store, id).await?.expect("row exists");
    assert_eq!(log.status, RunStatus::Failed);
    assert_eq!(log.message.as_deref(), Some("stopped"));
    assert!(log.ended_at.is_some());

    // The former owner's next write is a lost lease, not a silent success.
    assert!(matches!(
        run_logs::set_checkpoint(&h.store, id, owner, "500").await,
        Err(StoreError::LeaseLost)
    ));

    // The mapping is immediately runnable again.
    assert!(run_logs::open(&h.store, &h.ids, "M1", Uuid::new_v4())
        .await?
        .is_some());

    Ok(())
}

#[tokio::test]
async fn latest_checkpoint_spans_attempts() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    assert_eq!(run_logs::latest_checkpoint(&h.store, "M1").await?, None);

    let s1 = Uuid::new_v4();
    let first = run_logs::open(&h.store, &h.ids, "M1", s1).await?.unwrap();
    run_logs::set_checkpoint(&h.store, first, s1, "430").await?;
    run_logs::finish(&h.store, first, s1, RunStatus::Failed, Some("stopped")).await?;

    assert_eq!(
        run_logs::latest_checkpoint(&h.store, "M1").await?.as_deref(),
        Some("430")
    );

    // A later attempt without a checkpoint write does not clobber it.
    let s2 = Uuid::new_v4();
    let second = run_logs::open(&h.store, &h.ids, "M1", s2).await?.unwrap();
    run_logs::finish(&h.store, second, s2, RunStatus::Failed, Some("boom")).await?;
    assert_eq!(
        run_logs::latest_checkpoint(&h.store, "M1").await?.as_deref(),
        Some("430")
    );

    // A further attempt that advances it wins.
    let s3 = Uuid::new_v4();
    let third = run_logs::open(&h.store, &h.ids, "M1", s3).await?.unwrap();
    run_logs::set_checkpoint(&h.store, third, s3, "1000").await?;
    run_logs::finish(&h.store, third, s3, RunStatus::Complete, None).await?;
    assert_eq!(
        run_logs::latest_checkpoint(&h.store, "M1").await?.as_deref(),
        Some("1000")
    );

    Ok(())
}
