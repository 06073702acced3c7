//! Scenario: request claiming is exactly-once.
//!
//! # Invariant under test
//! A NEW request transitions to CLAIMED for exactly one claimant; a second
//! claimant sees only what the first left behind. Stuck CLAIMED rows go
//! back to NEW only through the janitor, and only once the claimant's
//! lease is provably expired.

use chrono::{Duration, Utc};
use dwl_schemas::codes::{RequestStatus, RequestType};
use dwl_schemas::RunPayload;
use dwl_store::requests::{self, RequestFilter};
use dwl_store::{fmt_ts, SqlValue};
use dwl_testkit::sqlite_harness;

#[tokio::test]
async fn claims_are_disjoint_and_ordered() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    for reference in ["M1", "M2", "M3"] {
        requests::enqueue(
            &h.store,
            &h.ids,
            RequestType::Run,
            reference,
            &RunPayload::regular(),
        )
        .await?;
    }

    let first = requests::claim_next(&h.store, "claimant-a", 2, Some(RequestType::Run)).await?;
    assert_eq!(first.len(), 2);
    // Queue order: oldest requests first.
    assert_eq!(first[0].mapping_reference, "M1");
    assert_eq!(first[1].mapping_reference, "M2");
    assert!(first.iter().all(|r| r.status == RequestStatus::Claimed));
    assert!(first
        .iter()
        .all(|r| r.claimant_id.as_deref() == Some("claimant-a")));

    // The second claimant gets only the remaining request.
    let second = requests::claim_next(&h.store, "claimant-b", 10, Some(RequestType::Run)).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].mapping_reference, "M3");

    // Nothing left.
    let third = requests::claim_next(&h.store, "claimant-c", 10, None).await?;
    assert!(third.is_empty());

    requests::complete(&h.store, first[0].id, RequestStatus::Done, None).await?;
    let done = requests::list(
        &h.store,
        &RequestFilter {
            status: Some(RequestStatus::Done),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, first[0].id);

    Ok(())
}

#[tokio::test]
async fn janitor_releases_only_expired_claims() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    let id = requests::enqueue(
        &h.store,
        &h.ids,
        RequestType::Run,
        "M1",
        &RunPayload::regular(),
    )
    .await?;
    let claimed = requests::claim_next(&h.store, "dead-claimant", 1, None).await?;
    assert_eq!(claimed.len(), 1);

    // A fresh claim is not touched.
    let released = requests::janitor_release(&h.store, Utc::now() - Duration::hours(2)).await?;
    assert_eq!(released, 0);

    // Backdate the claim beyond the stuck window: the janitor returns it.
    h.store
        .exec(
            "update dwl_requests set claimed_at = :old where id = :id",
            &[
                ("old", SqlValue::from(fmt_ts(Utc::now() - Duration::hours(3)))),
                ("id", SqlValue::from(id)),
            ],
        )
        .await?;
    let released = requests::janitor_release(&h.store, Utc::now() - Duration::hours(2)).await?;
    assert_eq!(released, 1);

    let reclaimed = requests::claim_next(&h.store, "claimant-b", 1, None).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);

    Ok(())
}

#[tokio::test]
async fn janitor_respects_a_live_lease() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    let id = requests::enqueue(
        &h.store,
        &h.ids,
        RequestType::Run,
        "M1",
        &RunPayload::regular(),
    )
    .await?;
    requests::claim_next(&h.store, "claimant-a", 1, None).await?;
    h.store
        .exec(
            "update dwl_requests set claimed_at = :old where id = :id",
            &[
                ("old", SqlValue::from(fmt_ts(Utc::now() - chrono::Duration::hours(3)))),
                ("id", SqlValue::from(id)),
            ],
        )
        .await?;

    // An IP run log with a fresh heartbeat is a live lease: hands off.
    let session = uuid::Uuid::new_v4();
    dwl_store::run_logs::open(&h.store, &h.ids, "M1", session).await?;

    let released = requests::janitor_release(&h.store, Utc::now() - Duration::hours(2)).await?;
    assert_eq!(released, 0);

    Ok(())
}

#[tokio::test]
async fn stop_and_run_pending_flags() -> anyhow::Result<()> {
    let h = sqlite_harness().await?;

    assert!(!requests::stop_pending(&h.store, "M1").await?);
    assert!(!requests::run_pending(&h.store, "M1").await?);

    requests::enqueue(&h.store, &h.ids, RequestType::Run, "M1", &RunPayload::regular()).await?;
    let stop_id =
        requests::enqueue(&h.store, &h.ids, RequestType::Stop, "M1", &RunPayload::regular())
            .await?;

    assert!(requests::run_pending(&h.store, "M1").await?);
    assert!(requests::stop_pending(&h.store, "M1").await?);

    // Claimed stops still count as pending; completed ones do not.
    requests::claim_next(&h.store, "claimant-a", 1, Some(RequestType::Stop)).await?;
    assert!(requests::stop_pending(&h.store, "M1").await?);
    requests::complete(&h.store, stop_id, RequestStatus::Done, None).await?;
    assert!(!requests::stop_pending(&h.store, "M1").await?);

    Ok(())
}
