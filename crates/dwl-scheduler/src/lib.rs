// crates/dwl-scheduler/src/lib.rs
//
// The scheduler process: a sync loop that turns active schedules into RUN
// requests when their fire time arrives, and a poll loop that claims
// requests and dispatches them into a bounded run pool. STOP requests are
// serviced first; a janitor returns stuck claims to the queue once their
// claimant's lease is provably gone.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use dwl_config::CoreConfig;
use dwl_engine::{EngineError, ExecutionEngine};
use dwl_schemas::codes::{RequestStatus, RequestType, RunStatus};
use dwl_schemas::{Request, RunPayload, Schedule};
use dwl_store::{job_flows, requests, run_logs, schedules, IdProvider, Store, StoreError};

pub mod next_run;

/// Requests claimed per poll tick.
const CLAIM_BATCH: i64 = 16;

pub struct Scheduler {
    config: CoreConfig,
    store: Store,
    ids: Arc<IdProvider>,
    engine: Arc<ExecutionEngine>,
    claimant_id: String,
    run_slots: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        config: CoreConfig,
        store: Store,
        ids: Arc<IdProvider>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        let run_slots = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            claimant_id: format!("dwl-scheduler-{}", Uuid::new_v4()),
            config,
            store,
            ids,
            engine,
            run_slots,
        }
    }

    pub fn claimant_id(&self) -> &str {
        &self.claimant_id
    }

    /// Spawn both loops. They share this scheduler and run until the
    /// process exits.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let sync = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(scheduler.config.sync_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.sync_tick(Utc::now()).await {
                        error!(error = %e, "sync tick failed");
                    }
                }
            })
        };
        let poll = {
            let scheduler = self;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(scheduler.config.poll_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.poll_tick().await {
                        error!(error = %e, "poll tick failed");
                    }
                }
            })
        };
        (sync, poll)
    }

    // -- sync loop -----------------------------------------------------------

    /// One pass over the active schedules: recompute fire times, enqueue
    /// what is due. Returns how many RUN requests were enqueued.
    pub async fn sync_tick(&self, now: chrono::DateTime<Utc>) -> Result<u32, StoreError> {
        let mut enqueued = 0u32;
        for schedule in schedules::all_active(&self.store).await? {
            match self.sync_schedule(&schedule, now).await {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        reference = %schedule.mapping_reference,
                        error = %e,
                        "schedule sync failed"
                    );
                }
            }
        }
        Ok(enqueued)
    }

    async fn sync_schedule(
        &self,
        schedule: &Schedule,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let next = next_run::next_run_at(schedule, now, self.config.tz);
        if next != schedule.next_run_at {
            schedules::set_next_run(&self.store, schedule.id, next).await?;
        }

        if !next_run::is_due(next, now) {
            return Ok(false);
        }
        // Single-flight: an in-flight run or a queued RUN suppresses the
        // enqueue; the fire time stays due and is retried next tick.
        if run_logs::current_ip(&self.store, &schedule.mapping_reference)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        if requests::run_pending(&self.store, &schedule.mapping_reference).await? {
            return Ok(false);
        }

        requests::enqueue(
            &self.store,
            &self.ids,
            RequestType::Run,
            &schedule.mapping_reference,
            &RunPayload::regular(),
        )
        .await?;

        // The slot is consumed: compute the occurrence after this one.
        let mut consumed = schedule.clone();
        consumed.last_run_at = Some(now);
        let following = next_run::next_run_at(&consumed, now, self.config.tz);
        schedules::set_next_run(&self.store, schedule.id, following).await?;

        info!(reference = %schedule.mapping_reference, "run enqueued by schedule");
        Ok(true)
    }

    // -- poll loop -----------------------------------------------------------

    /// One pass over the queue: janitor, then STOPs, then RUN dispatch.
    pub async fn poll_tick(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stop_stuck_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(7200));
        let released = requests::janitor_release(&self.store, cutoff).await?;
        if released > 0 {
            warn!(released, "janitor returned stuck claims to the queue");
        }

        for stop in
            requests::claim_next(&self.store, &self.claimant_id, CLAIM_BATCH, Some(RequestType::Stop))
                .await?
        {
            self.service_stop(&stop).await?;
        }

        let runs = requests::claim_next(
            &self.store,
            &self.claimant_id,
            CLAIM_BATCH,
            Some(RequestType::Run),
        )
        .await?;
        for run in runs {
            self.dispatch_run(run).await?;
        }
        Ok(())
    }

    /// STOP: signal a locally hosted run, then force-fail whatever IP row
    /// remains (covers the stalled and the cross-process case).
    async fn service_stop(&self, request: &Request) -> Result<(), StoreError> {
        let reference = &request.mapping_reference;
        let local = self.engine.request_local_stop(reference);
        let flipped = run_logs::mark_stopped(&self.store, reference).await?;
        info!(reference = %reference, local, flipped, "stop serviced");
        requests::complete(&self.store, request.id, RequestStatus::Done, None).await?;
        Ok(())
    }

    async fn dispatch_run(&self, request: Request) -> Result<(), StoreError> {
        let reference = request.mapping_reference.clone();

        // Dependency gate: a flow whose prerequisite is still in flight
        // goes back to the queue for a later tick.
        if let Some(flow) = job_flows::current(&self.store, &reference).await? {
            if let Some(dependency_id) = flow.dependency_id {
                if let Some(dependency) = job_flows::by_id(&self.store, dependency_id).await? {
                    if run_logs::current_ip(&self.store, &dependency.mapping_reference)
                        .await?
                        .is_some()
                    {
                        info!(
                            reference = %reference,
                            dependency = %dependency.mapping_reference,
                            "dependency in flight; run deferred"
                        );
                        return requests::release(&self.store, request.id).await;
                    }
                }
            }
        }

        let permit = Arc::clone(&self.run_slots)
            .acquire_owned()
            .await
            .expect("run pool open");
        let engine = Arc::clone(&self.engine);
        let store = self.store.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = engine.execute(&request.mapping_reference, &request.payload).await;
            if let Err(e) = conclude(&store, &request, outcome).await {
                error!(
                    reference = %request.mapping_reference,
                    error = %e,
                    "request conclusion failed"
                );
            }
        });
        Ok(())
    }
}

/// Map an execution outcome onto the request's terminal state and the
/// schedule bookkeeping.
async fn conclude(
    store: &Store,
    request: &Request,
    outcome: Result<dwl_engine::RunOutcome, EngineError>,
) -> Result<(), StoreError> {
    match outcome {
        Ok(run) if run.status == RunStatus::Complete => {
            schedules::record_run(store, &request.mapping_reference, Utc::now()).await?;
            requests::complete(store, request.id, RequestStatus::Done, run.message.as_deref())
                .await
        }
        Ok(run) => {
            requests::complete(
                store,
                request.id,
                RequestStatus::Failed,
                run.message.as_deref(),
            )
            .await
        }
        Err(EngineError::LeaseBusy) => {
            requests::complete(
                store,
                request.id,
                RequestStatus::Failed,
                Some("a run is already in flight"),
            )
            .await
        }
        Err(EngineError::LeaseLost) => {
            requests::complete(store, request.id, RequestStatus::Failed, Some("stopped")).await
        }
        Err(e) => {
            requests::complete(store, request.id, RequestStatus::Failed, Some(&e.to_string()))
                .await
        }
    }
}
