// crates/dwl-engine/src/lib.rs
//
// Execution of one compiled job flow: plan -> chunk -> transform -> SCD
// merge, with checkpointed resume, bounded parallel workers, retry,
// cooperative stop, and run-log progress. One call to
// `ExecutionEngine::execute` is one execution attempt, exactly one run-log
// row.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use dwl_config::CoreConfig;
use dwl_schemas::codes::RunStatus;
use dwl_schemas::{CompiledFlow, RunPayload};
use dwl_store::sql::decode_row;
use dwl_store::{fmt_ts, job_flows, run_logs, IdProvider, SqlValue, Store, StoreError};

pub mod checkpoint;
pub mod expr;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod scd;
pub mod transform;

use checkpoint::{build_source_query, ResumeMode, SourceQuery};
use plan::{chunk_conditions, Chunk, ChunkSpec, Plan, PlanLimits};
use progress::ProgressTracker;
use retry::RetryHandler;
use scd::{Merger, Scd2Batch};
use transform::RowTransformer;

/// Consecutive distinct-chunk failures that escalate to run failure.
const MAX_CONSECUTIVE_CHUNK_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(StoreError),

    /// Another attempt holds the mapping's lease.
    #[error("a run is already in flight for this mapping")]
    LeaseBusy,

    /// Our IP row is gone (stop or janitor). Exit without further writes.
    #[error("run-log lease lost")]
    LeaseLost,

    /// Cooperative stop observed. Graceful: FL + "stopped".
    #[error("stop requested")]
    Stopped,

    #[error("no compiled job flow for mapping {0}")]
    MissingFlow(String),

    #[error("bad run request: {0}")]
    BadRequest(String),

    #[error("run timed out")]
    Timeout,
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LeaseLost => EngineError::LeaseLost,
            other => EngineError::Store(other),
        }
    }
}

/// Result of one execution attempt, mirrored in the run log.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_log_id: i64,
    pub status: RunStatus,
    pub rows_read: i64,
    pub rows_written: i64,
    pub rows_failed: i64,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct Totals {
    read: i64,
    written: i64,
    failed: i64,
    errors: Vec<String>,
}

pub struct ExecutionEngine {
    config: CoreConfig,
    meta: Store,
    ids: Arc<IdProvider>,
    actor: String,
    /// In-process stop flags, keyed by mapping reference. The dispatcher
    /// raises these when it services a STOP for a run hosted here.
    local_stops: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl ExecutionEngine {
    pub fn new(config: CoreConfig, meta: Store, ids: Arc<IdProvider>, actor: &str) -> Self {
        Self {
            config,
            meta,
            ids,
            actor: actor.to_string(),
            local_stops: Mutex::new(HashMap::new()),
        }
    }

    pub fn meta_store(&self) -> &Store {
        &self.meta
    }

    /// Raise the in-process stop flag for a mapping, if a run is hosted
    /// here. Returns whether there was one.
    pub fn request_local_stop(&self, mapping_reference: &str) -> bool {
        let stops = self.local_stops.lock().expect("stop map lock");
        match stops.get(mapping_reference) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Execute one run of a mapping's current job flow.
    ///
    /// `Ok` covers completed and failed runs alike (the run log is the
    /// user-visible record); `Err` is reserved for not-run-at-all cases:
    /// lease busy, lease lost, missing flow.
    pub async fn execute(
        &self,
        reference: &str,
        payload: &RunPayload,
    ) -> Result<RunOutcome, EngineError> {
        let flow_row = job_flows::current(&self.meta, reference)
            .await?
            .ok_or_else(|| EngineError::MissingFlow(reference.to_string()))?;
        let flow: Arc<CompiledFlow> =
            Arc::new(serde_json::from_str(&flow_row.dw_logic).map_err(StoreError::Payload)?);

        // INIT: take the lease.
        let session_id = Uuid::new_v4();
        let run_log_id = run_logs::open(&self.meta, &self.ids, reference, session_id)
            .await?
            .ok_or(EngineError::LeaseBusy)?;
        let progress = ProgressTracker::new(self.meta.clone(), run_log_id, session_id, reference);

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.local_stops
            .lock()
            .expect("stop map lock")
            .insert(reference.to_string(), Arc::clone(&stop_flag));

        info!(reference, run_log_id, %session_id, "run started");
        let started = std::time::Instant::now();

        let inner = self
            .run_inner(reference, &flow, payload, &progress, &stop_flag)
            .await;

        self.local_stops
            .lock()
            .expect("stop map lock")
            .remove(reference);

        match inner {
            Ok(totals) => {
                let message = (!totals.errors.is_empty()).then(|| totals.errors.join("; "));
                progress
                    .finish(RunStatus::Complete, message.as_deref())
                    .await?;
                info!(
                    reference,
                    rows_read = totals.read,
                    rows_written = totals.written,
                    rows_failed = totals.failed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run complete"
                );
                Ok(RunOutcome {
                    run_log_id,
                    status: RunStatus::Complete,
                    rows_read: totals.read,
                    rows_written: totals.written,
                    rows_failed: totals.failed,
                    message,
                })
            }
            Err(EngineError::Stopped) => {
                // Drained and checkpointed; record the distinguished
                // terminal state. A raced STOP may have flipped the row
                // already, which reads back as a lost lease: same outcome.
                match progress.finish(RunStatus::Failed, Some("stopped")).await {
                    Ok(()) | Err(EngineError::LeaseLost) => {}
                    Err(other) => return Err(other),
                }
                warn!(reference, "run stopped");
                self.outcome_from_log(run_log_id).await
            }
            Err(EngineError::LeaseLost) => {
                // No further writes of any kind.
                warn!(reference, run_log_id, "lease lost; exiting silently");
                Err(EngineError::LeaseLost)
            }
            Err(e) => {
                let message = match &e {
                    EngineError::Timeout => "timeout".to_string(),
                    other => other.to_string(),
                };
                match progress.finish(RunStatus::Failed, Some(&message)).await {
                    Ok(()) | Err(EngineError::LeaseLost) => {}
                    Err(other) => return Err(other),
                }
                error!(reference, error = %message, "run failed");
                self.outcome_from_log(run_log_id).await
            }
        }
    }

    /// Totals were flushed incrementally; the run log is the source of
    /// truth for terminal outcomes.
    async fn outcome_from_log(&self, run_log_id: i64) -> Result<RunOutcome, EngineError> {
        let log = run_logs::by_id(&self.meta, run_log_id)
            .await?
            .ok_or_else(|| EngineError::BadRequest("run log vanished".into()))?;
        Ok(RunOutcome {
            run_log_id,
            status: log.status,
            rows_read: log.rows_read,
            rows_written: log.rows_written,
            rows_failed: log.rows_failed,
            message: log.message,
        })
    }

    async fn run_inner(
        &self,
        reference: &str,
        flow: &Arc<CompiledFlow>,
        payload: &RunPayload,
        progress: &ProgressTracker,
        stop_flag: &Arc<AtomicBool>,
    ) -> Result<Totals, EngineError> {
        let body = async {
            // PLANNING.
            let target = Store::connect_target(
                &self.config,
                flow.target_connection_id,
                self.config.max_workers,
            )
            .await?;

            if let Some(window) = payload.history.as_ref().filter(|w| w.truncate) {
                let table = target.data_object(&flow.target_schema, &flow.target_table);
                info!(
                    reference,
                    table = %table,
                    start = %window.start_date,
                    end = %window.end_date,
                    "history load truncates target"
                );
                target
                    .exec(&target.dialect().truncate_sql(&table), &[])
                    .await?;
            }

            let stored_checkpoint = if flow.checkpoint.enabled && payload.history.is_none() {
                run_logs::latest_checkpoint(&self.meta, reference).await?
            } else {
                None
            };

            let (query, resume) = build_source_query(flow, payload, stored_checkpoint.as_deref())?;

            let limits = PlanLimits {
                chunk_size: if flow.block_process_rows > 0 {
                    flow.block_process_rows
                } else {
                    self.config.chunk_size
                },
                min_rows_for_parallel: self.config.min_rows_for_parallel,
                max_workers: self.config.max_workers,
            };
            let mut plan = plan::plan_chunks(&target, flow, &query, &limits).await?;
            // Engine-side row skip reads one cursor; parallel pages would
            // re-shuffle the skip offset.
            if matches!(resume, ResumeMode::RowSkip { .. }) && plan.parallel {
                plan = Plan {
                    parallel: false,
                    key_aligned: true,
                    chunks: vec![Chunk {
                        index: 0,
                        spec: ChunkSpec::Full,
                    }],
                    estimated_rows: plan.estimated_rows,
                };
            }
            progress.heartbeat().await?;
            info!(
                reference,
                parallel = plan.parallel,
                chunks = plan.chunks.len(),
                estimated_rows = ?plan.estimated_rows,
                "plan ready"
            );

            // RUNNING.
            self.run_chunks(reference, flow, &query, &plan, resume, &target, progress, stop_flag)
                .await
        };

        match self.config.run_timeout {
            Some(limit) => tokio::time::timeout(limit, body)
                .await
                .map_err(|_| EngineError::Timeout)?,
            None => body.await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_chunks(
        &self,
        reference: &str,
        flow: &Arc<CompiledFlow>,
        query: &SourceQuery,
        plan: &Plan,
        resume: ResumeMode,
        target: &Store,
        progress: &ProgressTracker,
        stop_flag: &Arc<AtomicBool>,
    ) -> Result<Totals, EngineError> {
        let effective_ts = fmt_ts(Utc::now());
        let merger = Merger::new(target.clone(), Arc::clone(flow), &self.actor, effective_ts);
        let retry = RetryHandler::from_config(&self.config);

        // Serialized SCD-2 expiry when chunks do not partition the PK space.
        let (scd2_tx, expirer) = if plan.parallel && !plan.key_aligned && flow.has_scd2() {
            let (tx, mut rx) = mpsc::channel::<Scd2Batch>(self.config.max_workers.max(1));
            let expirer_merger = merger.clone();
            let handle = tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    let outcome = expirer_merger.apply_scd2_batch(&batch.pairs).await;
                    let _ = batch.ack.send(outcome);
                }
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let workers = if plan.parallel {
            self.config.max_workers.max(1)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set: JoinSet<(usize, Result<ChunkResult, StoreError>)> = JoinSet::new();

        let mut totals = Totals::default();
        let mut consecutive_failures = 0u32;
        let mut frontier = CheckpointFrontier::new(&resume);
        let mut stopped = false;
        let mut fatal: Option<StoreError> = None;

        let mut pending = plan.chunks.clone().into_iter();
        loop {
            // Stop sentinel: polled between chunk dispatches.
            if !stopped
                && fatal.is_none()
                && (stop_flag.load(Ordering::SeqCst) || progress.stop_requested().await?)
            {
                warn!(reference, "stop observed; draining in-flight chunks");
                stopped = true;
            }

            // Dispatch while capacity allows.
            while !stopped && fatal.is_none() && semaphore.available_permits() > 0 {
                let Some(chunk) = pending.next() else { break };
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore open");
                let target = target.clone();
                let flow = Arc::clone(flow);
                let query = query.clone();
                let merger = merger.clone();
                let scd2_tx = scd2_tx.clone();
                let resume = resume.clone();
                let index = chunk.index;
                join_set.spawn(async move {
                    let _permit = permit;
                    let out = execute_chunk(
                        &target,
                        &flow,
                        &query,
                        &chunk,
                        &merger,
                        retry,
                        scd2_tx.as_ref(),
                        &resume,
                    )
                    .await;
                    (index, out)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                // Nothing in flight: done, stopped, fatal, or more to plan.
                if stopped || fatal.is_some() || pending.len() == 0 {
                    break;
                }
                continue;
            };
            let (index, result) = joined.expect("chunk task never panics");

            match result {
                Ok(chunk_result) => {
                    consecutive_failures = 0;
                    totals.read += chunk_result.rows_read;
                    totals.written += chunk_result.rows_written;
                    totals.failed += chunk_result.rows_failed;
                    progress
                        .add_chunk(
                            chunk_result.rows_read,
                            chunk_result.rows_written,
                            chunk_result.rows_failed,
                        )
                        .await?;
                    // Checkpoint publishes only the contiguous committed
                    // frontier, after the chunk's transaction committed.
                    if let Some(value) = frontier.complete(index, chunk_result.checkpoint) {
                        progress.publish_checkpoint(&value).await?;
                    }
                }
                Err(e) => {
                    totals.errors.push(format!("chunk {index}: {e}"));
                    error!(reference, chunk = index, error = %e, "chunk failed");
                    frontier.fail(index);
                    if !e.is_transient() {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_CONSECUTIVE_CHUNK_FAILURES {
                            // Schema-level breakage: every chunk would fail
                            // the same way. Stop dispatching and fail the
                            // run.
                            fatal = Some(e);
                        }
                    }
                }
            }
        }

        drop(scd2_tx);
        if let Some(handle) = expirer {
            let _ = handle.await;
        }

        if let Some(e) = fatal {
            return Err(EngineError::Store(e));
        }
        if stopped {
            return Err(EngineError::Stopped);
        }
        Ok(totals)
    }
}

/// Per-chunk result. `checkpoint` is the chunk's high-water value under the
/// KEY strategy, or the rows consumed under row skip.
struct ChunkResult {
    rows_read: i64,
    rows_written: i64,
    rows_failed: i64,
    checkpoint: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn execute_chunk(
    target: &Store,
    flow: &CompiledFlow,
    query: &SourceQuery,
    chunk: &Chunk,
    merger: &Merger,
    retry: RetryHandler,
    scd2_tx: Option<&mpsc::Sender<Scd2Batch>>,
    resume: &ResumeMode,
) -> Result<ChunkResult, StoreError> {
    retry
        .run("chunk", || async move {
            chunk_body(target, flow, query, chunk, merger, scd2_tx, resume).await
        })
        .await
}

async fn chunk_body(
    target: &Store,
    flow: &CompiledFlow,
    query: &SourceQuery,
    chunk: &Chunk,
    merger: &Merger,
    scd2_tx: Option<&mpsc::Sender<Scd2Batch>>,
    resume: &ResumeMode,
) -> Result<ChunkResult, StoreError> {
    let checkpoint_column = flow.checkpoint.column.as_deref();
    let conditions = chunk_conditions(&chunk.spec, checkpoint_column);
    let (order_by, limit_offset) = match chunk.spec {
        ChunkSpec::OffsetLimit { offset, limit } => {
            (Some(flow.primary_key.clone()), Some((limit, offset)))
        }
        _ => (None, None),
    };
    let sql = query.read_sql(&conditions, order_by.as_deref(), limit_offset);
    let params = query.params();

    let db_rows = target.query(&sql, &params).await?;

    let mut rows_read = 0i64;
    let mut rows_failed = 0i64;
    let mut transformed = Vec::new();
    let mut transformer: Option<RowTransformer<'_>> = None;
    let mut checkpoint_high: Option<SqlValue> = None;

    let skip = match resume {
        ResumeMode::RowSkip { skip } => *skip,
        _ => 0,
    };

    for (row_index, db_row) in db_rows.iter().enumerate() {
        // Row-skip resume: discard until past the recorded count.
        if (row_index as i64) < skip {
            continue;
        }
        let (names, values) = decode_row(db_row)?;
        if transformer.is_none() {
            transformer = Some(
                RowTransformer::new(flow, &names)
                    .map_err(|e| StoreError::Template(e.to_string()))?,
            );
        }
        rows_read += 1;

        match transformer.as_ref().expect("initialized above").transform(&values) {
            Ok(target_row) => {
                if let Some(column) = checkpoint_column {
                    if let Some(pos) = names.iter().position(|n| n.eq_ignore_ascii_case(column)) {
                        track_max(&mut checkpoint_high, &values[pos]);
                    }
                }
                transformed.push(target_row);
            }
            Err(e) => {
                rows_failed += 1;
                warn!(row = row_index, error = %e, "row transform failed");
            }
        }
    }

    let outcome = merger.merge_rows(&transformed, scd2_tx).await?;

    let checkpoint = match resume {
        ResumeMode::RowSkip { skip } => Some((skip + rows_read).to_string()),
        _ => checkpoint_high.map(|v| v.read_large_text()),
    };

    Ok(ChunkResult {
        rows_read,
        rows_written: outcome.written,
        rows_failed,
        checkpoint,
    })
}

fn track_max(current: &mut Option<SqlValue>, candidate: &SqlValue) {
    if candidate.is_null() {
        return;
    }
    let replace = match (&current, candidate) {
        (None, _) => true,
        (Some(SqlValue::Int(Some(a))), SqlValue::Int(Some(b))) => b > a,
        (Some(SqlValue::Float(Some(a))), SqlValue::Float(Some(b))) => b > a,
        (Some(existing), new) => new.read_large_text() > existing.read_large_text(),
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

/// Publishes `max(existing, chunkHigh)` over the *contiguous* committed
/// prefix of chunks: a later chunk finishing early never advances the
/// checkpoint past an earlier, still-running one.
struct CheckpointFrontier {
    enabled: bool,
    completed: BTreeMap<usize, Option<String>>,
    next_expected: usize,
    high: Option<String>,
}

impl CheckpointFrontier {
    fn new(resume: &ResumeMode) -> Self {
        Self {
            enabled: !matches!(resume, ResumeMode::None),
            completed: BTreeMap::new(),
            next_expected: 0,
            high: None,
        }
    }

    /// Record a committed chunk; return the new publishable frontier value
    /// if it advanced.
    fn complete(&mut self, index: usize, value: Option<String>) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.completed.insert(index, value);
        let mut advanced = false;
        while let Some(value) = self.completed.remove(&self.next_expected) {
            self.next_expected += 1;
            if let Some(v) = value {
                if self.high.as_ref().map(|h| ordered_lt(h, &v)).unwrap_or(true) {
                    self.high = Some(v);
                    advanced = true;
                }
            }
        }
        if advanced {
            self.high.clone()
        } else {
            None
        }
    }

    /// A failed chunk blocks the frontier at its index for the rest of the
    /// run; resume re-reads from the last durable checkpoint.
    fn fail(&mut self, index: usize) {
        if index == self.next_expected {
            self.enabled = false;
        }
    }
}

/// Numeric when both sides parse as integers, lexicographic otherwise.
fn ordered_lt(a: &str, b: &str) -> bool {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a < b,
        _ => a < b,
    }
}
