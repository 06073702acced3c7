//! Progress tracking for one run: heartbeats, row totals, checkpoint
//! publication, terminal status. Every write is CAS-guarded by the run-log
//! lease; a lost lease surfaces as [`EngineError::LeaseLost`] and the
//! caller exits without further writes.

use tracing::debug;
use uuid::Uuid;

use dwl_schemas::codes::RunStatus;
use dwl_store::{requests, run_logs, Store, StoreError};

use crate::EngineError;

#[derive(Clone)]
pub struct ProgressTracker {
    store: Store,
    run_log_id: i64,
    session_id: Uuid,
    mapping_reference: String,
}

impl ProgressTracker {
    pub fn new(store: Store, run_log_id: i64, session_id: Uuid, mapping_reference: &str) -> Self {
        Self {
            store,
            run_log_id,
            session_id,
            mapping_reference: mapping_reference.to_string(),
        }
    }

    pub fn run_log_id(&self) -> i64 {
        self.run_log_id
    }

    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        run_logs::heartbeat(&self.store, self.run_log_id, self.session_id)
            .await
            .map_err(into_engine)
    }

    pub async fn add_chunk(
        &self,
        rows_read: i64,
        rows_written: i64,
        rows_failed: i64,
    ) -> Result<(), EngineError> {
        run_logs::add_progress(
            &self.store,
            self.run_log_id,
            self.session_id,
            rows_read,
            rows_written,
            rows_failed,
        )
        .await
        .map_err(into_engine)
    }

    /// Publish the committed checkpoint frontier. The caller guarantees
    /// monotonicity; durable-after-commit is guaranteed by calling this
    /// only once the chunk's target transaction has committed.
    pub async fn publish_checkpoint(&self, value: &str) -> Result<(), EngineError> {
        debug!(value, "checkpoint advanced");
        run_logs::set_checkpoint(&self.store, self.run_log_id, self.session_id, value)
            .await
            .map_err(into_engine)
    }

    pub async fn finish(&self, status: RunStatus, message: Option<&str>) -> Result<(), EngineError> {
        run_logs::finish(&self.store, self.run_log_id, self.session_id, status, message)
            .await
            .map_err(into_engine)
    }

    /// Stop sentinel: an outstanding STOP request for this mapping.
    pub async fn stop_requested(&self) -> Result<bool, EngineError> {
        requests::stop_pending(&self.store, &self.mapping_reference)
            .await
            .map_err(into_engine)
    }
}

fn into_engine(e: StoreError) -> EngineError {
    match e {
        StoreError::LeaseLost => EngineError::LeaseLost,
        other => EngineError::Store(other),
    }
}
