//! The small, typed API the engine exposes to its callers. Not a wire
//! format: the HTTP layer (out of scope here) wraps this in whatever
//! transport it wants.

use std::sync::Arc;

use dwl_compiler::{Compiler, CompilerError};
use dwl_schemas::codes::RequestType;
use dwl_schemas::{Request, RunLog, RunPayload};
use dwl_store::requests::RequestFilter;
use dwl_store::run_logs::RunLogFilter;
use dwl_store::{requests, run_logs, IdProvider, Store, StoreError};

pub struct Service {
    store: Store,
    ids: Arc<IdProvider>,
    compiler: Compiler,
}

impl Service {
    pub fn new(store: Store, ids: Arc<IdProvider>, compiler: Compiler) -> Self {
        Self {
            store,
            ids,
            compiler,
        }
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Validate and (re)compile a mapping into its current job flow.
    pub async fn compile_mapping(&self, reference: &str) -> Result<i64, CompilerError> {
        self.compiler.compile(reference).await
    }

    /// Append a RUN work item; the scheduler's poll loop picks it up.
    pub async fn enqueue_run(
        &self,
        reference: &str,
        payload: RunPayload,
    ) -> Result<i64, StoreError> {
        requests::enqueue(&self.store, &self.ids, RequestType::Run, reference, &payload).await
    }

    /// Append a STOP work item for a mapping's in-flight run.
    pub async fn enqueue_stop(&self, reference: &str) -> Result<i64, StoreError> {
        requests::enqueue(
            &self.store,
            &self.ids,
            RequestType::Stop,
            reference,
            &RunPayload::regular(),
        )
        .await
    }

    /// Read-only projection over the run log.
    pub async fn run_logs(&self, filter: RunLogFilter) -> Result<Vec<RunLog>, StoreError> {
        run_logs::list(&self.store, &filter).await
    }

    /// Read-only projection over the request queue.
    pub async fn requests(&self, filter: RequestFilter) -> Result<Vec<Request>, StoreError> {
        requests::list(&self.store, &filter).await
    }
}
