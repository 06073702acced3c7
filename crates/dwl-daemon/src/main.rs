//! dwl-daemon entry point.
//!
//! This file is intentionally thin: it loads configuration, connects the
//! metadata store, builds the typed service facade, and spawns the
//! scheduler loops. Exit status is 0 on a clean shutdown and non-zero on
//! fatal startup failure.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use dwl_compiler::Compiler;
use dwl_config::CoreConfig;
use dwl_daemon::service::Service;
use dwl_engine::ExecutionEngine;
use dwl_scheduler::Scheduler;
use dwl_store::{mappings, IdProvider, Store};

const ACTOR: &str = "dwl-daemon";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = CoreConfig::from_env().context("configuration invalid")?;

    let store = Store::from_config(&config)
        .await
        .context("metadata store connection failed")?;
    store
        .ensure_schema()
        .await
        .context("metadata schema bootstrap failed")?;

    let ids = Arc::new(IdProvider::new(store.clone(), &config));

    // The compiler's prepare-only checks run against the default target
    // connection; the facade owns it for the process lifetime and is what
    // the (external) HTTP layer embeds.
    let source_store = Store::connect_target(&config, None, config.max_workers)
        .await
        .context("target store connection failed")?;
    let compiler = Compiler::new(
        store.clone(),
        source_store,
        Arc::clone(&ids),
        ACTOR,
    );
    let service = Service::new(store.clone(), Arc::clone(&ids), compiler);

    recompile_active_mappings(&service, &store).await?;

    let engine = Arc::new(ExecutionEngine::new(
        config.clone(),
        store.clone(),
        Arc::clone(&ids),
        ACTOR,
    ));
    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        store.clone(),
        Arc::clone(&ids),
        engine,
    ));

    info!(
        sync_period_sec = config.sync_period.as_secs(),
        poll_period_sec = config.poll_period.as_secs(),
        max_workers = config.max_workers,
        "dwl-daemon started"
    );

    let (sync_loop, poll_loop) = scheduler.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("signal handler failed")?;
    info!("shutdown signal received");
    sync_loop.abort();
    poll_loop.abort();

    Ok(())
}

/// Boot sweep: re-run compilation for every active mapping so stored
/// metadata that no longer validates is surfaced at startup, not at its
/// first scheduled run. A failing mapping is logged and skipped; it only
/// blocks its own runs.
async fn recompile_active_mappings(service: &Service, store: &Store) -> anyhow::Result<()> {
    let references = mappings::references_of_active(store)
        .await
        .context("active mapping scan failed")?;
    for reference in references {
        match service.compile_mapping(&reference).await {
            Ok(job_flow_id) => {
                info!(reference = %reference, job_flow_id, "mapping recompiled");
            }
            Err(e) => {
                warn!(reference = %reference, error = %e, "mapping failed recompilation");
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
