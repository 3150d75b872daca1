//! cadence -- cron-driven test task scheduler.
//!
//! Turns stored task definitions into timed batch executions, keeps at most
//! one batch per task running, records per-case and per-batch results, and
//! answers history and success-rate queries.

pub mod config;
pub mod runner;
pub mod scheduler;
pub mod storage;

use anyhow::Result;
use std::sync::Arc;

/// Build the scheduler from configuration. This is the composition root:
/// the store, executor and scheduler are created here and nowhere else.
pub fn build_scheduler(config: &config::CadenceConfig) -> Result<scheduler::Scheduler> {
    tracing::info!(db_path = %config.database.path, "Initializing database");
    let store = Arc::new(storage::SqliteStore::open(&config.database.path)?);
    let executor = runner::executor::from_config(&config.executor);
    tracing::info!(executor = executor.name(), "Case executor selected");

    Ok(scheduler::Scheduler::new(
        store,
        executor,
        config.scheduler.tick_interval(),
    ))
}

/// Start the daemon: arm all scheduled tasks and run until Ctrl-C.
pub async fn serve(config: &config::CadenceConfig) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    let engine = scheduler.start().await?;

    tracing::info!("cadence running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown requested");
    scheduler.shutdown();
    engine.await?;

    Ok(())
}
