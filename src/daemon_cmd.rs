//! Long-running commands: `abx coordinator`, `abx worker`, and the one-shot
//! `abx generate`.
//!
//! The loops run until Ctrl-C, then get `shutdown_timeout` to drain.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::info;

use crate::build_tasks;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::db;
use crate::executor::build_executor;
use crate::generator::{TaskGenerator, DEFAULT_GENERATE_LIMIT};
use crate::queue_worker::RecordingTaskQueueWorker;

pub async fn run_coordinator(config: &Config, shutdown_timeout: Duration) -> Result<()> {
    let executor = build_executor(&config.executor)?;
    let pool = db::connect(config).await?;

    let mut coordinator = Coordinator::new(pool.clone(), config.coordinator_settings(), executor);
    coordinator.start();
    println!(
        "Coordinator running (max {} build tasks). Press Ctrl-C to stop.",
        config.coordinator.max_concurrent_build_tasks
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    coordinator.stop(shutdown_timeout).await;
    pool.close().await;
    println!("Coordinator stopped.");
    Ok(())
}

/// Run only the recording queue worker, for hosts that execute recordings
/// but leave build coordination to another process.
pub async fn run_worker(config: &Config, shutdown_timeout: Duration) -> Result<()> {
    let executor = build_executor(&config.executor)?;
    let pool = db::connect(config).await?;

    let mut worker = RecordingTaskQueueWorker::new(pool.clone(), config.worker_settings(), executor);
    worker.start();
    println!(
        "Recording worker running (concurrency {}). Press Ctrl-C to stop.",
        config.worker.concurrency
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    worker.stop(shutdown_timeout).await;
    pool.close().await;
    println!("Recording worker stopped.");
    Ok(())
}

/// Generate recording tasks for one build task without running it.
pub async fn run_generate(config: &Config, build_task_id: i64, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;

    let Some(task) = build_tasks::get_build_task(&pool, build_task_id).await? else {
        bail!("Build task {} not found", build_task_id);
    };
    let Some(source_id) = task.source_id else {
        bail!(
            "Build task {} has no source yet; finish its knowledge stage first",
            build_task_id
        );
    };

    let generator = TaskGenerator::new(pool.clone());
    let inserted = generator
        .generate(build_task_id, source_id, limit.unwrap_or(DEFAULT_GENERATE_LIMIT))
        .await?;

    println!(
        "Generated {} recording task{} for build task {} (source {}).",
        inserted,
        if inserted == 1 { "" } else { "s" },
        build_task_id,
        source_id
    );

    pool.close().await;
    Ok(())
}
