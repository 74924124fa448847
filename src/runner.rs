//! Drives one claimed build task through the action stage.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::build_tasks;
use crate::config::RunnerSettings;
use crate::generator::TaskGenerator;
use crate::models::{BuildStage, StageStatus};
use crate::recording_tasks;

/// Owner of a single `action_build/running` build task.
///
/// `run` generates the task's recording tasks, waits for the shared queue
/// worker to settle them, then completes the stage. It only ever touches
/// rows belonging to its own task, so re-running it after a stale reclaim
/// picks up where the previous owner left off.
pub struct BuildTaskRunner {
    pool: SqlitePool,
    task_id: i64,
    settings: RunnerSettings,
    generator: TaskGenerator,
}

impl BuildTaskRunner {
    pub fn new(pool: SqlitePool, task_id: i64, settings: RunnerSettings) -> Self {
        let generator = TaskGenerator::new(pool.clone());
        Self {
            pool,
            task_id,
            settings,
            generator,
        }
    }

    /// Run to completion. On error the task is marked `error` with the message
    /// under `config.last_error` before the error is returned.
    pub async fn run(&self) -> Result<()> {
        match self.drive().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = format!("{:#}", err);
                match build_tasks::fail_build_task(&self.pool, self.task_id, &message).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        task_id = self.task_id,
                        "build task already settled; error not recorded"
                    ),
                    Err(e) => error!(
                        task_id = self.task_id,
                        "failed to record build task error: {:#}", e
                    ),
                }
                Err(err)
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        let task = build_tasks::get_build_task(&self.pool, self.task_id)
            .await
            .with_context(|| format!("loading build task {}", self.task_id))?
            .with_context(|| format!("build task {} not found", self.task_id))?;

        if task.stage()? != BuildStage::ActionBuild || task.stage_status()? != StageStatus::Running {
            warn!(
                task_id = self.task_id,
                stage = %task.stage,
                stage_status = %task.stage_status,
                "build task is not in action_build/running; runner not started"
            );
            return Ok(());
        }

        let Some(source_id) = task.source_id else {
            bail!("build task {} has no source_id", self.task_id);
        };

        let limit = task
            .config_json()
            .get("recording_task_limit")
            .and_then(Value::as_i64)
            .filter(|limit| *limit >= 0)
            .unwrap_or(self.settings.recording_task_limit);

        let generated = self
            .generator
            .generate(self.task_id, source_id, limit)
            .await
            .with_context(|| format!("generating recording tasks for build task {}", self.task_id))?;

        info!(
            task_id = self.task_id,
            source_id, generated, limit, "build task runner started"
        );

        let progress = loop {
            match recording_tasks::progress_for_build_task(&self.pool, self.task_id).await {
                Ok(progress) if progress.outstanding() == 0 => break progress,
                Ok(progress) => {
                    debug!(
                        task_id = self.task_id,
                        pending = progress.pending,
                        running = progress.running,
                        completed = progress.completed,
                        failed = progress.failed,
                        "waiting on recording tasks"
                    );
                }
                Err(e) => warn!(
                    task_id = self.task_id,
                    "failed to read recording progress: {:#}", e
                ),
            }

            match build_tasks::heartbeat(&self.pool, self.task_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        task_id = self.task_id,
                        "build task left action_build/running; runner stopping"
                    );
                    return Ok(());
                }
                Err(e) => warn!(task_id = self.task_id, "heartbeat failed: {:#}", e),
            }

            tokio::time::sleep(self.settings.progress_poll_interval).await;
        };

        // Every recording task has settled; retry until the stage update lands.
        let completed = loop {
            match build_tasks::complete_action_build(&self.pool, self.task_id).await {
                Ok(completed) => break completed,
                Err(e) => {
                    warn!(
                        task_id = self.task_id,
                        "failed to complete build task, retrying: {:#}", e
                    );
                    tokio::time::sleep(self.settings.progress_poll_interval).await;
                }
            }
        };

        if completed {
            info!(
                task_id = self.task_id,
                completed = progress.completed,
                failed = progress.failed,
                "build task completed"
            );
        } else {
            warn!(
                task_id = self.task_id,
                "build task no longer owned; completion skipped"
            );
        }

        Ok(())
    }
}
