//! TOML configuration.
//!
//! Every section except `[db]` is optional; missing fields fall back to the
//! defaults below. The orchestration loops take the `*Settings` structs
//! produced by [`Config::coordinator_settings`] and friends, which carry
//! `Duration`s instead of raw numbers.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    #[serde(default = "default_max_concurrent_build_tasks")]
    pub max_concurrent_build_tasks: usize,
    #[serde(default = "default_build_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_build_stale_timeout_minutes")]
    pub stale_timeout_minutes: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_build_tasks: default_max_concurrent_build_tasks(),
            poll_interval_secs: default_build_poll_interval_secs(),
            stale_timeout_minutes: default_build_stale_timeout_minutes(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

fn default_max_concurrent_build_tasks() -> usize {
    5
}
fn default_build_poll_interval_secs() -> u64 {
    5
}
fn default_build_stale_timeout_minutes() -> u64 {
    15
}
fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_recording_task_limit")]
    pub recording_task_limit: i64,
    #[serde(default = "default_progress_poll_interval_secs")]
    pub progress_poll_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            recording_task_limit: default_recording_task_limit(),
            progress_poll_interval_secs: default_progress_poll_interval_secs(),
        }
    }
}

fn default_recording_task_limit() -> i64 {
    10
}
fn default_progress_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_worker_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_recording_stale_timeout_minutes")]
    pub stale_timeout_minutes: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_secs: default_worker_poll_interval_secs(),
            stale_timeout_minutes: default_recording_stale_timeout_minutes(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_worker_concurrency() -> usize {
    3
}
fn default_worker_poll_interval_secs() -> u64 {
    2
}
fn default_recording_stale_timeout_minutes() -> u64 {
    30
}
fn default_max_attempts() -> i64 {
    1
}

/// Which external recording executor the queue worker delegates to.
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// `http`, `command`, or `disabled`.
    #[serde(default = "default_executor_kind")]
    pub kind: String,
    /// Endpoint receiving `POST` task payloads when `kind = "http"`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Program spawned per task when `kind = "command"`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: default_executor_kind(),
            endpoint: None,
            command: None,
            args: Vec::new(),
            timeout_secs: default_executor_timeout_secs(),
        }
    }
}

fn default_executor_kind() -> String {
    "disabled".to_string()
}
fn default_executor_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Runtime settings for the [`Coordinator`](crate::coordinator::Coordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_concurrent_build_tasks: usize,
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub metrics_interval: Duration,
    pub runner: RunnerSettings,
    pub worker: WorkerSettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Config::settings_from(
            &CoordinatorConfig::default(),
            &RunnerConfig::default(),
            &WorkerConfig::default(),
        )
    }
}

/// Runtime settings for a [`BuildTaskRunner`](crate::runner::BuildTaskRunner).
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub recording_task_limit: i64,
    pub progress_poll_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        let cfg = RunnerConfig::default();
        Self {
            recording_task_limit: cfg.recording_task_limit,
            progress_poll_interval: Duration::from_secs(cfg.progress_poll_interval_secs),
        }
    }
}

/// Runtime settings for the [`RecordingTaskQueueWorker`](crate::queue_worker::RecordingTaskQueueWorker).
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub max_attempts: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let cfg = WorkerConfig::default();
        Self {
            concurrency: cfg.concurrency,
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            stale_timeout: Duration::from_secs(cfg.stale_timeout_minutes * 60),
            max_attempts: cfg.max_attempts,
        }
    }
}

impl Config {
    /// A config with every optional section at its default, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            coordinator: CoordinatorConfig::default(),
            runner: RunnerConfig::default(),
            worker: WorkerConfig::default(),
            executor: ExecutorConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        Self::settings_from(&self.coordinator, &self.runner, &self.worker)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        Self::settings_from(&self.coordinator, &self.runner, &self.worker).worker
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        Self::settings_from(&self.coordinator, &self.runner, &self.worker).runner
    }

    fn settings_from(
        coordinator: &CoordinatorConfig,
        runner: &RunnerConfig,
        worker: &WorkerConfig,
    ) -> CoordinatorSettings {
        CoordinatorSettings {
            max_concurrent_build_tasks: coordinator.max_concurrent_build_tasks,
            poll_interval: Duration::from_secs(coordinator.poll_interval_secs),
            stale_timeout: Duration::from_secs(coordinator.stale_timeout_minutes * 60),
            metrics_interval: Duration::from_secs(coordinator.metrics_interval_secs),
            runner: RunnerSettings {
                recording_task_limit: runner.recording_task_limit,
                progress_poll_interval: Duration::from_secs(runner.progress_poll_interval_secs),
            },
            worker: WorkerSettings {
                concurrency: worker.concurrency,
                poll_interval: Duration::from_secs(worker.poll_interval_secs),
                stale_timeout: Duration::from_secs(worker.stale_timeout_minutes * 60),
                max_attempts: worker.max_attempts,
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.coordinator.max_concurrent_build_tasks == 0 {
        anyhow::bail!("coordinator.max_concurrent_build_tasks must be > 0");
    }
    if config.coordinator.metrics_interval_secs == 0 {
        anyhow::bail!("coordinator.metrics_interval_secs must be > 0");
    }
    if config.coordinator.poll_interval_secs == 0 {
        anyhow::bail!("coordinator.poll_interval_secs must be > 0");
    }
    if config.coordinator.stale_timeout_minutes == 0 {
        anyhow::bail!("coordinator.stale_timeout_minutes must be > 0");
    }
    if config.runner.progress_poll_interval_secs == 0 {
        anyhow::bail!("runner.progress_poll_interval_secs must be > 0");
    }
    if config.worker.poll_interval_secs == 0 {
        anyhow::bail!("worker.poll_interval_secs must be > 0");
    }
    if config.worker.stale_timeout_minutes == 0 {
        anyhow::bail!("worker.stale_timeout_minutes must be > 0");
    }
    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be > 0");
    }
    if config.worker.max_attempts < 1 {
        anyhow::bail!("worker.max_attempts must be >= 1");
    }
    if config.runner.recording_task_limit < 0 {
        anyhow::bail!("runner.recording_task_limit must be >= 0");
    }

    match config.executor.kind.as_str() {
        "disabled" => {}
        "http" => {
            if config.executor.endpoint.is_none() {
                anyhow::bail!("executor.endpoint must be set when kind is 'http'");
            }
        }
        "command" => {
            if config.executor.command.is_none() {
                anyhow::bail!("executor.command must be set when kind is 'command'");
            }
        }
        other => anyhow::bail!(
            "Unknown executor kind: '{}'. Must be disabled, http, or command.",
            other
        ),
    }

    if config.executor.kind != "disabled"
        && config.executor.timeout_secs > config.worker.stale_timeout_minutes * 60
    {
        warn!(
            timeout_secs = config.executor.timeout_secs,
            stale_timeout_minutes = config.worker.stale_timeout_minutes,
            "executor timeout exceeds the recording stale timeout; long executions may be reclaimed while still running"
        );
    }

    Ok(config)
}
