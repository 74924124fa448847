//! Recording executors.
//!
//! The queue worker hands each claimed [`RecordingTask`] to a
//! [`RecordingExecutor`]. Browser automation itself lives outside this crate;
//! the two built-in executors only forward the task to it, either over HTTP
//! or by spawning a command with the task JSON on stdin.
//!
//! Executors must tolerate being invoked more than once for the same task:
//! a task whose worker looks dead is reclaimed and executed again.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::ExecutorConfig;
use crate::models::RecordingTask;

#[async_trait]
pub trait RecordingExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Run the recording for `task`. `Ok` marks the task completed, `Err`
    /// marks it failed with the error text.
    async fn execute(&self, task: &RecordingTask) -> Result<()>;
}

/// Build the executor selected by `[executor].kind`.
pub fn build_executor(config: &ExecutorConfig) -> Result<Arc<dyn RecordingExecutor>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.kind.as_str() {
        "http" => {
            let endpoint = config
                .endpoint
                .clone()
                .context("executor.endpoint must be set when kind is 'http'")?;
            Ok(Arc::new(HttpExecutor::new(endpoint, timeout)?))
        }
        "command" => {
            let program = config
                .command
                .clone()
                .context("executor.command must be set when kind is 'command'")?;
            Ok(Arc::new(CommandExecutor::new(
                program,
                config.args.clone(),
                timeout,
            )))
        }
        "disabled" => bail!(
            "No recording executor configured. Set [executor] kind = \"http\" or \"command\"."
        ),
        other => bail!("Unknown executor kind: '{}'", other),
    }
}

/// POSTs the task as JSON; any 2xx response counts as success.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExecutor {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RecordingExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &RecordingTask) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(task)
            .send()
            .await
            .with_context(|| format!("executor request to {} failed", self.endpoint))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "executor returned HTTP {}: {}",
                status.as_u16(),
                truncate(&body, 500)
            );
        }

        Ok(())
    }
}

/// Spawns `program args…` per task, writing the task JSON to stdin.
/// Exit status 0 counts as success.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }
}

#[async_trait]
impl RecordingExecutor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, task: &RecordingTask) -> Result<()> {
        let payload = serde_json::to_vec(task)?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("ABX_RECORDING_TASK_ID", task.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn executor command '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => bail!(
                "executor command timed out after {}s",
                self.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "executor command exited with {}: {}",
                output.status,
                truncate(stderr.trim(), 500)
            );
        }

        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
