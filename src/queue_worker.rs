//! Bounded-concurrency recording task consumer.
//!
//! One worker is shared by every build task running in the process. Its loop
//! claims tasks from the store until `concurrency` executions are in flight,
//! then sleeps until a slot frees up or the poll interval elapses. Each
//! execution settles its own row; a failing or panicking executor only ever
//! affects the task it was running.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::executor::RecordingExecutor;
use crate::models::{RecordingStatus, RecordingTask};
use crate::recording_tasks;

const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time view of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub started: bool,
    pub running: usize,
    pub concurrency: usize,
}

pub struct RecordingTaskQueueWorker {
    pool: SqlitePool,
    settings: WorkerSettings,
    executor: Arc<dyn RecordingExecutor>,
    running: Arc<AtomicUsize>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl RecordingTaskQueueWorker {
    pub fn new(
        pool: SqlitePool,
        settings: WorkerSettings,
        executor: Arc<dyn RecordingExecutor>,
    ) -> Self {
        Self {
            pool,
            settings,
            executor,
            running: Arc::new(AtomicUsize::new(0)),
            shutdown: None,
            handle: None,
        }
    }

    /// Spawn the claim loop in the background. Calling `start` on a running
    /// worker is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("recording queue worker already started");
            return;
        }

        let (tx, rx) = watch::channel(false);
        let worker_loop = WorkerLoop {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
            executor: Arc::clone(&self.executor),
            running: Arc::clone(&self.running),
        };

        info!(
            concurrency = self.settings.concurrency,
            executor = self.executor.name(),
            "starting recording queue worker"
        );

        let span = info_span!("recording_worker", instance = %Uuid::new_v4());
        self.shutdown = Some(tx);
        self.handle = Some(tokio::spawn(worker_loop.run(rx).instrument(span)));
    }

    /// Stop claiming and wait up to `timeout` for in-flight executions.
    ///
    /// Executions still running when the budget runs out are abandoned; their
    /// rows stay `running` and are reclaimed once they go stale.
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(true);

        let Some(mut handle) = self.handle.take() else {
            return;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if handle.is_finished() {
                if let Err(e) = (&mut handle).await {
                    error!("recording queue worker loop failed: {}", e);
                }
                info!("recording queue worker stopped");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        let outstanding = self.running.load(Ordering::SeqCst);
        warn!(
            outstanding,
            "recording queue worker stop timed out; abandoning in-flight executions"
        );
        handle.abort();
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            started: self.handle.is_some(),
            running: self.running.load(Ordering::SeqCst),
            concurrency: self.settings.concurrency,
        }
    }
}

struct WorkerLoop {
    pool: SqlitePool,
    settings: WorkerSettings,
    executor: Arc<dyn RecordingExecutor>,
    running: Arc<AtomicUsize>,
}

impl WorkerLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("recording execution task failed to join: {}", e);
                }
            }

            let claim_failed = self.fill(&mut in_flight).await.is_err();
            self.running.store(in_flight.len(), Ordering::SeqCst);

            let wait = if claim_failed {
                CLAIM_ERROR_BACKOFF
            } else {
                self.settings.poll_interval
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("recording execution task failed to join: {}", e);
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(
            in_flight = in_flight.len(),
            "recording queue worker draining in-flight executions"
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("recording execution task failed to join: {}", e);
            }
            self.running.store(in_flight.len(), Ordering::SeqCst);
        }
        self.running.store(0, Ordering::SeqCst);
    }

    /// Claim tasks until the pool is full or nothing is claimable.
    async fn fill(&self, in_flight: &mut JoinSet<()>) -> Result<()> {
        while in_flight.len() < self.settings.concurrency {
            let stale_before = chrono::Utc::now().timestamp()
                - self.settings.stale_timeout.as_secs() as i64;

            let task = match recording_tasks::claim_next(&self.pool, stale_before).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to claim recording task: {:#}", e);
                    return Err(e);
                }
            };

            debug!(
                task_id = task.id,
                build_task_id = task.build_task_id,
                attempt = task.attempt_count,
                "claimed recording task"
            );

            in_flight.spawn(
                execute_task(
                    self.pool.clone(),
                    Arc::clone(&self.executor),
                    task,
                    self.settings.max_attempts,
                )
                .in_current_span(),
            );
            self.running.store(in_flight.len(), Ordering::SeqCst);
        }

        Ok(())
    }
}

/// Aborts the wrapped execution when dropped, so cancelling the outer task
/// also cancels the executor (and drops any child process it spawned).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one task through the executor and persist the outcome.
///
/// The executor runs in its own tokio task so a panic surfaces as a join
/// error and is recorded like any other failure.
async fn execute_task(
    pool: SqlitePool,
    executor: Arc<dyn RecordingExecutor>,
    task: RecordingTask,
    max_attempts: i64,
) {
    let task_id = task.id;
    let started = std::time::Instant::now();

    let execution = tokio::spawn(async move { executor.execute(&task).await });
    let _abort = AbortOnDrop(execution.abort_handle());
    let outcome = execution.await;

    let error_message = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{:#}", e)),
        Err(join_err) if join_err.is_panic() => Some("recording executor panicked".to_string()),
        Err(join_err) => Some(format!("recording execution aborted: {}", join_err)),
    };

    match error_message {
        None => match recording_tasks::mark_completed(&pool, task_id).await {
            Ok(()) => info!(
                task_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "recording task completed"
            ),
            Err(e) => error!(task_id, "failed to mark recording task completed: {:#}", e),
        },
        Some(message) => {
            match recording_tasks::mark_failed(&pool, task_id, &message, max_attempts).await {
                Ok(RecordingStatus::Pending) => {
                    warn!(task_id, error = %message, "recording task failed; queued for retry")
                }
                Ok(_) => warn!(task_id, error = %message, "recording task failed"),
                Err(e) => error!(task_id, "failed to mark recording task failed: {:#}", e),
            }
        }
    }
}
