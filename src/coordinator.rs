//! Top-level build orchestration loop.
//!
//! A coordinator claims build tasks whose knowledge stage has finished (or
//! whose action-stage owner has gone quiet), runs a [`BuildTaskRunner`] for
//! each, and keeps at most `max_concurrent_build_tasks` of them alive. Any
//! number of coordinators may poll the same database; the claim statement
//! hands each eligible task to exactly one of them.
//!
//! The coordinator also owns the process's [`RecordingTaskQueueWorker`],
//! which executes the recording tasks the runners generate.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::build_tasks;
use crate::config::CoordinatorSettings;
use crate::executor::RecordingExecutor;
use crate::queue_worker::{RecordingTaskQueueWorker, WorkerStatus};
use crate::recording_tasks;
use crate::runner::BuildTaskRunner;

const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Coordinator {
    pool: SqlitePool,
    settings: CoordinatorSettings,
    worker: RecordingTaskQueueWorker,
    running: Arc<AtomicUsize>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(
        pool: SqlitePool,
        settings: CoordinatorSettings,
        executor: Arc<dyn RecordingExecutor>,
    ) -> Self {
        let worker = RecordingTaskQueueWorker::new(pool.clone(), settings.worker.clone(), executor);
        Self {
            pool,
            settings,
            worker,
            running: Arc::new(AtomicUsize::new(0)),
            shutdown: None,
            handle: None,
        }
    }

    /// Start the queue worker and the claim loop. No-op if already started.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("coordinator already started");
            return;
        }

        self.worker.start();

        let (tx, rx) = watch::channel(false);
        let main_loop = MainLoop {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
            running: Arc::clone(&self.running),
        };

        info!(
            max_concurrent_build_tasks = self.settings.max_concurrent_build_tasks,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            stale_timeout_secs = self.settings.stale_timeout.as_secs(),
            "starting coordinator"
        );

        let span = info_span!("coordinator", instance = %Uuid::new_v4());
        self.shutdown = Some(tx);
        self.handle = Some(tokio::spawn(main_loop.run(rx).instrument(span)));
    }

    /// Stop claiming, stop the queue worker, then wait up to `timeout` for
    /// running build tasks to finish. Runners still alive afterwards are
    /// aborted; their tasks become reclaimable once stale.
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        info!("stopping coordinator");
        let _ = tx.send(true);

        self.worker.stop(timeout).await;

        let Some(mut handle) = self.handle.take() else {
            return;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        while !handle.is_finished() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if handle.is_finished() {
            if let Err(e) = (&mut handle).await {
                error!("coordinator loop failed: {}", e);
            }
            info!("coordinator stopped");
        } else {
            warn!(
                remaining = self.running.load(Ordering::SeqCst),
                "coordinator stop timed out; abandoning running build tasks"
            );
            handle.abort();
        }
    }

    /// Claim one eligible build task for this process.
    ///
    /// Store errors are logged and reported as "nothing available".
    pub async fn claim_build_task(&self) -> Option<i64> {
        claim_build_task(&self.pool, self.settings.stale_timeout)
            .await
            .unwrap_or_else(|e| {
                warn!("failed to claim build task: {:#}", e);
                None
            })
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn worker_status(&self) -> WorkerStatus {
        self.worker.status()
    }
}

async fn claim_build_task(pool: &SqlitePool, stale_timeout: Duration) -> Result<Option<i64>> {
    let stale_before = chrono::Utc::now().timestamp() - stale_timeout.as_secs() as i64;
    build_tasks::claim_action_build(pool, stale_before).await
}

/// Running runners keyed by build task id. Dropping the set aborts every
/// runner still in it.
#[derive(Default)]
struct RunnerSet(HashMap<i64, JoinHandle<Result<()>>>);

impl Drop for RunnerSet {
    fn drop(&mut self) {
        for handle in self.0.values() {
            handle.abort();
        }
    }
}

struct MainLoop {
    pool: SqlitePool,
    settings: CoordinatorSettings,
    running: Arc<AtomicUsize>,
}

impl MainLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut runners = RunnerSet::default();
        let mut metrics = tokio::time::interval(self.settings.metrics_interval);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.prune(&mut runners).await;
            if *shutdown.borrow() {
                break;
            }

            let mut claim_failed = false;
            while runners.0.len() < self.settings.max_concurrent_build_tasks {
                match claim_build_task(&self.pool, self.settings.stale_timeout).await {
                    Ok(Some(task_id)) => {
                        if runners.0.contains_key(&task_id) {
                            debug!(task_id, "reclaimed a build task this process still runs");
                            break;
                        }
                        info!(task_id, "claimed build task");
                        let runner = BuildTaskRunner::new(
                            self.pool.clone(),
                            task_id,
                            self.settings.runner.clone(),
                        );
                        let handle =
                            tokio::spawn(async move { runner.run().await }.in_current_span());
                        runners.0.insert(task_id, handle);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("failed to claim build task: {:#}", e);
                        claim_failed = true;
                        break;
                    }
                }
            }
            self.running.store(runners.0.len(), Ordering::SeqCst);

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
                _ = metrics.tick() => {
                    self.report_metrics(&runners).await;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(
            running = runners.0.len(),
            "coordinator draining running build tasks"
        );
        while !runners.0.is_empty() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            self.prune(&mut runners).await;
        }
    }

    /// Drop finished runners, logging how each ended.
    async fn prune(&self, runners: &mut RunnerSet) {
        let finished: Vec<i64> = runners
            .0
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for task_id in finished {
            let Some(handle) = runners.0.remove(&task_id) else {
                continue;
            };
            match handle.await {
                Ok(Ok(())) => debug!(task_id, "build task runner finished"),
                Ok(Err(e)) => error!(task_id, "build task runner failed: {:#}", e),
                Err(e) => error!(task_id, "build task runner panicked: {}", e),
            }
        }

        self.running.store(runners.0.len(), Ordering::SeqCst);
    }

    async fn report_metrics(&self, runners: &RunnerSet) {
        match build_tasks::count_by_stage(&self.pool).await {
            Ok(counts) => {
                for (stage, status, count) in counts {
                    debug!(stage = %stage, status = %status, count, "build tasks by stage");
                }
            }
            Err(e) => warn!("failed to read build task counts: {:#}", e),
        }

        info!(
            running = runners.0.len(),
            max = self.settings.max_concurrent_build_tasks,
            "coordinator metrics"
        );

        let now = chrono::Utc::now().timestamp();
        for task_id in runners.0.keys().copied() {
            let progress = match recording_tasks::progress_for_build_task(&self.pool, task_id).await {
                Ok(progress) => progress,
                Err(e) => {
                    warn!(task_id, "failed to read recording progress: {:#}", e);
                    continue;
                }
            };
            let elapsed_secs = match build_tasks::get_build_task(&self.pool, task_id).await {
                Ok(Some(task)) => task.action_started_at.map(|started| now - started),
                _ => None,
            };
            let percent = if progress.total > 0 {
                progress.settled() as f64 * 100.0 / progress.total as f64
            } else {
                0.0
            };

            info!(
                task_id,
                total = progress.total,
                completed = progress.completed,
                failed = progress.failed,
                percent = %format!("{:.1}", percent),
                elapsed_secs = elapsed_secs.unwrap_or(0),
                "build task progress"
            );
        }
    }
}
