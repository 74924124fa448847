mod common;

use actionbook_builder::build_tasks;
use actionbook_builder::config::{CoordinatorSettings, RunnerSettings, WorkerSettings};
use actionbook_builder::coordinator::Coordinator;
use actionbook_builder::executor::RecordingExecutor;
use actionbook_builder::generator::{TaskGenerator, DEFAULT_GENERATE_LIMIT};
use actionbook_builder::models::{ChunkType, RecordingStatus, RecordingTask};
use actionbook_builder::queue_worker::RecordingTaskQueueWorker;
use actionbook_builder::recording_tasks;
use actionbook_builder::runner::BuildTaskRunner;
use anyhow::bail;
use async_trait::async_trait;
use common::{age_row, knowledge_complete_task, seed_source, setup_pool};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Succeeds unless the scenario asks it to fail or panic.
#[derive(Default)]
struct ScriptedExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl RecordingExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, task: &RecordingTask) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if task.scenario.contains("panic") {
            panic!("executor crashed on task {}", task.id);
        }
        if task.scenario.contains("fail") {
            bail!("selector not found for task {}", task.id);
        }
        Ok(())
    }
}

/// Never finishes within a test. Records when its execution is dropped.
#[derive(Default)]
struct HangingExecutor {
    dropped: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordingExecutor for HangingExecutor {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn execute(&self, _task: &RecordingTask) -> anyhow::Result<()> {
        let _flag = SetOnDrop(Arc::clone(&self.dropped));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Tracks the most executions ever in flight at once.
#[derive(Default)]
struct GaugeExecutor {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl RecordingExecutor for GaugeExecutor {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, _task: &RecordingTask) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_worker() -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(50),
        ..WorkerSettings::default()
    }
}

fn fast_coordinator() -> CoordinatorSettings {
    CoordinatorSettings {
        poll_interval: Duration::from_millis(50),
        metrics_interval: Duration::from_millis(200),
        runner: RunnerSettings {
            recording_task_limit: 10,
            progress_poll_interval: Duration::from_millis(50),
        },
        worker: fast_worker(),
        ..CoordinatorSettings::default()
    }
}

fn by_scenario<'a>(tasks: &'a [RecordingTask], scenario: &str) -> &'a RecordingTask {
    tasks
        .iter()
        .find(|t| t.scenario == scenario)
        .unwrap_or_else(|| panic!("no task with scenario {:?}", scenario))
}

async fn count_tasks(pool: &SqlitePool, source_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM recording_tasks WHERE source_id = ?")
        .bind(source_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Poll until the build task's stage status is `status`, or panic after ~10s.
async fn wait_for_stage_status(pool: &SqlitePool, task_id: i64, status: &str) {
    for _ in 0..200 {
        let task = build_tasks::get_build_task(pool, task_id).await.unwrap().unwrap();
        if task.stage_status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let task = build_tasks::get_build_task(pool, task_id).await.unwrap().unwrap();
    panic!(
        "build task {} stuck at {}/{}",
        task_id, task.stage, task.stage_status
    );
}

// ============ Generation ============

#[tokio::test]
async fn generate_never_duplicates_a_chunk() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["a", "b", "c", "d", "e"]).await;
    let generator = TaskGenerator::new(pool.clone());

    assert_eq!(generator.generate(1, seeded.source_id, 10).await.unwrap(), 5);
    assert_eq!(generator.generate(1, seeded.source_id, 10).await.unwrap(), 0);
    assert_eq!(generator.generate(2, seeded.source_id, 10).await.unwrap(), 0);
    assert_eq!(count_tasks(&pool, seeded.source_id).await, 5);
}

#[tokio::test]
async fn generate_fills_remaining_capacity() {
    let (_tmp, pool) = setup_pool().await;
    let contents: Vec<String> = (0..100).map(|i| format!("Section {}", i)).collect();
    let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
    let seeded = seed_source(&pool, "big", &refs).await;
    let generator = TaskGenerator::new(pool.clone());

    assert_eq!(generator.generate(1, seeded.source_id, 10).await.unwrap(), 10);
    assert_eq!(generator.generate(1, seeded.source_id, 100).await.unwrap(), 90);
    assert_eq!(count_tasks(&pool, seeded.source_id).await, 100);
}

#[tokio::test]
async fn generate_with_zero_limit_inserts_nothing() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["a"]).await;
    let generator = TaskGenerator::new(pool.clone());

    assert_eq!(generator.generate(1, seeded.source_id, 0).await.unwrap(), 0);
    assert_eq!(count_tasks(&pool, seeded.source_id).await, 0);
}

#[tokio::test]
async fn concurrent_generators_do_not_duplicate() {
    let (_tmp, pool) = setup_pool().await;
    let contents: Vec<String> = (0..30).map(|i| format!("Chunk {}", i)).collect();
    let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
    let seeded = seed_source(&pool, "race", &refs).await;

    let mut handles = Vec::new();
    for build_task_id in 0..4 {
        let generator = TaskGenerator::new(pool.clone());
        let source_id = seeded.source_id;
        handles.push(tokio::spawn(async move {
            generator.generate(build_task_id, source_id, 30).await.unwrap()
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, 30);
    assert_eq!(count_tasks(&pool, seeded.source_id).await, 30);
}

#[tokio::test]
async fn generate_classifies_chunks_for_source_seven() {
    let (_tmp, pool) = setup_pool().await;
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO sources (id, name, base_url, created_at, updated_at) VALUES (7, 'site-7', 'https://site7.example.com', ?, ?)",
    )
    .bind(now)
    .bind(now)
    .execute(&pool)
    .await
    .unwrap();
    let document_id: i64 = sqlx::query_scalar(
        "INSERT INTO documents (source_id, url, url_hash, title, created_at, updated_at) VALUES (7, 'https://site7.example.com/help', 'h', 'Help', ?, ?) RETURNING id",
    )
    .bind(now)
    .bind(now)
    .fetch_one(&pool)
    .await
    .unwrap();
    for (i, content) in ["1. Click search", "Pricing overview", "Contact our office"]
        .iter()
        .enumerate()
    {
        sqlx::query(
            "INSERT INTO chunks (document_id, chunk_index, content, content_hash, created_at) VALUES (?, ?, ?, 'x', ?)",
        )
        .bind(document_id)
        .bind(i as i64)
        .bind(content)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
    }

    let generator = TaskGenerator::new(pool.clone());
    assert_eq!(generator.generate(1, 7, DEFAULT_GENERATE_LIMIT).await.unwrap(), 3);

    let tasks = recording_tasks::list_for_build_task(&pool, 1).await.unwrap();
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.status().unwrap(), RecordingStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.progress, 0);
        assert_eq!(task.source_id, 7);
        assert_eq!(task.start_url.as_deref(), Some("https://site7.example.com/help"));
    }
    assert_eq!(tasks[0].scenario, "1. Click search");
    assert_eq!(tasks[0].config.chunk_type(), Some(ChunkType::TaskDriven));
    assert_eq!(tasks[1].config.chunk_type(), Some(ChunkType::Exploratory));
    assert_eq!(tasks[2].config.chunk_type(), Some(ChunkType::Exploratory));
}

// ============ Build task claims ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_yield_one_owner() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &[]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;

    let stale_before = chrono::Utc::now().timestamp() - 900;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            build_tasks::claim_action_build(&pool, stale_before).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            winners.push(id);
        }
    }
    assert_eq!(winners, vec![task_id]);

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage, "action_build");
    assert_eq!(task.stage_status, "running");
    assert!(task.action_started_at.is_some());
}

#[tokio::test]
async fn stale_action_build_is_reclaimed_first() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &[]).await;
    let stale_before = || chrono::Utc::now().timestamp() - 15 * 60;

    let abandoned = knowledge_complete_task(&pool, seeded.source_id).await;
    assert_eq!(
        build_tasks::claim_action_build(&pool, stale_before()).await.unwrap(),
        Some(abandoned)
    );
    age_row(&pool, "build_tasks", abandoned, 20 * 60).await;

    // Older than the abandoned one, so ordering by age alone would pick it.
    let fresh = knowledge_complete_task(&pool, seeded.source_id).await;
    age_row(&pool, "build_tasks", fresh, 60 * 60).await;

    assert_eq!(
        build_tasks::claim_action_build(&pool, stale_before()).await.unwrap(),
        Some(abandoned)
    );
    assert_eq!(
        build_tasks::claim_action_build(&pool, stale_before()).await.unwrap(),
        Some(fresh)
    );
    assert_eq!(
        build_tasks::claim_action_build(&pool, stale_before()).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn live_owner_is_not_reclaimed() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &[]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;
    let stale_before = chrono::Utc::now().timestamp() - 15 * 60;

    assert_eq!(
        build_tasks::claim_action_build(&pool, stale_before).await.unwrap(),
        Some(task_id)
    );
    assert!(build_tasks::heartbeat(&pool, task_id).await.unwrap());
    assert_eq!(
        build_tasks::claim_action_build(&pool, stale_before).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn stage_transitions_are_guarded() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &[]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;

    // Not yet in action_build.
    assert!(!build_tasks::complete_action_build(&pool, task_id).await.unwrap());
    assert!(!build_tasks::complete_knowledge_build(&pool, task_id, seeded.source_id)
        .await
        .unwrap());

    build_tasks::claim_action_build(&pool, 0).await.unwrap();
    assert!(build_tasks::complete_action_build(&pool, task_id).await.unwrap());
    assert!(!build_tasks::fail_build_task(&pool, task_id, "late").await.unwrap());

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!((task.stage.as_str(), task.stage_status.as_str()), ("action_build", "completed"));
    assert!(task.action_completed_at.is_some());
}

// ============ Recording tasks ============

#[tokio::test]
async fn stale_recording_task_is_reclaimed_with_new_attempt() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["first", "second"]).await;
    TaskGenerator::new(pool.clone())
        .generate(1, seeded.source_id, 10)
        .await
        .unwrap();
    let stale_before = || chrono::Utc::now().timestamp() - 30 * 60;

    let first = recording_tasks::claim_next(&pool, stale_before()).await.unwrap().unwrap();
    assert_eq!(first.attempt_count, 1);
    assert!(first.started_at.is_some());
    age_row(&pool, "recording_tasks", first.id, 31 * 60).await;

    let reclaimed = recording_tasks::claim_next(&pool, stale_before()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, first.id);
    assert_eq!(reclaimed.attempt_count, 2);

    let second = recording_tasks::claim_next(&pool, stale_before()).await.unwrap().unwrap();
    assert_ne!(second.id, first.id);
    assert!(recording_tasks::claim_next(&pool, stale_before()).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_execution_retries_up_to_max_attempts() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["only"]).await;
    TaskGenerator::new(pool.clone())
        .generate(1, seeded.source_id, 10)
        .await
        .unwrap();

    let task = recording_tasks::claim_next(&pool, 0).await.unwrap().unwrap();
    let status = recording_tasks::mark_failed(&pool, task.id, "timeout", 2).await.unwrap();
    assert_eq!(status, RecordingStatus::Pending);

    let task = recording_tasks::claim_next(&pool, 0).await.unwrap().unwrap();
    assert_eq!(task.attempt_count, 2);
    let status = recording_tasks::mark_failed(&pool, task.id, "timeout again", 2).await.unwrap();
    assert_eq!(status, RecordingStatus::Failed);

    let row = recording_tasks::get_recording_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(row.error_message.as_deref(), Some("timeout again"));
    assert!(row.completed_at.is_some());
    assert!(recording_tasks::claim_next(&pool, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn worker_records_failures_and_panics() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["fine", "please fail", "panic here"]).await;
    TaskGenerator::new(pool.clone())
        .generate(1, seeded.source_id, 10)
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::default());
    let mut worker = RecordingTaskQueueWorker::new(pool.clone(), fast_worker(), executor.clone());
    worker.start();

    for _ in 0..200 {
        let progress = recording_tasks::progress_for_build_task(&pool, 1).await.unwrap();
        if progress.outstanding() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker.stop(Duration::from_secs(5)).await;
    assert!(!worker.status().started);

    let tasks = recording_tasks::list_for_build_task(&pool, 1).await.unwrap();

    let fine = by_scenario(&tasks, "fine");
    assert_eq!(fine.status, "completed");
    assert_eq!(fine.progress, 100);

    let failed = by_scenario(&tasks, "please fail");
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.error_message.as_deref().unwrap().contains("selector not found"));

    let panicked = by_scenario(&tasks, "panic here");
    assert_eq!(panicked.status, "failed");
    assert!(panicked.error_message.as_deref().unwrap().contains("panicked"));

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn worker_never_exceeds_concurrency() {
    let (_tmp, pool) = setup_pool().await;
    let contents: Vec<String> = (0..12).map(|i| format!("Page {}", i)).collect();
    let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
    let seeded = seed_source(&pool, "docs", &refs).await;
    TaskGenerator::new(pool.clone())
        .generate(1, seeded.source_id, 20)
        .await
        .unwrap();

    let executor = Arc::new(GaugeExecutor::default());
    let settings = WorkerSettings {
        concurrency: 3,
        ..fast_worker()
    };
    let mut worker = RecordingTaskQueueWorker::new(pool.clone(), settings, executor.clone());
    worker.start();

    for _ in 0..200 {
        assert!(worker.status().running <= 3);
        let progress = recording_tasks::progress_for_build_task(&pool, 1).await.unwrap();
        if progress.completed == 12 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    worker.stop(Duration::from_secs(5)).await;

    let progress = recording_tasks::progress_for_build_task(&pool, 1).await.unwrap();
    assert_eq!(progress.completed, 12);
    assert_eq!(executor.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stop_timeout_cancels_running_executions() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["slow page"]).await;
    TaskGenerator::new(pool.clone())
        .generate(1, seeded.source_id, 10)
        .await
        .unwrap();

    let executor = Arc::new(HangingExecutor::default());
    let mut worker = RecordingTaskQueueWorker::new(pool.clone(), fast_worker(), executor.clone());
    worker.start();
    wait_for_running_recording(&pool, 1).await;

    worker.stop(Duration::from_millis(200)).await;

    for _ in 0..40 {
        if executor.dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(executor.dropped.load(Ordering::SeqCst));

    // The row is left for stale recovery.
    let tasks = recording_tasks::list_for_build_task(&pool, 1).await.unwrap();
    assert_eq!(tasks[0].status, "running");
}

// ============ Runner ============

#[tokio::test]
async fn runner_without_source_records_error() {
    let (_tmp, pool) = setup_pool().await;
    let now = chrono::Utc::now().timestamp();
    let task_id: i64 = sqlx::query_scalar(
        "INSERT INTO build_tasks (source_url, stage, stage_status, created_at, updated_at) VALUES ('https://x.example.com', 'action_build', 'running', ?, ?) RETURNING id",
    )
    .bind(now)
    .bind(now)
    .fetch_one(&pool)
    .await
    .unwrap();

    let runner = BuildTaskRunner::new(pool.clone(), task_id, RunnerSettings::default());
    let err = runner.run().await.unwrap_err();
    assert!(err.to_string().contains("no source_id"));

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage_status, "error");
    let last_error = task.config_json()["last_error"].as_str().unwrap().to_string();
    assert!(last_error.contains("no source_id"));
}

#[tokio::test]
async fn runner_honours_task_limit_override() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["a", "b", "c", "d", "e"]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;
    sqlx::query("UPDATE build_tasks SET config = '{\"recording_task_limit\": 2}' WHERE id = ?")
        .bind(task_id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(
        build_tasks::claim_action_build(&pool, 0).await.unwrap(),
        Some(task_id)
    );

    let mut worker = RecordingTaskQueueWorker::new(
        pool.clone(),
        fast_worker(),
        Arc::new(ScriptedExecutor::default()),
    );
    worker.start();

    let runner = BuildTaskRunner::new(
        pool.clone(),
        task_id,
        RunnerSettings {
            recording_task_limit: 10,
            progress_poll_interval: Duration::from_millis(50),
        },
    );
    tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .unwrap()
        .unwrap();
    worker.stop(Duration::from_secs(5)).await;

    let progress = recording_tasks::progress_for_build_task(&pool, task_id).await.unwrap();
    assert_eq!(progress.total, 2);
    assert_eq!(progress.completed, 2);

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage_status, "completed");
}

#[tokio::test]
async fn runner_with_no_chunks_completes_immediately() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "empty", &[]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;
    build_tasks::claim_action_build(&pool, 0).await.unwrap();

    let runner = BuildTaskRunner::new(pool.clone(), task_id, RunnerSettings::default());
    runner.run().await.unwrap();

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage_status, "completed");
    assert!(task.action_completed_at.is_some());
}

#[tokio::test]
async fn runner_ignores_task_it_does_not_own() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "docs", &["a", "b"]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;

    let runner = BuildTaskRunner::new(pool.clone(), task_id, RunnerSettings::default());
    runner.run().await.unwrap();

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!((task.stage.as_str(), task.stage_status.as_str()), ("knowledge_build", "completed"));
    assert_eq!(count_tasks(&pool, seeded.source_id).await, 0);
}

#[tokio::test]
async fn runner_retries_completion_after_store_error() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "empty", &[]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;
    build_tasks::claim_action_build(&pool, 0).await.unwrap();

    sqlx::query(
        r#"
        CREATE TRIGGER hold_completion BEFORE UPDATE OF stage_status ON build_tasks
        WHEN NEW.stage_status = 'completed'
        BEGIN SELECT RAISE(ABORT, 'store unavailable'); END
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let runner = BuildTaskRunner::new(
        pool.clone(),
        task_id,
        RunnerSettings {
            recording_task_limit: 10,
            progress_poll_interval: Duration::from_millis(50),
        },
    );
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage_status, "running");

    sqlx::query("DROP TRIGGER hold_completion")
        .execute(&pool)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage_status, "completed");
}

// ============ Coordinator ============

#[tokio::test]
async fn coordinator_drives_build_to_completion() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(
        &pool,
        "site-a",
        &["1. Click search", "Pricing overview", "This step will fail"],
    )
    .await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;

    let executor = Arc::new(ScriptedExecutor::default());
    let mut coordinator = Coordinator::new(pool.clone(), fast_coordinator(), executor.clone());
    coordinator.start();

    wait_for_stage_status(&pool, task_id, "completed").await;
    coordinator.stop(Duration::from_secs(5)).await;
    assert_eq!(coordinator.running_count(), 0);

    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage, "action_build");
    assert!(task.action_started_at.is_some());
    assert!(task.action_completed_at.is_some());

    let progress = recording_tasks::progress_for_build_task(&pool, task_id).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.failed, 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn coordinator_claim_returns_none_when_idle() {
    let (_tmp, pool) = setup_pool().await;
    let coordinator = Coordinator::new(
        pool.clone(),
        fast_coordinator(),
        Arc::new(ScriptedExecutor::default()),
    );
    assert_eq!(coordinator.claim_build_task().await, None);
    assert_eq!(coordinator.running_count(), 0);
    assert!(!coordinator.worker_status().started);
}

#[tokio::test]
async fn coordinator_stop_is_bounded() {
    let (_tmp, pool) = setup_pool().await;
    let seeded = seed_source(&pool, "slow", &["a"]).await;
    let task_id = knowledge_complete_task(&pool, seeded.source_id).await;

    let mut coordinator = Coordinator::new(
        pool.clone(),
        fast_coordinator(),
        Arc::new(HangingExecutor::default()),
    );
    coordinator.start();
    wait_for_running_recording(&pool, task_id).await;

    let started = std::time::Instant::now();
    coordinator.stop(Duration::from_millis(300)).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    // Abandoned work stays claimable once stale.
    let task = build_tasks::get_build_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.stage_status, "running");
}

#[tokio::test]
async fn coordinator_respects_max_concurrent_build_tasks() {
    let (_tmp, pool) = setup_pool().await;
    let mut task_ids = Vec::new();
    for i in 0..4 {
        let seeded = seed_source(&pool, &format!("site-{}", i), &["a"]).await;
        task_ids.push(knowledge_complete_task(&pool, seeded.source_id).await);
    }

    let settings = CoordinatorSettings {
        max_concurrent_build_tasks: 2,
        ..fast_coordinator()
    };
    let mut coordinator =
        Coordinator::new(pool.clone(), settings, Arc::new(HangingExecutor::default()));
    coordinator.start();

    for _ in 0..200 {
        if coordinator.running_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // Give the loop several more polls to overshoot if it were going to.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let running: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM build_tasks WHERE stage = 'action_build' AND stage_status = 'running'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(running, 2);
    assert_eq!(coordinator.running_count(), 2);

    let waiting: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM build_tasks WHERE stage = 'knowledge_build' AND stage_status = 'completed'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(waiting, 2);

    coordinator.stop(Duration::from_millis(300)).await;
}

async fn wait_for_running_recording(pool: &SqlitePool, task_id: i64) {
    for _ in 0..200 {
        let progress = recording_tasks::progress_for_build_task(pool, task_id).await.unwrap();
        if progress.running > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no recording task started for build task {}", task_id);
}
