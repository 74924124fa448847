//! Recording task store operations.

use anyhow::Result;
use serde::Serialize;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::{RecordingStatus, RecordingTask, TaskConfig};

/// Fields for a freshly generated recording task.
#[derive(Debug, Clone)]
pub struct NewRecordingTask {
    pub source_id: i64,
    pub build_task_id: i64,
    pub chunk_id: i64,
    pub scenario: String,
    pub start_url: Option<String>,
    pub config: TaskConfig,
}

/// Insert a pending task unless one already exists for `(source_id, chunk_id)`.
///
/// Returns `true` if a row was inserted.
pub async fn insert_pending<'e, E>(executor: E, task: &NewRecordingTask) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO recording_tasks (
            source_id, build_task_id, chunk_id, scenario, status, progress,
            start_url, config, attempt_count, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(task.source_id)
    .bind(task.build_task_id)
    .bind(task.chunk_id)
    .bind(&task.scenario)
    .bind(&task.start_url)
    .bind(task.config.raw().to_string())
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_recording_task(pool: &SqlitePool, id: i64) -> Result<Option<RecordingTask>> {
    let task = sqlx::query_as::<_, RecordingTask>("SELECT * FROM recording_tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

pub async fn list_for_build_task(pool: &SqlitePool, build_task_id: i64) -> Result<Vec<RecordingTask>> {
    let tasks = sqlx::query_as::<_, RecordingTask>(
        "SELECT * FROM recording_tasks WHERE build_task_id = ? ORDER BY id ASC",
    )
    .bind(build_task_id)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Atomically move one task to `running` and bump its attempt count.
///
/// Tasks left `running` by a dead worker (last update before `stale_before`)
/// are reclaimed ahead of pending ones.
pub async fn claim_next(pool: &SqlitePool, stale_before: i64) -> Result<Option<RecordingTask>> {
    let now = chrono::Utc::now().timestamp();
    let task = sqlx::query_as::<_, RecordingTask>(
        r#"
        UPDATE recording_tasks
        SET status = 'running',
            attempt_count = attempt_count + 1,
            started_at = ?,
            updated_at = ?
        WHERE id = (
            SELECT id FROM recording_tasks
            WHERE status = 'pending'
               OR (status = 'running' AND updated_at < ?)
            ORDER BY CASE WHEN status = 'running' THEN 0 ELSE 1 END, id ASC
            LIMIT 1
        )
          AND (status = 'pending' OR (status = 'running' AND updated_at < ?))
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(stale_before)
    .bind(stale_before)
    .fetch_optional(pool)
    .await?;

    Ok(task)
}

pub async fn mark_completed(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE recording_tasks
        SET status = 'completed',
            progress = 100,
            error_message = NULL,
            completed_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed execution.
///
/// While `attempt_count < max_attempts` the task goes back to `pending` for
/// another worker to pick up; otherwise it stays `failed`. Returns the status
/// written.
pub async fn mark_failed(
    pool: &SqlitePool,
    id: i64,
    error_message: &str,
    max_attempts: i64,
) -> Result<RecordingStatus> {
    let now = chrono::Utc::now().timestamp();
    let status: String = sqlx::query_scalar(
        r#"
        UPDATE recording_tasks
        SET status = CASE WHEN attempt_count < ? THEN 'pending' ELSE 'failed' END,
            error_message = ?,
            completed_at = CASE WHEN attempt_count < ? THEN NULL ELSE ? END,
            updated_at = ?
        WHERE id = ?
        RETURNING status
        "#,
    )
    .bind(max_attempts)
    .bind(error_message)
    .bind(max_attempts)
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_one(pool)
    .await?;

    status.parse()
}

/// Status counts for the recording tasks of one build task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl TaskProgress {
    /// Tasks still waiting on the queue worker.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running
    }

    pub fn settled(&self) -> i64 {
        self.completed + self.failed
    }
}

pub async fn progress_for_build_task(pool: &SqlitePool, build_task_id: i64) -> Result<TaskProgress> {
    let (total, pending, running, completed, failed): (i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
        FROM recording_tasks
        WHERE build_task_id = ?
        "#,
    )
    .bind(build_task_id)
    .fetch_one(pool)
    .await?;

    Ok(TaskProgress {
        total,
        pending,
        running,
        completed,
        failed,
    })
}
