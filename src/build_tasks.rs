//! Build task store operations.
//!
//! Every state change is a single guarded `UPDATE`: the `WHERE` clause names
//! the stage and status the caller expects, so a write from an owner that lost
//! its lease (or a stage that already moved on) matches zero rows instead of
//! regressing the task.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::{BuildTask, NewBuildTask};

/// Insert a new task at `init/pending`.
pub async fn submit_build_task(pool: &SqlitePool, task: &NewBuildTask) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    let config = task
        .config
        .clone()
        .unwrap_or_else(|| serde_json::json!({}))
        .to_string();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO build_tasks (source_url, source_name, source_category, stage, stage_status,
                                 config, created_at, updated_at)
        VALUES (?, ?, ?, 'init', 'pending', ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&task.source_url)
    .bind(&task.source_name)
    .bind(task.source_category.as_str())
    .bind(config)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

pub async fn get_build_task(pool: &SqlitePool, id: i64) -> Result<Option<BuildTask>> {
    let task = sqlx::query_as::<_, BuildTask>("SELECT * FROM build_tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// Most recently updated tasks first, optionally filtered by stage.
pub async fn list_build_tasks(
    pool: &SqlitePool,
    stage: Option<&str>,
    limit: i64,
) -> Result<Vec<BuildTask>> {
    let tasks = sqlx::query_as::<_, BuildTask>(
        r#"
        SELECT * FROM build_tasks
        WHERE (? IS NULL OR stage = ?)
        ORDER BY updated_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(stage)
    .bind(stage)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Claim the oldest `init/pending` task for knowledge extraction.
///
/// This is the contract the external knowledge worker polls with.
pub async fn claim_knowledge_build(pool: &SqlitePool) -> Result<Option<BuildTask>> {
    let now = chrono::Utc::now().timestamp();
    let task = sqlx::query_as::<_, BuildTask>(
        r#"
        UPDATE build_tasks
        SET stage = 'knowledge_build',
            stage_status = 'running',
            knowledge_started_at = ?,
            updated_at = ?
        WHERE id = (
            SELECT id FROM build_tasks
            WHERE stage = 'init' AND stage_status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
        )
          AND stage = 'init'
          AND stage_status = 'pending'
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(task)
}

/// Mark the knowledge stage done and record the resolved source.
///
/// Returns `false` if the task was not in `knowledge_build/running`.
pub async fn complete_knowledge_build(
    pool: &SqlitePool,
    task_id: i64,
    source_id: i64,
) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE build_tasks
        SET stage_status = 'completed',
            source_id = ?,
            knowledge_completed_at = ?,
            updated_at = ?
        WHERE id = ?
          AND stage = 'knowledge_build'
          AND stage_status = 'running'
        "#,
    )
    .bind(source_id)
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Atomically claim one build task for the action stage.
///
/// Stale `action_build/running` tasks (owner presumed dead) win over freshly
/// completed knowledge tasks. The eligibility predicate is repeated in the
/// outer `WHERE` so the row is re-checked under the write lock.
pub async fn claim_action_build(pool: &SqlitePool, stale_before: i64) -> Result<Option<i64>> {
    let now = chrono::Utc::now().timestamp();
    let claimed: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE build_tasks
        SET stage = 'action_build',
            stage_status = 'running',
            action_started_at = COALESCE(action_started_at, ?),
            updated_at = ?
        WHERE id = (
            SELECT id FROM build_tasks
            WHERE (stage = 'action_build' AND stage_status = 'running' AND updated_at < ?)
               OR (stage = 'knowledge_build' AND stage_status = 'completed')
            ORDER BY CASE WHEN stage = 'action_build' THEN 0 ELSE 1 END,
                     updated_at ASC,
                     id ASC
            LIMIT 1
        )
          AND ((stage = 'action_build' AND stage_status = 'running' AND updated_at < ?)
               OR (stage = 'knowledge_build' AND stage_status = 'completed'))
        RETURNING id
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(stale_before)
    .bind(stale_before)
    .fetch_optional(pool)
    .await?;

    Ok(claimed)
}

/// Refresh `updated_at` so a live owner stays out of the stale window.
pub async fn heartbeat(pool: &SqlitePool, task_id: i64) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE build_tasks
        SET updated_at = ?
        WHERE id = ? AND stage = 'action_build' AND stage_status = 'running'
        "#,
    )
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn complete_action_build(pool: &SqlitePool, task_id: i64) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE build_tasks
        SET stage_status = 'completed',
            action_completed_at = ?,
            updated_at = ?
        WHERE id = ? AND stage = 'action_build' AND stage_status = 'running'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark the task's current stage as errored, keeping the message under
/// `config.last_error`. Leaves the stage itself untouched.
pub async fn fail_build_task(pool: &SqlitePool, task_id: i64, error_msg: &str) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE build_tasks
        SET stage_status = 'error',
            config = json_set(COALESCE(NULLIF(config, ''), '{}'), '$.last_error', ?),
            updated_at = ?
        WHERE id = ? AND stage_status IN ('pending', 'running')
        "#,
    )
    .bind(error_msg)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Counts of tasks per `(stage, stage_status)` pair, for metrics.
pub async fn count_by_stage(pool: &SqlitePool) -> Result<Vec<(String, String, i64)>> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT stage, stage_status, COUNT(*)
        FROM build_tasks
        GROUP BY stage, stage_status
        ORDER BY stage, stage_status
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
