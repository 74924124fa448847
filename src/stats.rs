//! Recording task statistics.
//!
//! Counts recording tasks by status and by chunk type, overall or for one
//! source, plus a per-source breakdown. Used by `abx stats` and
//! `GET /stats` to watch a build drain.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_chunk_type: BTreeMap<String, i64>,
}

/// Per-source breakdown of recording task counts.
#[derive(Debug, Clone, Serialize)]
pub struct SourceTaskStats {
    pub source_id: i64,
    pub source: Option<String>,
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub last_activity: Option<i64>,
}

/// Counts by status and chunk type, restricted to `source_id` if given.
///
/// Tasks whose config has no `chunk_type` are counted as `unknown`.
pub async fn task_stats(pool: &SqlitePool, source_id: Option<i64>) -> Result<TaskStats> {
    let status_rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT status, COUNT(*)
        FROM recording_tasks
        WHERE (? IS NULL OR source_id = ?)
        GROUP BY status
        "#,
    )
    .bind(source_id)
    .bind(source_id)
    .fetch_all(pool)
    .await?;

    let type_rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT COALESCE(
                   CASE WHEN json_valid(config) THEN json_extract(config, '$.chunk_type') END,
                   'unknown'
               ) AS chunk_type,
               COUNT(*)
        FROM recording_tasks
        WHERE (? IS NULL OR source_id = ?)
        GROUP BY chunk_type
        "#,
    )
    .bind(source_id)
    .bind(source_id)
    .fetch_all(pool)
    .await?;

    let by_status: BTreeMap<String, i64> = status_rows.into_iter().collect();
    let total = by_status.values().sum();

    Ok(TaskStats {
        total,
        by_status,
        by_chunk_type: type_rows.into_iter().collect(),
    })
}

pub async fn source_breakdown(pool: &SqlitePool) -> Result<Vec<SourceTaskStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            rt.source_id,
            s.name AS source,
            COUNT(*) AS total,
            SUM(CASE WHEN rt.status = 'pending' THEN 1 ELSE 0 END) AS pending,
            SUM(CASE WHEN rt.status = 'running' THEN 1 ELSE 0 END) AS running,
            SUM(CASE WHEN rt.status = 'completed' THEN 1 ELSE 0 END) AS completed,
            SUM(CASE WHEN rt.status = 'failed' THEN 1 ELSE 0 END) AS failed,
            MAX(rt.updated_at) AS last_activity
        FROM recording_tasks rt
        LEFT JOIN sources s ON s.id = rt.source_id
        GROUP BY rt.source_id, s.name
        ORDER BY total DESC, rt.source_id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SourceTaskStats {
            source_id: row.get("source_id"),
            source: row.get("source"),
            total: row.get("total"),
            pending: row.get("pending"),
            running: row.get("running"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            last_activity: row.get("last_activity"),
        })
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, source_id: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = task_stats(&pool, source_id).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Recording Tasks");
    println!("===============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    if let Some(id) = source_id {
        println!("  Source:      {}", id);
    }
    println!();
    println!("  Total:       {}", stats.total);
    for status in ["pending", "running", "completed", "failed"] {
        let count = stats.by_status.get(status).copied().unwrap_or(0);
        println!("  {:<12} {}", format!("{}:", status), count);
    }

    if !stats.by_chunk_type.is_empty() {
        println!();
        println!("  By chunk type:");
        for (chunk_type, count) in &stats.by_chunk_type {
            println!("    {:<14} {}", chunk_type, count);
        }
    }

    if source_id.is_none() {
        let sources = source_breakdown(&pool).await?;
        if !sources.is_empty() {
            println!();
            println!("  By source:");
            println!(
                "  {:<24} {:>6} {:>8} {:>8} {:>10} {:>7}   {}",
                "SOURCE", "TOTAL", "PENDING", "RUNNING", "COMPLETED", "FAILED", "LAST ACTIVITY"
            );
            println!("  {}", "-".repeat(92));

            for s in &sources {
                let name = s
                    .source
                    .clone()
                    .unwrap_or_else(|| format!("#{}", s.source_id));
                let activity = match s.last_activity {
                    Some(ts) => format_ts_relative(ts),
                    None => "never".to_string(),
                };
                println!(
                    "  {:<24} {:>6} {:>8} {:>8} {:>10} {:>7}   {}",
                    name, s.total, s.pending, s.running, s.completed, s.failed, activity
                );
            }
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
