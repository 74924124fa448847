//! Keyword search over recording tasks.
//!
//! Matches a case-insensitive substring against the task scenario, its start
//! URL, and the title and URL of the document the task's chunk came from.
//! `%` and `_` in the query match literally.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::stats::format_ts_iso;

pub const DEFAULT_SEARCH_LIMIT: i64 = 20;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SearchHit {
    pub task_id: i64,
    pub build_task_id: i64,
    pub source_id: i64,
    pub chunk_id: i64,
    pub scenario: String,
    pub status: String,
    pub start_url: Option<String>,
    pub document_title: Option<String>,
    pub document_url: Option<String>,
    pub updated_at: i64,
}

/// Most recently updated matches first. A blank query returns nothing.
pub async fn search_tasks(
    pool: &SqlitePool,
    query: &str,
    source_id: Option<i64>,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let query = query.trim();
    if query.is_empty() || limit <= 0 {
        return Ok(Vec::new());
    }

    let pattern = format!("%{}%", escape_like(query));

    let hits = sqlx::query_as::<_, SearchHit>(
        r#"
        SELECT
            rt.id AS task_id,
            rt.build_task_id,
            rt.source_id,
            rt.chunk_id,
            rt.scenario,
            rt.status,
            rt.start_url,
            d.title AS document_title,
            d.url AS document_url,
            rt.updated_at
        FROM recording_tasks rt
        LEFT JOIN chunks c ON c.id = rt.chunk_id
        LEFT JOIN documents d ON d.id = c.document_id
        WHERE (?1 IS NULL OR rt.source_id = ?1)
          AND (rt.scenario LIKE ?2 ESCAPE '\'
               OR rt.start_url LIKE ?2 ESCAPE '\'
               OR d.title LIKE ?2 ESCAPE '\'
               OR d.url LIKE ?2 ESCAPE '\')
        ORDER BY rt.updated_at DESC, rt.id DESC
        LIMIT ?3
        "#,
    )
    .bind(source_id)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(hits)
}

/// Escape LIKE wildcards so they match themselves under `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub async fn run_search(
    config: &Config,
    query: &str,
    source_id: Option<i64>,
    limit: Option<i64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let hits = search_tasks(&pool, query, source_id, limit.unwrap_or(DEFAULT_SEARCH_LIMIT)).await?;

    if hits.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{}] task {} (build {}, source {})",
            i + 1,
            hit.status,
            hit.task_id,
            hit.build_task_id,
            hit.source_id
        );
        println!("    scenario: {}", hit.scenario);
        if let Some(url) = hit.start_url.as_deref().or(hit.document_url.as_deref()) {
            println!("    url: {}", url);
        }
        if let Some(title) = &hit.document_title {
            println!("    document: {}", title);
        }
        println!("    updated: {}", format_ts_iso(hit.updated_at));
        println!();
    }

    pool.close().await;
    Ok(())
}
