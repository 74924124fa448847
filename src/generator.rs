//! Recording task generation.
//!
//! Turns a source's content chunks into pending recording tasks. Chunks that
//! already have a task are skipped (anti-join on `chunk_id`), and the
//! `(source_id, chunk_id)` unique index backs that up when two generators
//! race, so calling [`TaskGenerator::generate`] repeatedly only ever fills
//! the remaining gap.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::classify::classify_chunk;
use crate::models::TaskConfig;
use crate::recording_tasks::{insert_pending, NewRecordingTask};

pub const DEFAULT_GENERATE_LIMIT: i64 = 10;

const MAX_SCENARIO_CHARS: usize = 200;

#[derive(Debug, sqlx::FromRow)]
struct EligibleChunk {
    id: i64,
    content: String,
    heading: Option<String>,
    url: String,
}

#[derive(Clone)]
pub struct TaskGenerator {
    pool: SqlitePool,
}

impl TaskGenerator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create up to `limit` pending recording tasks for un-ticketed chunks of
    /// `source_id`, in chunk id order. Returns the number inserted.
    pub async fn generate(&self, build_task_id: i64, source_id: i64, limit: i64) -> Result<u64> {
        if limit <= 0 {
            return Ok(0);
        }

        let chunks = sqlx::query_as::<_, EligibleChunk>(
            r#"
            SELECT c.id, c.content, c.heading, d.url
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.source_id = ?
              AND NOT EXISTS (
                  SELECT 1 FROM recording_tasks rt
                  WHERE rt.source_id = d.source_id AND rt.chunk_id = c.id
              )
            ORDER BY c.id ASC
            LIMIT ?
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing eligible chunks for source {}", source_id))?;

        if chunks.is_empty() {
            debug!(build_task_id, source_id, "no chunks left to generate tasks for");
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in &chunks {
            let chunk_type = classify_chunk(&chunk.content);
            let task = NewRecordingTask {
                source_id,
                build_task_id,
                chunk_id: chunk.id,
                scenario: scenario_for(chunk.id, chunk.heading.as_deref(), &chunk.content),
                start_url: Some(chunk.url.clone()),
                config: TaskConfig::for_chunk_type(chunk_type),
            };
            if insert_pending(&mut *tx, &task).await? {
                inserted += 1;
            }
        }

        tx.commit().await?;

        info!(
            build_task_id,
            source_id,
            inserted,
            candidates = chunks.len(),
            "generated recording tasks"
        );

        Ok(inserted)
    }
}

/// Short human-readable label for a chunk: its heading, else its first
/// non-empty line.
fn scenario_for(chunk_id: i64, heading: Option<&str>, content: &str) -> String {
    let label = heading
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .or_else(|| content.lines().map(str::trim).find(|l| !l.is_empty()));

    match label {
        Some(text) => text.chars().take(MAX_SCENARIO_CHARS).collect(),
        None => format!("Chunk {}", chunk_id),
    }
}
