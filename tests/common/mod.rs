#![allow(dead_code)]

use actionbook_builder::build_tasks;
use actionbook_builder::config::Config;
use actionbook_builder::db;
use actionbook_builder::migrate;
use actionbook_builder::models::{ChunkUpload, NewBuildTask, SourceCategory};
use actionbook_builder::versions::VersionManager;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A fresh migrated database in a temp dir. Keep the `TempDir` alive for the
/// duration of the test.
pub async fn setup_pool() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data").join("abx.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool)
}

pub struct SeededSource {
    pub source_id: i64,
    pub version_id: i64,
    pub document_id: i64,
}

/// Create `name` with a building version holding one document whose chunks
/// are `contents`, in order.
pub async fn seed_source(pool: &SqlitePool, name: &str, contents: &[&str]) -> SeededSource {
    let versions = VersionManager::new(pool.clone());
    let version = versions.create_version(name, None, None).await.unwrap();
    let document_id = versions
        .add_document(
            version.id,
            &format!("https://{}.example.com/help", name),
            Some("Help center"),
            None,
        )
        .await
        .unwrap();

    if !contents.is_empty() {
        let chunks: Vec<ChunkUpload> = contents
            .iter()
            .map(|content| ChunkUpload {
                document_id,
                content: content.to_string(),
                chunk_index: None,
                content_hash: None,
                heading: None,
                token_count: None,
            })
            .collect();
        versions.upload_chunks(version.id, &chunks).await.unwrap();
    }

    SeededSource {
        source_id: version.source_id,
        version_id: version.id,
        document_id,
    }
}

/// Submit a build task and walk it through the knowledge stage so it is
/// `knowledge_build/completed` against `source_id`.
pub async fn knowledge_complete_task(pool: &SqlitePool, source_id: i64) -> i64 {
    let id = build_tasks::submit_build_task(
        pool,
        &NewBuildTask {
            source_url: "https://example.com".to_string(),
            source_name: None,
            source_category: SourceCategory::Help,
            config: None,
        },
    )
    .await
    .unwrap();

    let claimed = build_tasks::claim_knowledge_build(pool).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert!(build_tasks::complete_knowledge_build(pool, id, source_id)
        .await
        .unwrap());
    id
}

/// Push a row's `updated_at` into the past so it looks abandoned.
pub async fn age_row(pool: &SqlitePool, table: &str, id: i64, secs: i64) {
    let sql = format!("UPDATE {} SET updated_at = updated_at - ? WHERE id = ?", table);
    sqlx::query(&sql).bind(secs).bind(id).execute(pool).await.unwrap();
}
