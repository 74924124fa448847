//! Per-source content versions (blue/green publish).
//!
//! A source accumulates versions numbered 1, 2, 3, … . New content is
//! uploaded into the single `building` version; `publish` then flips it to
//! `active` and archives the previous one in one transaction, so readers that
//! follow `sources.current_version_id` always see a complete corpus.
//!
//! Every multi-statement operation opens its transaction with a write so
//! the SQLite write lock is held from the first statement; a deferred
//! read-then-write transaction could otherwise fail to upgrade under
//! contention.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::error::VersionError;
use crate::models::{ChunkUpload, Source, SourceVersion, VersionStatus};

/// SHA-256 of `text`, hex encoded and cut to 16 characters.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub source_id: i64,
    pub previous_version_id: Option<i64>,
    pub active_version_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub version_id: i64,
    pub documents: usize,
    pub chunks_deleted: u64,
    pub chunks_inserted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteSummary {
    pub version_id: i64,
    pub documents_deleted: u64,
    pub chunks_deleted: u64,
}

#[derive(Clone)]
pub struct VersionManager {
    pool: SqlitePool,
}

impl VersionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a new `building` version for `source_name`, creating the source
    /// on first use.
    pub async fn create_version(
        &self,
        source_name: &str,
        commit_message: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<SourceVersion, VersionError> {
        let name = source_name.trim();
        if name.is_empty() {
            return Err(VersionError::SourceNotFound(source_name.to_string()));
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Find-or-create; the upsert is also the write that takes the lock.
        let source_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sources (name, base_url, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET updated_at = sources.updated_at
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let building: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM source_versions WHERE source_id = ? AND status = 'building' LIMIT 1",
        )
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await?;

        if building.is_some() {
            return Err(VersionError::SyncInProgress(name.to_string()));
        }

        let inserted = sqlx::query_as::<_, SourceVersion>(
            r#"
            INSERT INTO source_versions (source_id, version_number, status, commit_message,
                                         created_by, created_at)
            VALUES (?, (SELECT COALESCE(MAX(version_number), 0) + 1
                        FROM source_versions WHERE source_id = ?),
                    'building', ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(source_id)
        .bind(commit_message)
        .bind(created_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let version = match inserted {
            Ok(version) => version,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(VersionError::SyncInProgress(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;

        info!(
            source = name,
            version_id = version.id,
            version_number = version.version_number,
            "created building version"
        );

        Ok(version)
    }

    pub async fn get_source(&self, source_name: &str) -> Result<Source, VersionError> {
        let name = source_name.trim();
        if name.is_empty() {
            return Err(VersionError::SourceNotFound(source_name.to_string()));
        }

        sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VersionError::SourceNotFound(name.to_string()))
    }

    /// Versions of a source, newest first.
    pub async fn list_versions(&self, source_name: &str) -> Result<Vec<SourceVersion>, VersionError> {
        let source = self.get_source(source_name).await?;

        let versions = sqlx::query_as::<_, SourceVersion>(
            "SELECT * FROM source_versions WHERE source_id = ? ORDER BY version_number DESC",
        )
        .bind(source.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(versions)
    }

    pub async fn get_version(&self, version_id: i64) -> Result<SourceVersion, VersionError> {
        sqlx::query_as::<_, SourceVersion>("SELECT * FROM source_versions WHERE id = ?")
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VersionError::VersionNotFound(version_id))
    }

    /// Attach a document to a building version. Knowledge extraction normally
    /// writes documents itself; this is the same insert for local tooling.
    pub async fn add_document(
        &self,
        version_id: i64,
        url: &str,
        title: Option<&str>,
        content_md: Option<&str>,
    ) -> Result<i64, VersionError> {
        let mut tx = self.pool.begin().await?;
        let version = lock_building(&mut tx, version_id).await?;

        let now = chrono::Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (source_id, source_version_id, url, url_hash, title,
                                   content_md, content_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(version.source_id)
        .bind(version_id)
        .bind(url)
        .bind(content_hash(url))
        .bind(title)
        .bind(content_md)
        .bind(content_md.map(content_hash))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Replace the chunks of every document named in `chunks`.
    ///
    /// The whole call is one transaction: either every document's chunk set
    /// is replaced or none is.
    pub async fn upload_chunks(
        &self,
        version_id: i64,
        chunks: &[ChunkUpload],
    ) -> Result<UploadSummary, VersionError> {
        if chunks.is_empty() {
            return Err(VersionError::InvalidDocumentIds(
                "no chunks supplied".to_string(),
            ));
        }

        let mut by_document: BTreeMap<i64, Vec<&ChunkUpload>> = BTreeMap::new();
        for chunk in chunks {
            by_document.entry(chunk.document_id).or_default().push(chunk);
        }

        let mut tx = self.pool.begin().await?;
        let version = lock_building(&mut tx, version_id).await?;

        let owned: HashSet<i64> =
            sqlx::query_scalar::<_, i64>("SELECT id FROM documents WHERE source_version_id = ?")
                .bind(version_id)
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let foreign: Vec<String> = by_document
            .keys()
            .filter(|id| !owned.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !foreign.is_empty() {
            return Err(VersionError::InvalidDocumentIds(format!(
                "documents not in version {}: {}",
                version_id,
                foreign.join(", ")
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let mut chunks_deleted = 0u64;
        let mut chunks_inserted = 0u64;

        for (document_id, doc_chunks) in &by_document {
            chunks_deleted += sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            for (position, chunk) in doc_chunks.iter().enumerate() {
                let hash = chunk
                    .content_hash
                    .clone()
                    .unwrap_or_else(|| content_hash(&chunk.content));
                let token_count = chunk
                    .token_count
                    .unwrap_or(chunk.content.split_whitespace().count() as i64);

                sqlx::query(
                    r#"
                    INSERT INTO chunks (document_id, source_version_id, chunk_index, content,
                                        content_hash, heading, token_count, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(document_id)
                .bind(version.id)
                .bind(chunk.chunk_index.unwrap_or(position as i64))
                .bind(&chunk.content)
                .bind(hash)
                .bind(&chunk.heading)
                .bind(token_count)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                chunks_inserted += 1;
            }
        }

        tx.commit().await?;

        info!(
            version_id,
            documents = by_document.len(),
            chunks_deleted,
            chunks_inserted,
            "uploaded chunks"
        );

        Ok(UploadSummary {
            version_id,
            documents: by_document.len(),
            chunks_deleted,
            chunks_inserted,
        })
    }

    /// Make a building version the active one for its source.
    ///
    /// Archiving the old version, activating this one, and moving
    /// `sources.current_version_id` commit together or not at all.
    pub async fn publish(&self, version_id: i64) -> Result<PublishOutcome, VersionError> {
        let version = self.get_version(version_id).await?;
        if version.status()? != VersionStatus::Building {
            return Err(VersionError::VersionLocked {
                id: version_id,
                status: version.status,
            });
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let pointer: Option<Option<i64>> = sqlx::query_scalar(
            "UPDATE sources SET updated_at = ? WHERE id = ? RETURNING current_version_id",
        )
        .bind(now)
        .bind(version.source_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(previous_version_id) = pointer else {
            return Err(VersionError::SourceNotFound(version.source_id.to_string()));
        };

        // The pointed-to version plus any stray active sibling.
        sqlx::query(
            r#"
            UPDATE source_versions
            SET status = 'archived'
            WHERE source_id = ?
              AND id != ?
              AND (status = 'active' OR id = ?)
            "#,
        )
        .bind(version.source_id)
        .bind(version_id)
        .bind(previous_version_id)
        .execute(&mut *tx)
        .await?;

        let activated = sqlx::query(
            r#"
            UPDATE source_versions
            SET status = 'active', published_at = ?
            WHERE id = ? AND status = 'building'
            "#,
        )
        .bind(now)
        .bind(version_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if activated != 1 {
            // Someone else published or deleted it after our read.
            tx.rollback().await?;
            let current = self.get_version(version_id).await?;
            return Err(VersionError::VersionLocked {
                id: version_id,
                status: current.status,
            });
        }

        sqlx::query("UPDATE sources SET current_version_id = ?, updated_at = ? WHERE id = ?")
            .bind(version_id)
            .bind(now)
            .bind(version.source_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            source_id = version.source_id,
            version_id,
            previous = ?previous_version_id,
            "published version"
        );

        Ok(PublishOutcome {
            source_id: version.source_id,
            previous_version_id,
            active_version_id: version_id,
        })
    }

    /// Delete a version with its documents and chunks.
    ///
    /// Refused while the source's live pointer names this version, whatever
    /// the version's stored status says.
    pub async fn delete_version(&self, version_id: i64) -> Result<DeleteSummary, VersionError> {
        let mut tx = self.pool.begin().await?;

        let source_id: Option<i64> = sqlx::query_scalar(
            "UPDATE source_versions SET status = status WHERE id = ? RETURNING source_id",
        )
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(source_id) = source_id else {
            return Err(VersionError::VersionNotFound(version_id));
        };

        let current: Option<Option<i64>> =
            sqlx::query_scalar("SELECT current_version_id FROM sources WHERE id = ?")
                .bind(source_id)
                .fetch_optional(&mut *tx)
                .await?;
        if current.flatten() == Some(version_id) {
            return Err(VersionError::CannotDeleteReferenced(version_id));
        }

        let chunks_deleted = sqlx::query(
            r#"
            DELETE FROM chunks
            WHERE source_version_id = ?
               OR document_id IN (SELECT id FROM documents WHERE source_version_id = ?)
            "#,
        )
        .bind(version_id)
        .bind(version_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let documents_deleted = sqlx::query("DELETE FROM documents WHERE source_version_id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM source_versions WHERE id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            version_id,
            documents_deleted, chunks_deleted, "deleted version"
        );

        Ok(DeleteSummary {
            version_id,
            documents_deleted,
            chunks_deleted,
        })
    }
}

/// Take the write lock and confirm `version_id` is still `building`.
async fn lock_building(
    tx: &mut Transaction<'_, Sqlite>,
    version_id: i64,
) -> Result<SourceVersion, VersionError> {
    let locked = sqlx::query_as::<_, SourceVersion>(
        "UPDATE source_versions SET status = status WHERE id = ? RETURNING *",
    )
    .bind(version_id)
    .fetch_optional(&mut **tx)
    .await?;

    let version = locked.ok_or(VersionError::VersionNotFound(version_id))?;
    if version.status()? != VersionStatus::Building {
        return Err(VersionError::VersionLocked {
            id: version_id,
            status: version.status,
        });
    }
    Ok(version)
}
