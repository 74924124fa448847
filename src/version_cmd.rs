//! `abx version …` commands.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::error::{parse_version_id, VersionError};
use crate::models::{ChunkUpload, SourceVersion};
use crate::stats::format_ts_iso;
use crate::versions::VersionManager;

/// Surface the machine code alongside the message, e.g.
/// `VERSION_LOCKED: version 3 is active; …`.
fn coded(err: VersionError) -> anyhow::Error {
    anyhow!("{}: {}", err.code(), err)
}

async fn manager(config: &Config) -> Result<VersionManager> {
    Ok(VersionManager::new(db::connect(config).await?))
}

pub async fn run_create(
    config: &Config,
    source: &str,
    message: Option<String>,
    author: Option<String>,
) -> Result<()> {
    let versions = manager(config).await?;
    let version = versions
        .create_version(source, message.as_deref(), author.as_deref())
        .await
        .map_err(coded)?;

    println!(
        "Created version {} (#{}) for '{}'; status building.",
        version.id, version.version_number, source
    );
    Ok(())
}

pub async fn run_list(config: &Config, source: &str) -> Result<()> {
    let versions = manager(config).await?;
    let source_row = versions.get_source(source).await.map_err(coded)?;
    let list = versions.list_versions(source).await.map_err(coded)?;

    if list.is_empty() {
        println!("No versions for '{}'.", source);
        return Ok(());
    }

    println!(
        "{:<6} {:<5} {:<10} {:<18} {}",
        "ID", "#", "STATUS", "PUBLISHED", "MESSAGE"
    );
    println!("{}", "-".repeat(72));
    for v in &list {
        let marker = if source_row.current_version_id == Some(v.id) {
            " *"
        } else {
            ""
        };
        println!(
            "{:<6} {:<5} {:<10} {:<18} {}{}",
            v.id,
            v.version_number,
            v.status,
            v.published_at.map(format_ts_iso).unwrap_or_else(|| "-".to_string()),
            v.commit_message.as_deref().unwrap_or(""),
            marker
        );
    }
    Ok(())
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let version_id = parse_version_id(id).map_err(coded)?;
    let versions = manager(config).await?;
    let version = versions.get_version(version_id).await.map_err(coded)?;
    print_version(&version);
    Ok(())
}

pub async fn run_publish(config: &Config, id: &str) -> Result<()> {
    let version_id = parse_version_id(id).map_err(coded)?;
    let versions = manager(config).await?;
    let outcome = versions.publish(version_id).await.map_err(coded)?;

    match outcome.previous_version_id {
        Some(prev) => println!(
            "Published version {} (archived version {}).",
            outcome.active_version_id, prev
        ),
        None => println!("Published version {}.", outcome.active_version_id),
    }
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let version_id = parse_version_id(id).map_err(coded)?;
    let versions = manager(config).await?;
    let summary = versions.delete_version(version_id).await.map_err(coded)?;

    println!(
        "Deleted version {} ({} documents, {} chunks).",
        summary.version_id, summary.documents_deleted, summary.chunks_deleted
    );
    Ok(())
}

pub async fn run_add_document(
    config: &Config,
    id: &str,
    url: &str,
    title: Option<String>,
    content_file: Option<&Path>,
) -> Result<()> {
    let version_id = parse_version_id(id).map_err(coded)?;
    let content = match content_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let versions = manager(config).await?;
    let document_id = versions
        .add_document(version_id, url, title.as_deref(), content.as_deref())
        .await
        .map_err(coded)?;

    println!("Added document {} to version {}.", document_id, version_id);
    Ok(())
}

/// Upload chunks from a JSON file holding either an array of chunks or an
/// object with a `chunks` array.
pub async fn run_upload(config: &Config, id: &str, file: &Path) -> Result<()> {
    let version_id = parse_version_id(id).map_err(coded)?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let chunks = parse_chunk_file(&text)
        .with_context(|| format!("Failed to parse chunks from {}", file.display()))?;

    let versions = manager(config).await?;
    let summary = versions
        .upload_chunks(version_id, &chunks)
        .await
        .map_err(coded)?;

    println!(
        "Uploaded {} chunks across {} documents to version {} (replaced {}).",
        summary.chunks_inserted, summary.documents, summary.version_id, summary.chunks_deleted
    );
    Ok(())
}

fn parse_chunk_file(text: &str) -> Result<Vec<ChunkUpload>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum ChunkFile {
        Bare(Vec<ChunkUpload>),
        Wrapped { chunks: Vec<ChunkUpload> },
    }

    Ok(match serde_json::from_str::<ChunkFile>(text)? {
        ChunkFile::Bare(chunks) | ChunkFile::Wrapped { chunks } => chunks,
    })
}

fn print_version(v: &SourceVersion) {
    println!("  id:         {}", v.id);
    println!("  source:     {}", v.source_id);
    println!("  number:     {}", v.version_number);
    println!("  status:     {}", v.status);
    if let Some(msg) = &v.commit_message {
        println!("  message:    {}", msg);
    }
    if let Some(author) = &v.created_by {
        println!("  created by: {}", author);
    }
    println!("  created:    {}", format_ts_iso(v.created_at));
    if let Some(ts) = v.published_at {
        println!("  published:  {}", format_ts_iso(ts));
    }
}
