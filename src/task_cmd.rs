//! `abx task …` commands.
//!
//! Besides submission and listing, these expose the knowledge-stage store
//! contract so a pipeline can be driven by hand: claim a task, then
//! complete it against a source (or fail it).

use anyhow::{bail, Result};

use crate::build_tasks;
use crate::config::Config;
use crate::db;
use crate::models::{BuildTask, NewBuildTask, SourceCategory};
use crate::recording_tasks;
use crate::stats::format_ts_relative;

pub async fn run_submit(
    config: &Config,
    url: &str,
    name: Option<String>,
    category: SourceCategory,
    task_config: Option<String>,
) -> Result<()> {
    if url.trim().is_empty() {
        bail!("URL must not be empty");
    }
    let config_value = match task_config {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
    };

    let pool = db::connect(config).await?;
    let id = build_tasks::submit_build_task(
        &pool,
        &NewBuildTask {
            source_url: url.to_string(),
            source_name: name,
            source_category: category,
            config: config_value,
        },
    )
    .await?;

    println!("Submitted build task {} for {}", id, url);
    pool.close().await;
    Ok(())
}

pub async fn run_list(config: &Config, stage: Option<String>, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let tasks = build_tasks::list_build_tasks(&pool, stage.as_deref(), limit).await?;

    if tasks.is_empty() {
        println!("No build tasks.");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<6} {:<16} {:<10} {:<8} {:<40} {}",
        "ID", "STAGE", "STATUS", "SOURCE", "URL", "UPDATED"
    );
    println!("{}", "-".repeat(100));
    for task in &tasks {
        println!(
            "{:<6} {:<16} {:<10} {:<8} {:<40} {}",
            task.id,
            task.stage,
            task.stage_status,
            task.source_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            task.source_url,
            format_ts_relative(task.updated_at)
        );
    }

    pool.close().await;
    Ok(())
}

pub async fn run_show(config: &Config, id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let Some(task) = build_tasks::get_build_task(&pool, id).await? else {
        bail!("Build task {} not found", id);
    };
    let progress = recording_tasks::progress_for_build_task(&pool, id).await?;

    print_task(&task);
    println!(
        "  recording:  {} total, {} pending, {} running, {} completed, {} failed",
        progress.total, progress.pending, progress.running, progress.completed, progress.failed
    );
    if let Some(err) = task.config_json().get("last_error").and_then(|v| v.as_str()) {
        println!("  last error: {}", err);
    }

    pool.close().await;
    Ok(())
}

pub async fn run_claim_knowledge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    match build_tasks::claim_knowledge_build(&pool).await? {
        Some(task) => {
            println!("Claimed build task {} for knowledge extraction.", task.id);
            print_task(&task);
        }
        None => println!("No pending build tasks."),
    }
    pool.close().await;
    Ok(())
}

pub async fn run_complete_knowledge(config: &Config, id: i64, source_id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    if !build_tasks::complete_knowledge_build(&pool, id, source_id).await? {
        bail!(
            "Build task {} is not in knowledge_build/running; nothing completed",
            id
        );
    }
    println!(
        "Build task {} knowledge stage completed (source {}).",
        id, source_id
    );
    pool.close().await;
    Ok(())
}

pub async fn run_fail(config: &Config, id: i64, message: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    if !build_tasks::fail_build_task(&pool, id, message).await? {
        bail!("Build task {} is not pending or running", id);
    }
    println!("Build task {} marked as error.", id);
    pool.close().await;
    Ok(())
}

fn print_task(task: &BuildTask) {
    println!("  id:         {}", task.id);
    println!("  url:        {}", task.source_url);
    if let Some(name) = &task.source_name {
        println!("  name:       {}", name);
    }
    println!("  category:   {}", task.source_category);
    println!("  stage:      {} / {}", task.stage, task.stage_status);
    if let Some(source_id) = task.source_id {
        println!("  source:     {}", source_id);
    }
    println!("  updated:    {}", format_ts_relative(task.updated_at));
}
