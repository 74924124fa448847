//! # actionbook-builder CLI (`abx`)
//!
//! ## Usage
//!
//! ```bash
//! abx --config ./config/abx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `abx init` | Create the SQLite database and run schema migrations |
//! | `abx task submit <url>` | Submit a new build task |
//! | `abx task list` | List build tasks |
//! | `abx task show <id>` | Show a build task and its recording progress |
//! | `abx task claim-knowledge` | Claim the oldest pending task for knowledge extraction |
//! | `abx task complete-knowledge <id> --source-id <n>` | Finish the knowledge stage |
//! | `abx task fail <id> --message <text>` | Mark a task's current stage as errored |
//! | `abx generate <build_task_id>` | Generate recording tasks for a build task |
//! | `abx coordinator` | Run the build coordinator and recording worker |
//! | `abx worker` | Run only the recording worker |
//! | `abx version …` | Create, list, inspect, publish, delete, and fill versions |
//! | `abx stats` | Recording task statistics |
//! | `abx search "<query>"` | Keyword search over recording tasks |
//! | `abx serve` | Start the JSON HTTP API |

use actionbook_builder::models::SourceCategory;
use actionbook_builder::{
    config, daemon_cmd, migrate, search, server, stats, task_cmd, version_cmd,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// actionbook-builder: build task coordination, recording task queue, and
/// source version publishing over a shared SQLite database.
#[derive(Parser)]
#[command(name = "abx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/abx.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Submit, inspect, and hand-drive build tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Generate recording tasks for a build task's source.
    Generate {
        build_task_id: i64,

        /// Maximum number of tasks to create.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Run the build coordinator (and its recording worker) until Ctrl-C.
    Coordinator {
        /// Seconds to wait for in-flight work after Ctrl-C.
        #[arg(long, default_value_t = 30)]
        shutdown_timeout_secs: u64,
    },

    /// Run only the recording worker until Ctrl-C.
    Worker {
        /// Seconds to wait for in-flight executions after Ctrl-C.
        #[arg(long, default_value_t = 30)]
        shutdown_timeout_secs: u64,
    },

    /// Manage source versions.
    Version {
        #[command(subcommand)]
        action: VersionAction,
    },

    /// Show recording task statistics.
    Stats {
        /// Restrict to one source.
        #[arg(long)]
        source_id: Option<i64>,
    },

    /// Search recording tasks by scenario, URL, or document title.
    Search {
        query: String,

        #[arg(long)]
        source_id: Option<i64>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Start the JSON HTTP API.
    Serve,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a URL for building.
    Submit {
        url: String,

        #[arg(long)]
        name: Option<String>,

        /// help, unknown, or any.
        #[arg(long, default_value = "any")]
        category: String,

        /// Task config as a JSON object, e.g. '{"recording_task_limit": 50}'.
        #[arg(long = "task-config")]
        task_config: Option<String>,
    },

    /// List build tasks, most recently updated first.
    List {
        /// Only tasks in this stage (init, knowledge_build, action_build).
        #[arg(long)]
        stage: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show one build task with its recording progress.
    Show { id: i64 },

    /// Claim the oldest pending task for knowledge extraction.
    ClaimKnowledge,

    /// Finish the knowledge stage of a claimed task.
    CompleteKnowledge {
        id: i64,

        #[arg(long)]
        source_id: i64,
    },

    /// Mark a task's current stage as errored.
    Fail {
        id: i64,

        #[arg(long)]
        message: String,
    },
}

#[derive(Subcommand)]
enum VersionAction {
    /// Open a new building version for a source.
    Create {
        source: String,

        #[arg(long)]
        message: Option<String>,

        #[arg(long)]
        author: Option<String>,
    },

    /// List a source's versions, newest first.
    List { source: String },

    /// Show one version.
    Get { id: String },

    /// Make a building version the active one.
    Publish { id: String },

    /// Delete a version that is not the source's active version.
    Delete { id: String },

    /// Add a document to a building version.
    AddDocument {
        id: String,

        #[arg(long)]
        url: String,

        #[arg(long)]
        title: Option<String>,

        /// Markdown file with the document body.
        #[arg(long)]
        content_file: Option<PathBuf>,
    },

    /// Replace document chunks from a JSON file.
    Upload { id: String, file: PathBuf },
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "actionbook_builder=info",
        1 => "actionbook_builder=debug",
        _ => "actionbook_builder=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Task { action } => match action {
            TaskAction::Submit {
                url,
                name,
                category,
                task_config,
            } => {
                let category: SourceCategory = category.parse()?;
                task_cmd::run_submit(&cfg, &url, name, category, task_config).await?;
            }
            TaskAction::List { stage, limit } => {
                task_cmd::run_list(&cfg, stage, limit).await?;
            }
            TaskAction::Show { id } => {
                task_cmd::run_show(&cfg, id).await?;
            }
            TaskAction::ClaimKnowledge => {
                task_cmd::run_claim_knowledge(&cfg).await?;
            }
            TaskAction::CompleteKnowledge { id, source_id } => {
                task_cmd::run_complete_knowledge(&cfg, id, source_id).await?;
            }
            TaskAction::Fail { id, message } => {
                task_cmd::run_fail(&cfg, id, &message).await?;
            }
        },
        Commands::Generate {
            build_task_id,
            limit,
        } => {
            daemon_cmd::run_generate(&cfg, build_task_id, limit).await?;
        }
        Commands::Coordinator {
            shutdown_timeout_secs,
        } => {
            daemon_cmd::run_coordinator(&cfg, Duration::from_secs(shutdown_timeout_secs)).await?;
        }
        Commands::Worker {
            shutdown_timeout_secs,
        } => {
            daemon_cmd::run_worker(&cfg, Duration::from_secs(shutdown_timeout_secs)).await?;
        }
        Commands::Version { action } => match action {
            VersionAction::Create {
                source,
                message,
                author,
            } => {
                version_cmd::run_create(&cfg, &source, message, author).await?;
            }
            VersionAction::List { source } => {
                version_cmd::run_list(&cfg, &source).await?;
            }
            VersionAction::Get { id } => {
                version_cmd::run_get(&cfg, &id).await?;
            }
            VersionAction::Publish { id } => {
                version_cmd::run_publish(&cfg, &id).await?;
            }
            VersionAction::Delete { id } => {
                version_cmd::run_delete(&cfg, &id).await?;
            }
            VersionAction::AddDocument {
                id,
                url,
                title,
                content_file,
            } => {
                version_cmd::run_add_document(&cfg, &id, &url, title, content_file.as_deref())
                    .await?;
            }
            VersionAction::Upload { id, file } => {
                version_cmd::run_upload(&cfg, &id, &file).await?;
            }
        },
        Commands::Stats { source_id } => {
            stats::run_stats(&cfg, source_id).await?;
        }
        Commands::Search {
            query,
            source_id,
            limit,
        } => {
            search::run_search(&cfg, &query, source_id, limit).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
