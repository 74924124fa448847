//! Row types and the string-backed enums stored in their status columns.
//!
//! Every status column is `TEXT` in SQLite; the enums here own the mapping
//! in both directions (`as_str` for binds, `FromStr` for reads).

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => bail!("invalid {}: '{}'", stringify!($name), other),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(BuildStage {
    Init => "init",
    KnowledgeBuild => "knowledge_build",
    ActionBuild => "action_build",
});

text_enum!(StageStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Error => "error",
});

text_enum!(SourceCategory {
    Help => "help",
    Unknown => "unknown",
    Any => "any",
});

text_enum!(VersionStatus {
    Building => "building",
    Active => "active",
    Archived => "archived",
});

text_enum!(RecordingStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(ChunkType {
    TaskDriven => "task_driven",
    Exploratory => "exploratory",
});

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub description: Option<String>,
    pub current_version_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SourceVersion {
    pub id: i64,
    pub source_id: i64,
    pub version_number: i64,
    pub status: String,
    pub commit_message: Option<String>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub published_at: Option<i64>,
}

impl SourceVersion {
    pub fn status(&self) -> anyhow::Result<VersionStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BuildTask {
    pub id: i64,
    pub source_id: Option<i64>,
    pub source_url: String,
    pub source_name: Option<String>,
    pub source_category: String,
    pub stage: String,
    pub stage_status: String,
    pub config: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub knowledge_started_at: Option<i64>,
    pub knowledge_completed_at: Option<i64>,
    pub action_started_at: Option<i64>,
    pub action_completed_at: Option<i64>,
}

impl BuildTask {
    pub fn stage(&self) -> anyhow::Result<BuildStage> {
        self.stage.parse()
    }

    pub fn stage_status(&self) -> anyhow::Result<StageStatus> {
        self.stage_status.parse()
    }

    /// The task's JSON config, or an empty object if the column is malformed.
    pub fn config_json(&self) -> Value {
        serde_json::from_str(&self.config).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Fields supplied when submitting a new build task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBuildTask {
    pub source_url: String,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default = "default_category")]
    pub source_category: SourceCategory,
    #[serde(default)]
    pub config: Option<Value>,
}

fn default_category() -> SourceCategory {
    SourceCategory::Any
}

/// Recording task configuration, keyed by its `chunk_type` discriminant.
///
/// The raw JSON payload is kept alongside the parsed variant so fields
/// written by newer producers survive a read-modify-write.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskConfig {
    TaskDriven { raw: Value },
    Exploratory { raw: Value },
    Other { chunk_type: Option<String>, raw: Value },
}

impl TaskConfig {
    pub fn for_chunk_type(chunk_type: ChunkType) -> Self {
        let raw = serde_json::json!({ "chunk_type": chunk_type.as_str() });
        match chunk_type {
            ChunkType::TaskDriven => TaskConfig::TaskDriven { raw },
            ChunkType::Exploratory => TaskConfig::Exploratory { raw },
        }
    }

    pub fn from_value(raw: Value) -> Self {
        let tag = raw
            .get("chunk_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        match tag.as_deref().map(ChunkType::from_str) {
            Some(Ok(ChunkType::TaskDriven)) => TaskConfig::TaskDriven { raw },
            Some(Ok(ChunkType::Exploratory)) => TaskConfig::Exploratory { raw },
            _ => TaskConfig::Other {
                chunk_type: tag,
                raw,
            },
        }
    }

    pub fn chunk_type(&self) -> Option<ChunkType> {
        match self {
            TaskConfig::TaskDriven { .. } => Some(ChunkType::TaskDriven),
            TaskConfig::Exploratory { .. } => Some(ChunkType::Exploratory),
            TaskConfig::Other { .. } => None,
        }
    }

    pub fn raw(&self) -> &Value {
        match self {
            TaskConfig::TaskDriven { raw }
            | TaskConfig::Exploratory { raw }
            | TaskConfig::Other { raw, .. } => raw,
        }
    }
}

impl From<String> for TaskConfig {
    fn from(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(raw) => TaskConfig::from_value(raw),
            Err(_) => TaskConfig::Other {
                chunk_type: None,
                raw: Value::String(text),
            },
        }
    }
}

impl Serialize for TaskConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw().serialize(serializer)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecordingTask {
    pub id: i64,
    pub source_id: i64,
    pub build_task_id: i64,
    pub chunk_id: i64,
    pub scenario: String,
    pub status: String,
    pub progress: i64,
    pub start_url: Option<String>,
    #[sqlx(try_from = "String")]
    pub config: TaskConfig,
    pub attempt_count: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl RecordingTask {
    pub fn status(&self) -> anyhow::Result<RecordingStatus> {
        self.status.parse()
    }
}

/// A chunk as supplied to `upload_chunks`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkUpload {
    pub document_id: i64,
    pub content: String,
    #[serde(default)]
    pub chunk_index: Option<i64>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub heading: Option<String>,
    #[serde(default)]
    pub token_count: Option<i64>,
}
