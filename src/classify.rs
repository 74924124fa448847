//! Chunk classification for recording tasks.
//!
//! A chunk that reads like instructions (a numbered list, or one of a
//! handful of procedural keywords) becomes a `task_driven` recording; anything
//! else is recorded as `exploratory`.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::ChunkType;

static NUMBERED_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+\. ").expect("valid regex"));

static TASK_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:steps|task|scenario|workflow|execute|perform)\b").expect("valid regex")
});

pub fn classify_chunk(content: &str) -> ChunkType {
    if NUMBERED_STEP_RE.is_match(content) || TASK_KEYWORD_RE.is_match(content) {
        ChunkType::TaskDriven
    } else {
        ChunkType::Exploratory
    }
}
