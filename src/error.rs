//! Typed errors for the version operations and the HTTP API.
//!
//! Each variant carries a stable machine code that API clients switch on.
//! Orchestration code keeps using `anyhow`; only the version manager and the
//! HTTP layer speak `VersionError`.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("a building version already exists for source '{0}'")]
    SyncInProgress(String),

    #[error("version {0} not found")]
    VersionNotFound(i64),

    #[error("version {id} is {status}; only building versions can be modified")]
    VersionLocked { id: i64, status: String },

    #[error("{0}")]
    InvalidDocumentIds(String),

    #[error("version {0} is the active version of its source and cannot be deleted")]
    CannotDeleteReferenced(i64),

    #[error("source '{0}' not found")]
    SourceNotFound(String),

    #[error("invalid version id: '{0}'")]
    InvalidVersionId(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VersionError {
    pub fn code(&self) -> &'static str {
        match self {
            VersionError::SyncInProgress(_) => "SYNC_IN_PROGRESS",
            VersionError::VersionNotFound(_) => "VERSION_NOT_FOUND",
            VersionError::VersionLocked { .. } => "VERSION_LOCKED",
            VersionError::InvalidDocumentIds(_) => "INVALID_DOCUMENT_IDS",
            VersionError::CannotDeleteReferenced(_) => "CANNOT_DELETE_REFERENCED",
            VersionError::SourceNotFound(_) => "SOURCE_NOT_FOUND",
            VersionError::InvalidVersionId(_) => "INVALID_VERSION_ID",
            VersionError::InvalidRequest(_) => "INVALID_REQUEST",
            VersionError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VersionError::InvalidDocumentIds(_)
            | VersionError::InvalidVersionId(_)
            | VersionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            VersionError::VersionNotFound(_) | VersionError::SourceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            VersionError::SyncInProgress(_)
            | VersionError::VersionLocked { .. }
            | VersionError::CannotDeleteReferenced(_) => StatusCode::CONFLICT,
            VersionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for VersionError {
    fn from(err: sqlx::Error) -> Self {
        VersionError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for VersionError {
    fn from(err: anyhow::Error) -> Self {
        VersionError::Internal(format!("{:#}", err))
    }
}

/// Parse a user-supplied version id.
pub fn parse_version_id(raw: &str) -> Result<i64, VersionError> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(VersionError::InvalidVersionId(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_http_classes() {
        let conflict = VersionError::SyncInProgress("docs".into());
        assert_eq!(conflict.code(), "SYNC_IN_PROGRESS");
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let missing = VersionError::VersionNotFound(9);
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let internal: VersionError = anyhow::anyhow!("disk full").into();
        assert_eq!(internal.code(), "INTERNAL_ERROR");
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn version_id_parsing() {
        assert_eq!(parse_version_id(" 12 ").unwrap(), 12);
        assert_eq!(parse_version_id("abc").unwrap_err().code(), "INVALID_VERSION_ID");
        assert_eq!(parse_version_id("0").unwrap_err().code(), "INVALID_VERSION_ID");
    }
}
