//! Error taxonomy shared by the registry, artifact store and orchestrators.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed dataset, point, identifier or selector. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown series, version or artifact.
    #[error("not found: {0}")]
    NotFound(String),

    /// An immutable artifact key was about to be overwritten.
    #[error("artifact already exists at {key}")]
    ArtifactConflict { key: String },

    /// A committed record is missing something it must carry.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// Transient failure against a backing store.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Only storage failures are worth retrying; everything else needs a fix
    /// from the caller or an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Stable short label used in logs and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::ArtifactConflict { .. } => "artifact_conflict",
            Self::InconsistentState(_) => "inconsistent_state",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(format!("sqlite: {e}"))
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(format!("connection pool: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            _ => Self::Storage(format!("io: {e}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("json: {e}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(format!("blocking task failed: {e}"))
    }
}
