/// Core error type for session storage and configuration.
///
/// Recovery operations wrap this in [`crate::recovery::RecoveryError`] so callers
/// can tell "nothing to recover from" apart from "storage failed".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid session id {id:?}: {reason}")]
    InvalidSessionId { id: String, reason: String },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
