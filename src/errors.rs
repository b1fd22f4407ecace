use std::io;

use thiserror::Error;

use crate::session::SessionStatus;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("malformed tax identifier: {0}")]
    InvalidIdentifier(String),
    #[error("a session for database {0} is already running")]
    AlreadyRunning(String),
    #[error("session {0} not found")]
    SessionNotFound(i64),
    #[error("session {session} cannot move from {from} to {to}")]
    InvalidTransition {
        session: i64,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session {0} still has an active worker pool")]
    PoolActive(i64),
    #[error("record source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("{0}")]
    Record(String),
}

impl AppError {
    /// Systemic errors abort a pool and fail its session; everything else is
    /// tallied against the record that raised it.
    pub fn is_systemic(&self) -> bool {
        matches!(self, AppError::SourceUnavailable(_))
    }
}
