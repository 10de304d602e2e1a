use std::fmt;
use thiserror::Error;

/// Why an analytics fetch failed. Drives the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    Auth,
    Quota,
    Server,
    Transport,
    Decode,
}

impl FetchErrorKind {
    /// Auth and decode failures won't fix themselves on a retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FetchErrorKind::Timeout
                | FetchErrorKind::Quota
                | FetchErrorKind::Server
                | FetchErrorKind::Transport
        )
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Auth => "auth failure",
            FetchErrorKind::Quota => "quota exceeded",
            FetchErrorKind::Server => "server error",
            FetchErrorKind::Transport => "transport error",
            FetchErrorKind::Decode => "decode error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Analytics fetch failed ({kind}): {message}")]
    Fetch {
        kind: FetchErrorKind,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn fetch(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Error::Fetch {
            kind,
            message: message.into(),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            FetchErrorKind::Timeout
        } else if e.is_decode() {
            FetchErrorKind::Decode
        } else {
            FetchErrorKind::Transport
        };
        Error::fetch(kind, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Input(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
