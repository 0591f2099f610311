//! Error types for chatpulse-core

use thiserror::Error;

/// Main error type for the chatpulse-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error (the backing store could not be read or written)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store unavailable for a reason other than a SQLite failure
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound event is missing required fields or carries invalid values
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A bucket write would break (or worsen) a bucket invariant
    #[error("inconsistent bucket {subject_area}/{day}: {message}")]
    InconsistentBucket {
        subject_area: String,
        day: String,
        message: String,
    },

    /// Query request could not be served as asked
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true when the error came from the backing store rather than
    /// from the data being processed.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::StoreUnavailable(_) | Error::Io(_)
        )
    }
}

/// Result type alias for chatpulse-core
pub type Result<T> = std::result::Result<T, Error>;
