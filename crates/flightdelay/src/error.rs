//! Error types for flightdelay.
//!
//! Two layers live here. [`PredictionError`] is the typed failure reason a
//! caller of the engine sees; it is `Clone` so that every waiter attached to a
//! deduplicated computation can receive the same outcome. [`Error`] covers the
//! infrastructure around the engine (storage, configuration, I/O).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reasons surfaced by the prediction path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictionError {
    /// A raw flight record was missing a required field or carried a
    /// malformed value.
    #[error("invalid flight record field '{field}': {reason}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The flight is not known to the engine, so no features can be assembled.
    #[error("no features available for flight {key}")]
    FeatureUnavailable {
        /// Display form of the flight key.
        key: String,
    },

    /// The scoring model produced output that could not be used.
    #[error("scoring failed: {message}")]
    Scoring {
        /// Description of the malformed output.
        message: String,
    },

    /// A computation exceeded its time budget.
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// The task computing a prediction went away without reporting a result.
    #[error("computation for flight {key} was aborted")]
    ComputeAborted {
        /// Display form of the flight key.
        key: String,
    },
}

impl PredictionError {
    /// Create a validation error for a missing field.
    #[must_use]
    pub fn missing(field: &'static str) -> Self {
        Self::Validation {
            field,
            reason: "missing".to_string(),
        }
    }

    /// Create a validation error for a malformed field.
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Create a scoring error.
    #[must_use]
    pub fn scoring(message: impl Into<String>) -> Self {
        Self::Scoring {
            message: message.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ComputeAborted { .. })
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// The main error type for flightdelay operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Prediction Errors ===
    /// The prediction path failed.
    #[error(transparent)]
    Prediction(#[from] PredictionError),

    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt stored record in {table}: {message}")]
    CorruptRecord {
        /// Table the row came from.
        table: &'static str,
        /// Description of what could not be decoded.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for flightdelay operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a corrupt record error.
    #[must_use]
    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            table,
            message: message.into(),
        }
    }

    /// Get the prediction failure reason, if this is one.
    #[must_use]
    pub fn as_prediction(&self) -> Option<&PredictionError> {
        match self {
            Self::Prediction(err) => Some(err),
            _ => None,
        }
    }
}
