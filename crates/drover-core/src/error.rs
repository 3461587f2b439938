//! Error types for the Drover migration core.
//!
//! One structured error enum covers the whole crate. Variants carry enough
//! context (location, path, record id) that a failure report can always name
//! the item that failed, and the taxonomy maps onto process exit categories.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Debug, Error)]
pub enum DroverError {
    // Storage backend errors
    #[error("Storage error at {location}:{path}: {message}")]
    Storage {
        location: String,
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Object not found: {location}:{path}")]
    ObjectNotFound { location: String, path: String },

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    // Metadata store errors
    #[error("Record not found: {record_id}")]
    RecordNotFound { record_id: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Local file system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Run lifecycle errors
    #[error("Migration lock for scope '{scope}' is held by {holder}")]
    LockHeld { scope: String, holder: String },

    #[error("Lock token is stale for scope '{scope}'")]
    LockLost { scope: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("No metadata snapshot recorded for run {run_id}")]
    SnapshotMissing { run_id: String },

    #[error("Migration cancelled")]
    Cancelled,

    // Error-recovery escalations
    #[error("Circuit break: error signature '{signature}' occurred {count} times (threshold {threshold})")]
    CircuitBreak {
        signature: String,
        count: u32,
        threshold: u32,
    },

    #[error("Error budget exceeded: {count} cumulative errors (budget {budget})")]
    ErrorBudgetExceeded { count: u32, budget: u32 },

    // Data integrity errors
    #[error("Integrity failure for {subject}: expected {expected}, got {actual}")]
    IntegrityFailure {
        subject: String,
        expected: String,
        actual: String,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, DroverError>;

impl From<std::io::Error> for DroverError {
    fn from(err: std::io::Error) -> Self {
        DroverError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DroverError {
    fn from(err: serde_json::Error) -> Self {
        DroverError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for DroverError {
    fn from(err: rusqlite::Error) -> Self {
        DroverError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl DroverError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DroverError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a storage error for a (location, path) pair.
    pub fn storage(
        location: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        DroverError::Storage {
            location: location.into(),
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only transient storage and IO failures qualify. Missing objects,
    /// integrity failures and lifecycle errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DroverError::Storage { .. } | DroverError::Io { .. })
    }

    /// Check if this error must abort the run rather than skip the item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DroverError::CircuitBreak { .. }
                | DroverError::ErrorBudgetExceeded { .. }
                | DroverError::Cancelled
                | DroverError::Config { .. }
                | DroverError::Database { .. }
                | DroverError::LockHeld { .. }
                | DroverError::LockLost { .. }
        )
    }

    /// Stable signature used for repeated-error accounting.
    ///
    /// Two failures share a signature when they are the same class of
    /// problem against the same target, independent of the per-attempt
    /// message text.
    pub fn signature(&self) -> String {
        match self {
            DroverError::Storage { location, path, .. } => {
                format!("storage:{}:{}", location, path)
            }
            DroverError::ObjectNotFound { location, path } => {
                format!("object-not-found:{}:{}", location, path)
            }
            DroverError::UnknownLocation(location) => format!("unknown-location:{}", location),
            DroverError::RecordNotFound { record_id } => format!("record-not-found:{}", record_id),
            DroverError::Database { .. } => "database".to_string(),
            DroverError::Io { path, .. } => match path {
                Some(p) => format!("io:{}", p.display()),
                None => "io".to_string(),
            },
            DroverError::Json { .. } => "json".to_string(),
            DroverError::IntegrityFailure { subject, .. } => format!("integrity:{}", subject),
            DroverError::LockHeld { scope, .. } => format!("lock-held:{}", scope),
            DroverError::LockLost { scope } => format!("lock-lost:{}", scope),
            DroverError::RunNotFound { run_id } => format!("run-not-found:{}", run_id),
            DroverError::SnapshotMissing { run_id } => format!("snapshot-missing:{}", run_id),
            DroverError::Cancelled => "cancelled".to_string(),
            DroverError::CircuitBreak { signature, .. } => format!("circuit-break:{}", signature),
            DroverError::ErrorBudgetExceeded { .. } => "error-budget".to_string(),
            DroverError::Config { .. } => "config".to_string(),
            DroverError::Other(_) => "other".to_string(),
        }
    }

    /// Map this error to a process exit code category.
    ///
    /// Exit codes:
    /// - 0: success (never produced here)
    /// - 2: configuration error, run never began
    /// - 3: lock contention
    /// - 4: fatal repeated error (circuit break or exhausted error budget)
    /// - 5: partial completion, run is resumable
    /// - 1: any other failure
    pub fn exit_code(&self) -> i32 {
        match self {
            DroverError::Config { .. } => 2,
            DroverError::LockHeld { .. } => 3,
            DroverError::CircuitBreak { .. } | DroverError::ErrorBudgetExceeded { .. } => 4,
            DroverError::Cancelled => 5,
            _ => 1,
        }
    }
}
