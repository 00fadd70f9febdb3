//! Error types for the aggregation engine.

use thiserror::Error;

/// Aggregation engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The leg detail resolver failed or answered with an error payload
    #[error("leg resolver failed for {scope}: {message}")]
    Resolver {
        /// Scope being aggregated (e.g. "city:Lisbon")
        scope: String,
        /// Resolver message
        message: String,
    },

    /// Trip repository or directory query failed
    #[error("repository error: {0}")]
    Repository(String),

    /// Statistics store read or write failed
    #[error("statistics store error: {0}")]
    Store(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database locked error (retryable)
    #[error("database is locked (retry {retry_count}/{max_retries}): {message}")]
    DatabaseLocked {
        /// Retry attempt number
        retry_count: u32,
        /// Maximum retries allowed
        max_retries: u32,
        /// Human-readable message
        message: String,
    },

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(String),

    /// Caller passed inconsistent input
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Create a resolver error for one scope.
    pub fn resolver(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolver {
            scope: scope.into(),
            message: message.into(),
        }
    }

    /// Attribute a failed resolver call to `scope`.
    ///
    /// Errors already tagged as resolver errors are returned unchanged.
    pub fn into_resolver(self, scope: &str) -> Self {
        match self {
            resolver @ Self::Resolver { .. } => resolver,
            other => Self::resolver(scope, other.to_string()),
        }
    }

    /// Resolver failures only abort the scope they happened in.
    pub fn is_resolver_error(&self) -> bool {
        matches!(self, Self::Resolver { .. })
    }

    /// Check if this error is retryable (e.g., database locked).
    pub fn is_retryable(&self) -> bool {
        is_database_locked_error(self)
    }
}

/// Check if an EngineError indicates a database lock.
pub fn is_database_locked_error(error: &EngineError) -> bool {
    match error {
        EngineError::DatabaseLocked { .. } => true,
        EngineError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
            e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
        }
        _ => false,
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
