use thiserror::Error;

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::StorageUnavailable(format!("Migration error: {}", err))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::CryptoError(format!("JSON serialization error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Malformed event record: {0}")]
    MalformedEvent(String),

    #[error("Position {position} already taken in partition {partition}")]
    PositionConflict { partition: String, position: u64 },

    #[error("Concurrent write conflict on partition {partition} after {attempts} attempts")]
    ConcurrentWriteConflict { partition: String, attempts: u32 },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Signing key unavailable: {0}")]
    SigningKeyUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Coarse grouping used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Concurrency,
    Infrastructure,
    Lookup,
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidEvent(_) | Self::MalformedEvent(_) | Self::ConfigError(_) => {
                ErrorCategory::Validation
            }
            Self::PositionConflict { .. } | Self::ConcurrentWriteConflict { .. } => {
                ErrorCategory::Concurrency
            }
            Self::StorageUnavailable(_) | Self::SigningKeyUnavailable(_) | Self::CryptoError(_) => {
                ErrorCategory::Infrastructure
            }
            Self::NotFound(_) => ErrorCategory::Lookup,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PositionConflict { .. }
                | Self::ConcurrentWriteConflict { .. }
                | Self::StorageUnavailable(_)
        )
    }

    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEvent(msg.into())
    }

    pub fn position_conflict(partition: &str, position: u64) -> Self {
        Self::PositionConflict {
            partition: partition.to_string(),
            position,
        }
    }
}
