//! Error types for orca-core.

use thiserror::Error;

use crate::config::ConfigValidationError;

/// Result type alias using orca-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Hard failures surfaced to the caller of a session.
///
/// Provider failures and the global session timeout never appear here: they
/// are recorded on the session itself as [`crate::types::ProviderResult::Failure`].
#[derive(Error, Debug)]
pub enum Error {
    // Consent errors
    #[error("Consent denied for subject {subject_id}: missing {missing:?}")]
    ConsentDenied {
        subject_id: String,
        missing: Vec<String>,
    },

    // Store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Lifecycle errors
    #[error("Shutting down: new sessions are not accepted")]
    ShuttingDown,

    #[error("No session slot became available within {waited_ms}ms")]
    Saturated { waited_ms: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigValidationError),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a consent denial error
    pub fn consent_denied(subject_id: impl Into<String>, missing: Vec<String>) -> Self {
        Self::ConsentDenied {
            subject_id: subject_id.into(),
            missing,
        }
    }

    /// Check if this error is a consent denial
    pub fn is_consent_denied(&self) -> bool {
        matches!(self, Self::ConsentDenied { .. })
    }

    /// Check if this error came from the session store
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Whether retrying the same call later could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            Self::Saturated { .. } => true,
            _ => false,
        }
    }
}

/// Session store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing service could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing service rejected the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store handle was released by shutdown.
    #[error("store connection closed")]
    Closed,

    /// A session closed by shutdown whose final write did not land.
    #[error("session {session_id} was closed by shutdown but not persisted: {reason}")]
    NotPersisted { session_id: String, reason: String },

    /// Pattern keys are generated by the store and never supplied by callers.
    #[error("caller-supplied key '{0}' is not allowed in the pattern namespace")]
    CallerKeyInPatternNamespace(String),
}

impl StoreError {
    /// Connectivity failures are recoverable; everything else is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure,
            ) => Self::Unavailable(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Errors raised by an analysis provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not be reached or is temporarily overloaded.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the input.
    #[error("provider rejected input: {0}")]
    Rejected(String),

    /// The provider observed the cancellation signal and stopped.
    #[error("provider cancelled: {0}")]
    Cancelled(String),

    #[error("provider internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Cancelled(_))
    }
}
