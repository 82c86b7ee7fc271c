//! Crate-level error type.
//!
//! Every public operation returns [`CalcError`]. Component-specific errors
//! ([`StoreError`], [`EngineError`], [`WorkerError`]) convert into it via `?`.
//!
//! Errors recorded by workers travel through the fast store in serialized form
//! (see [`crate::status::SerializedError`]); [`CalcError::type_name`] and
//! [`CalcError::from_parts`] define the registry of recognised kinds.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::store::StoreError;
use crate::worker::WorkerError;

/// Serialized type name for synthesised timeouts.
pub const TIMEOUT_TYPE: &str = "concache::Timeout";
/// Serialized type name for generic corpus engine failures.
pub const ENGINE_TYPE: &str = "concache::EngineError";
/// Serialized type name for engine file access failures.
pub const ENGINE_FILE_ACCESS_TYPE: &str = "concache::EngineFileAccess";
/// Serialized type name for user-specific operations rejected in background mode.
pub const USER_SPECIFIC_TYPE: &str = "concache::UserSpecificInBackground";
/// Serialized type name used for everything without a dedicated kind.
pub const CALC_STATUS_TYPE: &str = "concache::CalcStatusError";

/// Errors surfaced by the concordance cache coordinator.
#[derive(Debug, Error)]
pub enum CalcError {
    /// No cache entry exists for the requested fingerprint.
    #[error("No cached concordance found for {0}")]
    NotFound(String),

    /// An entry exists but its artifact cannot be opened.
    #[error("Cached concordance {} cannot be opened: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    /// A worker recorded a failure of a kind this crate does not recognise.
    #[error("{message}")]
    CalcStatus { type_name: String, message: String },

    /// The owning worker did not update the record within the task time limit.
    #[error("{0}")]
    Timeout(String),

    /// Failure reported by the corpus engine.
    #[error("Corpus engine error: {0}")]
    Engine(#[from] EngineError),

    /// The status record vanished while a caller was waiting on it.
    #[error("Status record {0} disappeared while waiting for the calculation")]
    ConcurrencyViolation(String),

    /// Fast store failure.
    #[error("Fast store error: {0}")]
    Store(#[from] StoreError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker runtime failure.
    #[error("Worker runtime error: {0}")]
    Worker(#[from] WorkerError),

    /// The pipeline does not start with a root query.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// `g`/`e` operations depend on the requesting user and cannot be cached.
    #[error("Operation '{0}' is user-specific and cannot run in a background worker")]
    UserSpecificInBackground(char),

    /// A blocking engine call could not be joined.
    #[error("Failed to run blocking task: {0}")]
    Spawn(String),

    /// The per-request lock could not be acquired in time.
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),

    /// A status record could not be (de)serialized.
    #[error("Status record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CalcError {
    /// Returns the serialized type name of this error.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Timeout(_) => TIMEOUT_TYPE,
            Self::Engine(EngineError::FileAccess(_)) => ENGINE_FILE_ACCESS_TYPE,
            Self::Engine(_) => ENGINE_TYPE,
            Self::UserSpecificInBackground(_) => USER_SPECIFIC_TYPE,
            Self::CalcStatus { type_name, .. } => type_name,
            _ => CALC_STATUS_TYPE,
        }
    }

    /// Returns the message stored alongside the type name.
    pub fn message(&self) -> String {
        match self {
            Self::Timeout(msg) => msg.clone(),
            Self::Engine(EngineError::FileAccess(path)) => path.clone(),
            Self::Engine(EngineError::Failed(msg)) => msg.clone(),
            Self::UserSpecificInBackground(op) => op.to_string(),
            Self::CalcStatus { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Restores an error from its serialized `(type-name, message)` form.
    ///
    /// Unknown type names become [`CalcError::CalcStatus`] with the original
    /// name preserved.
    pub fn from_parts(type_name: &str, message: &str) -> Self {
        match type_name {
            TIMEOUT_TYPE => Self::Timeout(message.to_string()),
            ENGINE_TYPE => Self::Engine(EngineError::Failed(message.to_string())),
            ENGINE_FILE_ACCESS_TYPE => Self::Engine(EngineError::FileAccess(message.to_string())),
            USER_SPECIFIC_TYPE => match message.chars().next() {
                Some(op) => Self::UserSpecificInBackground(op),
                None => Self::CalcStatus {
                    type_name: type_name.to_string(),
                    message: message.to_string(),
                },
            },
            _ => Self::CalcStatus {
                type_name: type_name.to_string(),
                message: message.to_string(),
            },
        }
    }

    /// The single message shown to an end user for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(_) => "Concordance not found, the query must be restored".to_string(),
            Self::Engine(EngineError::FileAccess(_)) | Self::Unreadable { .. } => {
                "Cached concordance is unavailable, please repeat the query".to_string()
            }
            other => other.message(),
        }
    }

    /// Returns true for errors that indicate the artifact disappeared externally.
    pub fn is_file_access(&self) -> bool {
        matches!(
            self,
            Self::Engine(EngineError::FileAccess(_)) | Self::Unreadable { .. }
        )
    }
}

/// Convenience alias used across the crate.
pub type CalcResult<T> = Result<T, CalcError>;
