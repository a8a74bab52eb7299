use crate::checksum::Digest;
use crate::drive::DriveError;
use crate::model::{AttemptStatus, FailureReason, ParseStatusError};
use thiserror::Error;

/// How the rest of the system should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Drive busy, timeouts, I/O hiccups: retried automatically, bounded
    Transient,
    /// Digest mismatch: retried at most once, then escalated
    DataIntegrity,
    /// No tape space: deferred to the next allocation pass
    Capacity,
    /// Misconfiguration or an unreachable ledger: halts the coordinator
    Fatal,
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Transient failure ({reason}): {detail}")]
    Transient {
        reason: FailureReason,
        detail: String,
    },

    #[error("Data integrity failure: expected digest {expected}, got {actual}")]
    DataIntegrity { expected: Digest, actual: Digest },

    #[error("No tape capacity for file {file} ({size} bytes)")]
    NoCapacity { file: String, size: u64 },

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Ledger database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Drive error: {0}")]
    Drive(#[from] DriveError),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(#[from] validator::ValidationErrors),

    #[error("Invalid transition for attempt {attempt}: {from} -> {to}")]
    InvalidTransition {
        attempt: i64,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("Attempt {attempt} is no longer held by this worker")]
    ClaimLost { attempt: i64 },

    #[error("Digest of file {file} is already set to a different value")]
    DigestImmutable { file: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt ledger value: {0}")]
    CorruptValue(#[from] ParseStatusError),
}

impl ArchiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ArchiveError::Transient { .. }
            | ArchiveError::Io(_)
            | ArchiveError::Drive(_)
            | ArchiveError::ClaimLost { .. } => ErrorClass::Transient,
            ArchiveError::DataIntegrity { .. } | ArchiveError::DigestImmutable { .. } => {
                ErrorClass::DataIntegrity
            }
            ArchiveError::NoCapacity { .. } => ErrorClass::Capacity,
            ArchiveError::Database(e) if is_busy(e) => ErrorClass::Transient,
            ArchiveError::FatalConfig(_)
            | ArchiveError::Database(_)
            | ArchiveError::ConfigParse(_)
            | ArchiveError::ConfigValidation(_)
            | ArchiveError::InvalidTransition { .. }
            | ArchiveError::NotFound(_)
            | ArchiveError::InvalidInput(_)
            | ArchiveError::CorruptValue(_) => ErrorClass::Fatal,
        }
    }

    /// Ledger failure code recorded when this error ends an attempt
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ArchiveError::Transient { reason, .. } => *reason,
            ArchiveError::Drive(e) => e.failure_reason(),
            ArchiveError::DataIntegrity { .. } | ArchiveError::DigestImmutable { .. } => {
                FailureReason::DigestMismatch
            }
            ArchiveError::Database(_) => FailureReason::LedgerUnavailable,
            _ => FailureReason::IoError,
        }
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
