//! Ledger entity types
//!
//! The ledger owns three entity types:
//! - [`FileRecord`] - one file discovered in the staging area
//! - [`TapeRecord`] - one registered tape cartridge
//! - [`ArchiveAttempt`] - one try at copying and verifying a file onto a tape
//!
//! Status enums are persisted as lowercase snake_case text and parse back
//! through [`std::str::FromStr`].

use crate::checksum::Digest;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unknown status or reason string read back from the ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseStatusError {
    fn new(kind: &'static str, value: &str) -> Self {
        ParseStatusError {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle status of a file record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Discovered in staging, waiting for the allocator
    Pending,
    /// Has exactly one non-terminal archive attempt
    Allocated,
    /// A verified copy exists on tape
    Archived,
    /// Retries exhausted, needs operator intervention
    PermanentlyFailed,
}

impl FileStatus {
    pub const ALL: [FileStatus; 4] = [
        FileStatus::Pending,
        FileStatus::Allocated,
        FileStatus::Archived,
        FileStatus::PermanentlyFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Allocated => "allocated",
            FileStatus::Archived => "archived",
            FileStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl FromStr for FileStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "allocated" => Ok(FileStatus::Allocated),
            "archived" => Ok(FileStatus::Archived),
            "permanently_failed" => Ok(FileStatus::PermanentlyFailed),
            other => Err(ParseStatusError::new("file status", other)),
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a tape cartridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeStatus {
    /// Accepts new allocations
    Available,
    /// Only the safety margin remains; existing reservations may still be written
    Full,
    /// Withdrawn by an operator
    Retired,
    /// Drive reported a media fault
    Faulted,
}

impl TapeStatus {
    pub const ALL: [TapeStatus; 4] = [
        TapeStatus::Available,
        TapeStatus::Full,
        TapeStatus::Retired,
        TapeStatus::Faulted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TapeStatus::Available => "available",
            TapeStatus::Full => "full",
            TapeStatus::Retired => "retired",
            TapeStatus::Faulted => "faulted",
        }
    }

    /// Whether already-reserved work may still be written to this tape
    pub fn is_writable(&self) -> bool {
        matches!(self, TapeStatus::Available | TapeStatus::Full)
    }
}

impl FromStr for TapeStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(TapeStatus::Available),
            "full" => Ok(TapeStatus::Full),
            "retired" => Ok(TapeStatus::Retired),
            "faulted" => Ok(TapeStatus::Faulted),
            other => Err(ParseStatusError::new("tape status", other)),
        }
    }
}

impl fmt::Display for TapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single archive attempt
///
/// ```text
/// pending → copying → copied → verifying → verified
///    │         │         │          │
///    └─────────┴──→ failed ←────────┘
/// ```
///
/// `pending → failed` only happens when the assigned tape is withdrawn
/// before a worker claims the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Copying,
    Copied,
    Verifying,
    Verified,
    Failed,
}

impl AttemptStatus {
    pub const ALL: [AttemptStatus; 6] = [
        AttemptStatus::Pending,
        AttemptStatus::Copying,
        AttemptStatus::Copied,
        AttemptStatus::Verifying,
        AttemptStatus::Verified,
        AttemptStatus::Failed,
    ];

    /// Statuses that count as "in flight" for the one-open-attempt rule
    pub const OPEN: [AttemptStatus; 4] = [
        AttemptStatus::Pending,
        AttemptStatus::Copying,
        AttemptStatus::Copied,
        AttemptStatus::Verifying,
    ];

    /// Statuses a claimed attempt can be in while a worker holds it
    pub const ACTIVE: [AttemptStatus; 3] = [
        AttemptStatus::Copying,
        AttemptStatus::Copied,
        AttemptStatus::Verifying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Copying => "copying",
            AttemptStatus::Copied => "copied",
            AttemptStatus::Verifying => "verifying",
            AttemptStatus::Verified => "verified",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Verified | AttemptStatus::Failed)
    }

    /// The transition table of the archive state machine
    pub fn can_transition_to(&self, next: AttemptStatus) -> bool {
        use AttemptStatus::*;
        matches!(
            (self, next),
            (Pending, Copying)
                | (Pending, Failed)
                | (Copying, Copied)
                | (Copied, Verifying)
                | (Verifying, Verified)
                | (Copying, Failed)
                | (Copied, Failed)
                | (Verifying, Failed)
        )
    }
}

impl FromStr for AttemptStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "copying" => Ok(AttemptStatus::Copying),
            "copied" => Ok(AttemptStatus::Copied),
            "verifying" => Ok(AttemptStatus::Verifying),
            "verified" => Ok(AttemptStatus::Verified),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(ParseStatusError::new("attempt status", other)),
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an archive attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DriveBusy,
    DriveTimeout,
    MountError,
    IoError,
    DriveFault,
    SourceUnreadable,
    DigestMismatch,
    Cancelled,
    Stale,
    Abandoned,
    TapeUnavailable,
    LedgerUnavailable,
}

/// How the retry policy treats a failure reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Counted against `max_retries`
    Transient,
    /// Counted against `max_integrity_retries` and `max_retries`
    DataIntegrity,
    /// Not the file's fault; never counted
    Interruption,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DriveBusy => "drive_busy",
            FailureReason::DriveTimeout => "drive_timeout",
            FailureReason::MountError => "mount_error",
            FailureReason::IoError => "io_error",
            FailureReason::DriveFault => "drive_fault",
            FailureReason::SourceUnreadable => "source_unreadable",
            FailureReason::DigestMismatch => "digest_mismatch",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Stale => "stale",
            FailureReason::Abandoned => "abandoned",
            FailureReason::TapeUnavailable => "tape_unavailable",
            FailureReason::LedgerUnavailable => "ledger_unavailable",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::DigestMismatch => FailureKind::DataIntegrity,
            FailureReason::Cancelled
            | FailureReason::TapeUnavailable
            | FailureReason::LedgerUnavailable => FailureKind::Interruption,
            // Includes stale and abandoned: the file may be what stalls its worker
            _ => FailureKind::Transient,
        }
    }
}

impl FromStr for FailureReason {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drive_busy" => Ok(FailureReason::DriveBusy),
            "drive_timeout" => Ok(FailureReason::DriveTimeout),
            "mount_error" => Ok(FailureReason::MountError),
            "io_error" => Ok(FailureReason::IoError),
            "drive_fault" => Ok(FailureReason::DriveFault),
            "source_unreadable" => Ok(FailureReason::SourceUnreadable),
            "digest_mismatch" => Ok(FailureReason::DigestMismatch),
            "cancelled" => Ok(FailureReason::Cancelled),
            "stale" => Ok(FailureReason::Stale),
            "abandoned" => Ok(FailureReason::Abandoned),
            "tape_unavailable" => Ok(FailureReason::TapeUnavailable),
            "ledger_unavailable" => Ok(FailureReason::LedgerUnavailable),
            other => Err(ParseStatusError::new("failure reason", other)),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file discovered in the staging area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    /// Full path on the staging disk
    pub path: String,
    /// Logical name, unique across the ledger
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Content digest, immutable once set
    pub digest: Option<Digest>,
    pub status: FileStatus,
    /// Observation id
    pub obsid: Option<i64>,
    /// Observation start as a Julian Date
    pub jd_start: Option<f64>,
    /// Integer Julian Date, groups files by observing day
    pub jd: Option<i64>,
    /// Barcode of the tape holding the verified copy
    pub tape: Option<String>,
    pub failure_count: u32,
    pub integrity_failures: u32,
    pub last_failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// A registered tape cartridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeRecord {
    /// Registration sequence; lower ids are older media
    pub id: i64,
    pub barcode: String,
    pub tape_type: Option<String>,
    /// Declared capacity in bytes
    pub capacity: u64,
    /// Bytes physically consumed on the media
    pub bytes_used: u64,
    pub mount_count: u64,
    pub status: TapeStatus,
    pub purchase_date: Option<NaiveDate>,
    /// Worker currently holding the tape mounted
    pub mounted_by: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl TapeRecord {
    /// Capacity not yet physically consumed
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.bytes_used)
    }
}

/// One try at copying and verifying a file onto a tape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveAttempt {
    pub id: i64,
    pub file_id: i64,
    pub tape_id: i64,
    /// Barcode of `tape_id`, joined in for convenience
    pub tape: String,
    /// 1-based, strictly increasing per file
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub claimed_by: Option<String>,
    /// Byte offset on tape where this attempt's data begins
    pub offset: Option<u64>,
    /// Number of bytes written
    pub length: Option<u64>,
    /// Digest read back from tape on verification
    pub digest: Option<Digest>,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a tape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTape {
    pub barcode: String,
    pub capacity: u64,
    #[serde(default)]
    pub tape_type: Option<String>,
    #[serde(default)]
    pub purchase_date: Option<NaiveDate>,
}

impl NewTape {
    pub fn new(barcode: impl Into<String>, capacity: u64) -> Self {
        NewTape {
            barcode: barcode.into(),
            capacity,
            tape_type: None,
            purchase_date: None,
        }
    }

    pub fn with_type(mut self, tape_type: impl Into<String>) -> Self {
        self.tape_type = Some(tape_type.into());
        self
    }

    pub fn purchased(mut self, date: NaiveDate) -> Self {
        self.purchase_date = Some(date);
        self
    }
}

/// Fields an operator may change on a registered tape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TapeUpdate {
    pub tape_type: Option<String>,
    pub capacity: Option<u64>,
    pub purchase_date: Option<NaiveDate>,
}

/// Input for staging a file
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub digest: Option<Digest>,
    pub obsid: Option<i64>,
    pub jd_start: Option<f64>,
}

impl NewFile {
    /// Stage a file under its base name
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let name = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        NewFile {
            path,
            name,
            size,
            digest: None,
            obsid: None,
            jd_start: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn observation(mut self, obsid: i64, jd_start: f64) -> Self {
        self.obsid = Some(obsid);
        self.jd_start = Some(jd_start);
        self
    }

    /// Integer day derived from `jd_start`
    pub fn jd(&self) -> Option<i64> {
        self.jd_start.map(|jd| jd.floor() as i64)
    }
}
