//! # tapeledger - Archival Ledger for Tape Storage
//!
//! `tapeledger-rs` tracks scientific data files as they are copied from a
//! staging disk onto magnetic tape and verified:
//!
//! - **Ledger** of files, tapes, and every archive attempt, in SQLite
//! - **Best-fit allocation** of pending files onto tapes, with a safety margin
//! - **Copy-and-verify state machine** with bounded retries and escalation
//! - **Coordinator** running one worker per drive, safe across hosts that
//!   share one ledger
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tapeledger_rs::{MemoryTapeLibrary, NewTape, Result, TapeArchive, TapeDrive};
//!
//! # fn main() -> Result<()> {
//! let archive = TapeArchive::builder()
//!     .ledger_path("/var/lib/tapeledger/ledger.db")
//!     .build()?;
//!
//! archive.register_tape(NewTape::new("HERA_01", 12_000_000_000_000))?;
//! archive.stage_path("/staging/2459563/zen.2459563.25.uvh5")?;
//!
//! let library = MemoryTapeLibrary::new();
//! library.insert_tape("HERA_01", 12_000_000_000_000);
//! let drives: Vec<Box<dyn TapeDrive>> = vec![Box::new(library.drive("st0"))];
//! let summary = archive.run_until_idle(drives)?;
//! println!("{} file(s) archived", summary.verified);
//! # Ok(())
//! # }
//! ```

// Archival engine
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, checksum, config, coordinator, drive, error, ledger, model, recovery, state_machine,
};

// Re-export core types that users need
pub use crate::core::{
    allocator::{AllocationReport, Allocator, NoSpareTapes, SparePool, TapeSource},
    checksum::{ChecksumEngine, Digest, StreamingDigest},
    config::{ArchiveConfig, DriveConfig},
    coordinator::{Coordinator, CoordinatorHandle, RunSummary, WorkerEvent},
    drive::{
        file::FileTapeDrive,
        memory::{Fault, MemoryTapeDrive, MemoryTapeLibrary},
        DriveError, MountedTape, TapeDrive,
    },
    error::{ArchiveError, ErrorClass, Result},
    ledger::{FailureOutcome, Ledger, LedgerStats, TapeFilter},
    model::{
        ArchiveAttempt, AttemptStatus, FailureReason, FileRecord, FileStatus, NewFile, NewTape,
        TapeRecord, TapeStatus, TapeUpdate,
    },
    recovery::{Recovery, RecoveryReport},
    state_machine::{ArchiveStateMachine, AttemptOutcome, CancellationToken, RetryPolicy},
};

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use validator::Validate;

/// High-level archive API
///
/// Bundles the ledger, configuration, and checksum engine:
/// - staging files from disk with their digests
/// - registering tapes
/// - allocation and recovery passes
/// - running a coordinator over a set of drives
///
/// # Examples
///
/// ```rust,no_run
/// use tapeledger_rs::{ArchiveConfig, TapeArchive};
///
/// # fn main() -> tapeledger_rs::Result<()> {
/// let config = ArchiveConfig::load("/etc/tapeledger.toml")?;
/// let archive = TapeArchive::open(config)?;
/// let report = archive.allocate()?;
/// println!("{} attempt(s) created", report.assigned.len());
/// # Ok(())
/// # }
/// ```
pub struct TapeArchive {
    ledger: Ledger,
    config: ArchiveConfig,
    engine: ChecksumEngine,
}

impl TapeArchive {
    /// Open the ledger named by a validated configuration
    pub fn open(config: ArchiveConfig) -> Result<Self> {
        config.validate()?;
        info!("Opening archive ledger at {:?}", config.ledger.path);
        let ledger = Ledger::open(&config)?;
        Ok(TapeArchive {
            ledger,
            config,
            engine: ChecksumEngine::new(),
        })
    }

    /// Load configuration from a TOML file and open the ledger
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(ArchiveConfig::load(path)?)
    }

    pub fn builder() -> TapeArchiveBuilder {
        TapeArchiveBuilder::new()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn register_tape(&self, tape: NewTape) -> Result<TapeRecord> {
        self.ledger.register_tape(tape)
    }

    pub fn stage(&self, file: NewFile) -> Result<FileRecord> {
        self.ledger.stage_file(file)
    }

    /// Stage a file from disk, hashing it first
    pub fn stage_path<P: AsRef<Path>>(&self, path: P) -> Result<FileRecord> {
        let file = self.describe(path.as_ref())?;
        self.ledger.stage_file(file)
    }

    /// Stage a file from disk with its observation metadata
    pub fn stage_observation<P: AsRef<Path>>(
        &self,
        path: P,
        obsid: i64,
        jd_start: f64,
    ) -> Result<FileRecord> {
        let file = self.describe(path.as_ref())?.observation(obsid, jd_start);
        self.ledger.stage_file(file)
    }

    fn describe(&self, path: &Path) -> Result<NewFile> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(ArchiveError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let digest = self.engine.digest_file(path)?;
        debug!("Hashed {} ({} bytes): {}", path.display(), meta.len(), digest);
        Ok(NewFile::new(path.to_string_lossy(), meta.len()).with_digest(digest))
    }

    /// Run one allocation pass, registering configured spares as needed
    pub fn allocate(&self) -> Result<AllocationReport> {
        Allocator::with_spares(self.config.spare_tapes.clone()).run_pruned(&self.ledger)
    }

    /// Resolve attempts that exceeded the attempt budget
    pub fn recover(&self) -> Result<RecoveryReport> {
        Recovery::new(&self.ledger, self.config.retry.into()).recover_abandoned(
            chrono::Utc::now(),
            self.config.coordinator.attempt_timeout(),
        )
    }

    /// Resolve in-flight attempts of this host's configured drives
    ///
    /// Only safe while no coordinator for this host is running.
    pub fn recover_host(&self) -> Result<RecoveryReport> {
        let workers: Vec<String> = self
            .config
            .drives
            .iter()
            .map(|d| self.config.coordinator.worker_id(&d.id))
            .collect();
        Recovery::new(&self.ledger, self.config.retry.into()).recover_orphaned(&workers)
    }

    pub fn coordinator(&self, drives: Vec<Box<dyn TapeDrive>>) -> Result<Coordinator> {
        Coordinator::new(&self.ledger, self.config.clone(), drives)
    }

    /// Archive until nothing is left to claim or allocate
    pub fn run_until_idle(&self, drives: Vec<Box<dyn TapeDrive>>) -> Result<RunSummary> {
        self.coordinator(drives)?.run_until_idle()
    }

    /// Open file-backed drives for every `[[drives]]` entry
    pub fn file_drives(&self) -> Result<Vec<Box<dyn TapeDrive>>> {
        self.config
            .require_drives()?
            .iter()
            .map(|d| {
                let drive = FileTapeDrive::new(&d.id, &d.library)?;
                Ok(Box::new(drive) as Box<dyn TapeDrive>)
            })
            .collect()
    }

    pub fn file(&self, name: &str) -> Result<Option<FileRecord>> {
        self.ledger.file_by_name(name)
    }

    pub fn files(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        self.ledger.files_by_status(status)
    }

    pub fn tapes(&self) -> Result<Vec<TapeRecord>> {
        self.ledger.tapes()
    }

    pub fn history(&self, name: &str) -> Result<Vec<ArchiveAttempt>> {
        match self.ledger.file_by_name(name)? {
            Some(file) => self.ledger.attempts_for_file(file.id),
            None => Err(ArchiveError::NotFound(format!("file {}", name))),
        }
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        self.ledger.stats()
    }
}

/// Builder for TapeArchive with custom configuration
///
/// # Examples
///
/// ```rust,no_run
/// use tapeledger_rs::{NewTape, TapeArchiveBuilder};
///
/// # fn main() -> tapeledger_rs::Result<()> {
/// let archive = TapeArchiveBuilder::new()
///     .ledger_path("ledger.db")
///     .capacity_margin(0.02)
///     .retries(5, 1)
///     .spare_tape(NewTape::new("HERA_09", 18_000_000_000_000))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct TapeArchiveBuilder {
    config: Option<ArchiveConfig>,
    ledger_path: Option<PathBuf>,
    margin: Option<f64>,
    retries: Option<(u32, u32)>,
    min_tape_capacity: Option<u64>,
    host_id: Option<String>,
    poll_interval: Option<Duration>,
    block_size: Option<usize>,
    spares: Vec<NewTape>,
}

impl TapeArchiveBuilder {
    pub fn new() -> Self {
        TapeArchiveBuilder {
            config: None,
            ledger_path: None,
            margin: None,
            retries: None,
            min_tape_capacity: None,
            host_id: None,
            poll_interval: None,
            block_size: None,
            spares: Vec::new(),
        }
    }

    /// Start from a full configuration; other setters override it
    pub fn config(mut self, config: ArchiveConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn ledger_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// Fraction of each tape withheld from allocation
    pub fn capacity_margin(mut self, ratio: f64) -> Self {
        self.margin = Some(ratio);
        self
    }

    pub fn retries(mut self, max_retries: u32, max_integrity_retries: u32) -> Self {
        self.retries = Some((max_retries, max_integrity_retries));
        self
    }

    pub fn min_tape_capacity(mut self, bytes: u64) -> Self {
        self.min_tape_capacity = Some(bytes);
        self
    }

    pub fn host_id<S: Into<String>>(mut self, host_id: S) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = Some(bytes);
        self
    }

    /// Blank cartridge the allocator may register when nothing else fits
    pub fn spare_tape(mut self, tape: NewTape) -> Self {
        self.spares.push(tape);
        self
    }

    /// Build the TapeArchive instance
    pub fn build(self) -> Result<TapeArchive> {
        let mut config = match (self.config, self.ledger_path) {
            (Some(mut config), Some(path)) => {
                config.ledger.path = path;
                config
            }
            (Some(config), None) => config,
            (None, Some(path)) => ArchiveConfig::new(path),
            (None, None) => {
                return Err(ArchiveError::FatalConfig(
                    "ledger path must be set".to_string(),
                ))
            }
        };
        if let Some(ratio) = self.margin {
            config.allocation.capacity_margin_ratio = ratio;
        }
        if let Some((max_retries, max_integrity_retries)) = self.retries {
            config.retry.max_retries = max_retries;
            config.retry.max_integrity_retries = max_integrity_retries;
        }
        if let Some(bytes) = self.min_tape_capacity {
            config.ledger.min_tape_capacity = bytes;
        }
        if let Some(host_id) = self.host_id {
            config.coordinator.host_id = host_id;
        }
        if let Some(interval) = self.poll_interval {
            config.coordinator.poll_interval_ms = interval.as_millis().max(1) as u64;
        }
        if let Some(bytes) = self.block_size {
            config.coordinator.block_size = bytes;
        }
        config.spare_tapes.extend(self.spares);

        info!("Building archive with ledger {:?}", config.ledger.path);
        TapeArchive::open(config)
    }
}

impl Default for TapeArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}
