//! Ledger store
//!
//! The single source of truth for files, tapes, and archive attempts.
//! Backed by SQLite with:
//! - WAL journaling and a busy timeout, so several processes can share one file
//! - IMMEDIATE transactions on every write path, so writers serialize on the
//!   database lock instead of racing on stale reads
//! - conditional updates ("move attempt X from S1 to S2 iff it is in S1") for
//!   every state transition, which is what makes claim-then-act safe across
//!   workers and hosts
//! - partial unique indexes guaranteeing at most one open attempt and at most
//!   one verified attempt per file
//!
//! A [`Ledger`] owns one connection. Workers that run concurrently each take
//! their own connection through [`Ledger::try_clone`].

mod rows;
pub(crate) mod schema;

use crate::checksum::Digest;
use crate::config::{AllocationConfig, ArchiveConfig, LedgerConfig};
use crate::error::{ArchiveError, Result};
use crate::model::{
    ArchiveAttempt, AttemptStatus, FailureKind, FailureReason, FileRecord, FileStatus, NewFile,
    NewTape, TapeRecord, TapeStatus, TapeUpdate,
};
use crate::state_machine::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rows::{
    attempt_from_row, file_from_row, tape_from_row, to_micros, ATTEMPT_COLUMNS, ATTEMPT_FROM,
    FILE_COLUMNS, FILE_FROM, TAPE_COLUMNS,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Which tapes a worker's drive may serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeFilter {
    /// Generic drive
    Any,
    /// Drive restricted to these barcodes
    Only(HashSet<String>),
}

impl TapeFilter {
    pub fn from_list(tapes: Option<&[String]>) -> Self {
        match tapes {
            Some(list) => TapeFilter::Only(list.iter().cloned().collect()),
            None => TapeFilter::Any,
        }
    }

    pub fn allows(&self, barcode: &str) -> bool {
        match self {
            TapeFilter::Any => true,
            TapeFilter::Only(set) => set.contains(barcode),
        }
    }
}

/// What happened to a file after one of its attempts failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// A fresh pending attempt was opened on the same tape
    Retried(ArchiveAttempt),
    /// The file went back to `pending` for the allocator
    Requeued,
    /// Retries exhausted
    PermanentlyFailed,
}

/// A tape together with the bytes promised to unstarted attempts
#[derive(Debug, Clone, PartialEq)]
pub struct TapeSpace {
    pub tape: TapeRecord,
    /// Sizes of `pending` and `copying` attempts on this tape
    pub reserved: u64,
}

impl TapeSpace {
    /// Bytes the allocator may still promise, after the safety margin
    pub fn allocatable(&self, margin: u64) -> u64 {
        self.tape
            .capacity
            .saturating_sub(self.tape.bytes_used)
            .saturating_sub(self.reserved)
            .saturating_sub(margin)
    }
}

/// Per-status counts across the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub files: HashMap<FileStatus, u64>,
    pub attempts: HashMap<AttemptStatus, u64>,
    pub tapes: HashMap<TapeStatus, u64>,
    pub archived_bytes: u64,
}

impl LedgerStats {
    pub fn files_with(&self, status: FileStatus) -> u64 {
        self.files.get(&status).copied().unwrap_or(0)
    }

    pub fn attempts_with(&self, status: AttemptStatus) -> u64 {
        self.attempts.get(&status).copied().unwrap_or(0)
    }
}

fn status_list(statuses: &[AttemptStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Durable, transactional archival ledger
pub struct Ledger {
    conn: Mutex<Connection>,
    config: LedgerConfig,
    allocation: AllocationConfig,
}

impl Ledger {
    /// Open (and if needed create) the ledger named in the config
    pub fn open(config: &ArchiveConfig) -> Result<Self> {
        Self::open_with(config.ledger.clone(), config.allocation.clone())
    }

    pub fn open_with(config: LedgerConfig, allocation: AllocationConfig) -> Result<Self> {
        let mut conn = Connection::open(&config.path).map_err(|e| {
            ArchiveError::FatalConfig(format!(
                "ledger at {} is unreachable: {}",
                config.path.display(),
                e
            ))
        })?;
        conn.busy_timeout(config.busy_timeout())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        schema::initialize(&mut conn)?;
        debug!("Opened ledger at {:?}", config.path);
        Ok(Ledger {
            conn: Mutex::new(conn),
            config,
            allocation,
        })
    }

    /// Independent connection to the same ledger
    pub fn try_clone(&self) -> Result<Self> {
        Self::open_with(self.config.clone(), self.allocation.clone())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn allocation_config(&self) -> &AllocationConfig {
        &self.allocation
    }

    /// Run read-only queries against a consistent snapshot
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run a write transaction holding the database write lock
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LedgerTx<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ledger_tx = LedgerTx {
            tx,
            now: Utc::now(),
            config: &self.config,
            allocation: &self.allocation,
        };
        let result = f(&ledger_tx)?;
        ledger_tx.tx.commit()?;
        Ok(result)
    }

    // ----- registration -----

    pub fn register_tape(&self, tape: NewTape) -> Result<TapeRecord> {
        self.write(|tx| tx.register_tape(&tape))
    }

    pub fn update_tape(&self, barcode: &str, update: TapeUpdate) -> Result<TapeRecord> {
        self.write(|tx| tx.update_tape(barcode, &update))
    }

    /// Withdraw a tape; its unstarted attempts go back to the allocator
    pub fn retire_tape(&self, barcode: &str) -> Result<TapeRecord> {
        self.write(|tx| tx.withdraw_tape(barcode, TapeStatus::Retired))
    }

    /// Record a media fault; its unstarted attempts go back to the allocator
    pub fn mark_tape_faulted(&self, barcode: &str) -> Result<TapeRecord> {
        self.write(|tx| tx.withdraw_tape(barcode, TapeStatus::Faulted))
    }

    pub fn stage_file(&self, file: NewFile) -> Result<FileRecord> {
        self.write(|tx| tx.stage_file(&file))
    }

    pub fn set_file_digest(&self, file_id: i64, digest: Digest) -> Result<()> {
        self.write(|tx| tx.set_file_digest(file_id, digest))
    }

    /// Operator action: give a permanently failed file a fresh retry budget
    pub fn requeue_file(&self, name: &str) -> Result<FileRecord> {
        self.write(|tx| tx.requeue_file(name))
    }

    // ----- claim and transitions -----

    /// Atomically move one specific attempt from `pending` to `copying`
    ///
    /// Returns `false` if another worker claimed it first.
    pub fn claim_attempt(&self, attempt_id: i64, worker: &str) -> Result<bool> {
        self.write(|tx| tx.claim_attempt(attempt_id, worker))
    }

    /// Claim the next pending attempt this worker may serve
    ///
    /// Attempts on `prefer_tape` come first so a mounted cartridge is drained
    /// before it is swapped. The tape lease is taken in the same transaction.
    pub fn claim_next(
        &self,
        worker: &str,
        filter: &TapeFilter,
        prefer_tape: Option<&str>,
    ) -> Result<Option<ArchiveAttempt>> {
        self.write(|tx| tx.claim_next(worker, filter, prefer_tape))
    }

    pub fn transition_attempt(
        &self,
        attempt_id: i64,
        from: AttemptStatus,
        to: AttemptStatus,
    ) -> Result<()> {
        self.write(|tx| tx.transition(attempt_id, from, to))
    }

    /// `copying → copied`, recording the written extent
    pub fn mark_copied(&self, attempt_id: i64, offset: u64, length: u64) -> Result<ArchiveAttempt> {
        self.write(|tx| tx.mark_copied(attempt_id, offset, length))
    }

    /// `verifying → verified` and file `archived`, in one transaction
    pub fn complete_verification(&self, attempt_id: i64, digest: Digest) -> Result<FileRecord> {
        self.write(|tx| tx.complete_verification(attempt_id, digest))
    }

    /// End an attempt as failed and apply the retry policy
    pub fn fail_attempt(
        &self,
        attempt_id: i64,
        from: AttemptStatus,
        reason: FailureReason,
        detail: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        self.write(|tx| tx.fail_attempt(attempt_id, from, reason, detail, policy))
    }

    // ----- tape leases -----

    pub fn record_mount(&self, barcode: &str, worker: &str) -> Result<()> {
        self.write(|tx| tx.record_mount(barcode, worker))
    }

    pub fn release_tape(&self, barcode: &str, worker: &str) -> Result<bool> {
        self.write(|tx| tx.release_tape(barcode, worker))
    }

    /// Fold the drive's reported append point into `bytes_used`
    pub fn sync_tape_position(&self, barcode: &str, position: u64) -> Result<TapeRecord> {
        self.write(|tx| tx.sync_tape_position(barcode, position))
    }

    // ----- queries -----

    pub fn file(&self, id: i64) -> Result<FileRecord> {
        self.read(|c| queries::file(c, id))
    }

    pub fn file_by_name(&self, name: &str) -> Result<Option<FileRecord>> {
        self.read(|c| queries::file_by_name(c, name))
    }

    pub fn files_by_status(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        self.read(|c| queries::files_by_status(c, status))
    }

    /// Archived files whose verified copy lives on `barcode`
    pub fn files_on_tape(&self, barcode: &str) -> Result<Vec<FileRecord>> {
        self.read(|c| queries::files_on_tape(c, barcode))
    }

    /// Distinct integer Julian Dates across all staged files
    pub fn distinct_jds(&self) -> Result<Vec<i64>> {
        self.read(queries::distinct_jds)
    }

    pub fn tape(&self, barcode: &str) -> Result<Option<TapeRecord>> {
        self.read(|c| queries::tape(c, barcode))
    }

    pub fn tapes(&self) -> Result<Vec<TapeRecord>> {
        self.read(queries::tapes)
    }

    /// Available tapes that still have unwritten capacity
    pub fn tapes_with_remaining_capacity(&self) -> Result<Vec<TapeRecord>> {
        self.read(queries::tapes_with_remaining_capacity)
    }

    pub fn attempt(&self, id: i64) -> Result<ArchiveAttempt> {
        self.read(|c| queries::attempt(c, id))
    }

    /// Every attempt for a file, ordered by attempt number
    pub fn attempts_for_file(&self, file_id: i64) -> Result<Vec<ArchiveAttempt>> {
        self.read(|c| queries::attempts_for_file(c, file_id))
    }

    pub fn pending_attempts_for_tape(&self, barcode: &str) -> Result<Vec<ArchiveAttempt>> {
        self.read(|c| queries::pending_attempts_for_tape(c, barcode))
    }

    /// Attempts not yet verified or failed
    pub fn open_attempts(&self) -> Result<Vec<ArchiveAttempt>> {
        self.read(|c| queries::attempts_with_status(c, &AttemptStatus::OPEN))
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        self.read(queries::stats)
    }
}

/// A write transaction on the ledger
///
/// Obtained through [`Ledger::write`]. All methods run inside the same
/// IMMEDIATE transaction and share one timestamp.
pub struct LedgerTx<'a> {
    tx: rusqlite::Transaction<'a>,
    now: DateTime<Utc>,
    config: &'a LedgerConfig,
    allocation: &'a AllocationConfig,
}

impl LedgerTx<'_> {
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Read access inside the transaction
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    fn micros(&self) -> i64 {
        to_micros(self.now)
    }

    /// Safety margin withheld on a tape of the given capacity
    pub fn margin_for(&self, capacity: u64) -> u64 {
        self.allocation.margin_for(capacity)
    }

    pub fn register_tape(&self, tape: &NewTape) -> Result<TapeRecord> {
        let barcode = tape.barcode.trim();
        if barcode.is_empty() {
            return Err(ArchiveError::InvalidInput("tape barcode cannot be empty".into()));
        }
        self.check_capacity(tape.capacity)?;
        let inserted = self.tx.execute(
            "INSERT INTO tapes (barcode, tape_type, capacity, status, purchase_date, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                barcode,
                tape.tape_type,
                tape.capacity as i64,
                TapeStatus::Available.as_str(),
                tape.purchase_date.map(|d| d.to_string()),
                self.micros(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ArchiveError::InvalidInput(format!(
                    "tape {} is already registered",
                    barcode
                )));
            }
            Err(e) => return Err(e.into()),
        }
        info!("Registered tape {} ({} bytes)", barcode, tape.capacity);
        self.require_tape(barcode)
    }

    fn check_capacity(&self, capacity: u64) -> Result<()> {
        if capacity < self.config.min_tape_capacity {
            return Err(ArchiveError::InvalidInput(format!(
                "tape capacity {} is below the minimum of {} bytes",
                capacity, self.config.min_tape_capacity
            )));
        }
        if capacity > i64::MAX as u64 {
            return Err(ArchiveError::InvalidInput(format!(
                "tape capacity {} is out of range",
                capacity
            )));
        }
        Ok(())
    }

    pub fn update_tape(&self, barcode: &str, update: &TapeUpdate) -> Result<TapeRecord> {
        let tape = self.require_tape(barcode)?;
        let capacity = update.capacity.unwrap_or(tape.capacity);
        if update.capacity.is_some() {
            self.check_capacity(capacity)?;
            if capacity < tape.bytes_used {
                return Err(ArchiveError::InvalidInput(format!(
                    "tape {} already holds {} bytes, more than the new capacity {}",
                    barcode, tape.bytes_used, capacity
                )));
            }
        }
        let tape_type = update.tape_type.clone().or(tape.tape_type);
        let purchase_date = update.purchase_date.or(tape.purchase_date);
        let status = if tape.status.is_writable() {
            if capacity - tape.bytes_used <= self.allocation.margin_for(capacity) {
                TapeStatus::Full
            } else {
                TapeStatus::Available
            }
        } else {
            tape.status
        };
        self.tx.execute(
            "UPDATE tapes SET tape_type = ?1, capacity = ?2, purchase_date = ?3, status = ?4
             WHERE id = ?5",
            params![
                tape_type,
                capacity as i64,
                purchase_date.map(|d| d.to_string()),
                status.as_str(),
                tape.id
            ],
        )?;
        info!("Updated tape {}", barcode);
        self.require_tape(barcode)
    }

    /// Retire or fault a tape and requeue its unstarted attempts
    pub fn withdraw_tape(&self, barcode: &str, status: TapeStatus) -> Result<TapeRecord> {
        let tape = self.require_tape(barcode)?;
        self.tx.execute(
            "UPDATE tapes SET status = ?1 WHERE id = ?2",
            params![status.as_str(), tape.id],
        )?;
        let pending = queries::pending_attempts_for_tape(&self.tx, barcode)?;
        for attempt in &pending {
            self.end_attempt(
                attempt.id,
                AttemptStatus::Pending,
                FailureReason::TapeUnavailable,
                &format!("tape {} is {}", barcode, status),
            )?;
            self.set_file_status(attempt.file_id, FileStatus::Pending)?;
        }
        warn!(
            "Tape {} is now {}; requeued {} pending attempt(s)",
            barcode,
            status,
            pending.len()
        );
        self.require_tape(barcode)
    }

    pub fn stage_file(&self, file: &NewFile) -> Result<FileRecord> {
        if file.name.trim().is_empty() {
            return Err(ArchiveError::InvalidInput("file name cannot be empty".into()));
        }
        if file.size > i64::MAX as u64 {
            return Err(ArchiveError::InvalidInput(format!(
                "file {} size {} is out of range",
                file.name, file.size
            )));
        }
        let inserted = self.tx.execute(
            "INSERT INTO files (path, name, size, digest, status, obsid, jd_start, jd,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                file.path,
                file.name,
                file.size as i64,
                file.digest.map(|d| d.to_hex()),
                FileStatus::Pending.as_str(),
                file.obsid,
                file.jd_start,
                file.jd(),
                self.micros(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ArchiveError::InvalidInput(format!(
                    "file {} is already staged",
                    file.name
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.tx.last_insert_rowid();
        debug!("Staged file {} ({} bytes) as #{}", file.name, file.size, id);
        queries::file(&self.tx, id)
    }

    /// Set a file's digest; a digest, once set, never changes
    pub fn set_file_digest(&self, file_id: i64, digest: Digest) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE files SET digest = ?1, updated_at = ?2 WHERE id = ?3 AND digest IS NULL",
            params![digest.to_hex(), self.micros(), file_id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let file = queries::file(&self.tx, file_id)?;
        match file.digest {
            Some(existing) if existing == digest => Ok(()),
            _ => Err(ArchiveError::DigestImmutable { file: file.name }),
        }
    }

    pub fn requeue_file(&self, name: &str) -> Result<FileRecord> {
        let file = queries::file_by_name(&self.tx, name)?
            .ok_or_else(|| ArchiveError::NotFound(format!("file {}", name)))?;
        if file.status != FileStatus::PermanentlyFailed {
            return Err(ArchiveError::InvalidInput(format!(
                "file {} is {}, only permanently failed files can be requeued",
                name, file.status
            )));
        }
        self.tx.execute(
            "UPDATE files SET status = ?1, failure_count = 0, integrity_failures = 0,
                              updated_at = ?2
             WHERE id = ?3",
            params![FileStatus::Pending.as_str(), self.micros(), file.id],
        )?;
        info!("Operator requeued file {}", name);
        queries::file(&self.tx, file.id)
    }

    // ----- allocation -----

    /// Files waiting for a tape, largest first
    pub fn pending_files(&self) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE f.status = ?1 ORDER BY f.size DESC, f.id",
            FILE_COLUMNS, FILE_FROM
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params![FileStatus::Pending.as_str()], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Available tapes with their reservations, oldest registration first
    pub fn allocatable_tapes(&self) -> Result<Vec<TapeSpace>> {
        let sql = format!(
            "SELECT {} FROM tapes t WHERE t.status = ?1 ORDER BY t.id",
            TAPE_COLUMNS
        );
        let tapes = {
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params![TapeStatus::Available.as_str()], tape_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tapes
            .into_iter()
            .map(|tape| {
                let reserved = self.reserved_bytes(tape.id)?;
                Ok(TapeSpace { tape, reserved })
            })
            .collect()
    }

    fn reserved_bytes(&self, tape_id: i64) -> Result<u64> {
        let reserved: i64 = self.tx.query_row(
            "SELECT COALESCE(SUM(f.size), 0) FROM attempts a JOIN files f ON f.id = a.file_id
             WHERE a.tape_id = ?1 AND a.status IN ('pending', 'copying')",
            params![tape_id],
            |row| row.get(0),
        )?;
        Ok(reserved.max(0) as u64)
    }

    /// Open the next attempt for a pending file on a tape
    pub fn open_attempt(&self, file_id: i64, tape_id: i64) -> Result<ArchiveAttempt> {
        let moved = self.tx.execute(
            "UPDATE files SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                FileStatus::Allocated.as_str(),
                self.micros(),
                file_id,
                FileStatus::Pending.as_str()
            ],
        )?;
        if moved != 1 {
            return Err(ArchiveError::InvalidInput(format!(
                "file #{} is not pending allocation",
                file_id
            )));
        }
        self.insert_attempt(file_id, tape_id)
    }

    fn insert_attempt(&self, file_id: i64, tape_id: i64) -> Result<ArchiveAttempt> {
        let next: u32 = self.tx.query_row(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM attempts WHERE file_id = ?1",
            params![file_id],
            |row| row.get(0),
        )?;
        self.tx.execute(
            "INSERT INTO attempts (file_id, tape_id, attempt_number, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                file_id,
                tape_id,
                next,
                AttemptStatus::Pending.as_str(),
                self.micros()
            ],
        )?;
        queries::attempt(&self.tx, self.tx.last_insert_rowid())
    }

    // ----- claim and transitions -----

    pub fn claim_attempt(&self, attempt_id: i64, worker: &str) -> Result<bool> {
        let claimed = self.tx.execute(
            "UPDATE attempts SET status = ?1, claimed_by = ?2, started_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                AttemptStatus::Copying.as_str(),
                worker,
                self.micros(),
                attempt_id,
                AttemptStatus::Pending.as_str()
            ],
        )?;
        if claimed == 1 {
            debug!("Worker {} claimed attempt #{}", worker, attempt_id);
        }
        Ok(claimed == 1)
    }

    pub fn claim_next(
        &self,
        worker: &str,
        filter: &TapeFilter,
        prefer_tape: Option<&str>,
    ) -> Result<Option<ArchiveAttempt>> {
        let candidates: Vec<(i64, i64, String)> = {
            let mut stmt = self.tx.prepare(
                "SELECT a.id, t.id, t.barcode FROM attempts a JOIN tapes t ON t.id = a.tape_id
                 WHERE a.status = 'pending'
                   AND t.status IN ('available', 'full')
                   AND (t.mounted_by IS NULL OR t.mounted_by = ?1)
                 ORDER BY CASE WHEN t.barcode = ?2 THEN 0 ELSE 1 END, t.id, a.id",
            )?;
            let rows = stmt.query_map(params![worker, prefer_tape.unwrap_or("")], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (attempt_id, tape_id, barcode) in candidates {
            if !filter.allows(&barcode) {
                continue;
            }
            let leased = self.tx.execute(
                "UPDATE tapes SET mounted_by = ?1, leased_at = ?2
                 WHERE id = ?3 AND (mounted_by IS NULL OR mounted_by = ?1)",
                params![worker, self.micros(), tape_id],
            )?;
            if leased != 1 {
                continue;
            }
            if self.claim_attempt(attempt_id, worker)? {
                return Ok(Some(queries::attempt(&self.tx, attempt_id)?));
            }
        }
        Ok(None)
    }

    pub fn transition(&self, attempt_id: i64, from: AttemptStatus, to: AttemptStatus) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(ArchiveError::InvalidTransition {
                attempt: attempt_id,
                from,
                to,
            });
        }
        let changed = self.tx.execute(
            "UPDATE attempts SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), self.micros(), attempt_id, from.as_str()],
        )?;
        self.expect_changed(changed, attempt_id)?;
        debug!("Attempt #{}: {} -> {}", attempt_id, from, to);
        Ok(())
    }

    fn expect_changed(&self, changed: usize, attempt_id: i64) -> Result<()> {
        if changed == 1 {
            return Ok(());
        }
        // Distinguish a missing attempt from one another actor moved on
        queries::attempt(&self.tx, attempt_id)?;
        Err(ArchiveError::ClaimLost {
            attempt: attempt_id,
        })
    }

    pub fn mark_copied(&self, attempt_id: i64, offset: u64, length: u64) -> Result<ArchiveAttempt> {
        let attempt = queries::attempt(&self.tx, attempt_id)?;
        let tape = queries::tape_by_id(&self.tx, attempt.tape_id)?;
        let end = offset.checked_add(length).ok_or_else(|| {
            ArchiveError::InvalidInput(format!("extent {}+{} overflows", offset, length))
        })?;
        if end > tape.capacity {
            return Err(ArchiveError::InvalidInput(format!(
                "extent {}..{} exceeds capacity {} of tape {}",
                offset, end, tape.capacity, tape.barcode
            )));
        }
        let changed = self.tx.execute(
            "UPDATE attempts SET status = ?1, tape_offset = ?2, length = ?3, updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                AttemptStatus::Copied.as_str(),
                offset as i64,
                length as i64,
                self.micros(),
                attempt_id,
                AttemptStatus::Copying.as_str()
            ],
        )?;
        self.expect_changed(changed, attempt_id)?;
        self.advance_tape(&tape, end)?;
        debug!(
            "Attempt #{}: copying -> copied ({} bytes at offset {} on {})",
            attempt_id, length, offset, tape.barcode
        );
        queries::attempt(&self.tx, attempt_id)
    }

    /// Raise `bytes_used` to `position` and flag the tape full when only the margin is left
    fn advance_tape(&self, tape: &TapeRecord, position: u64) -> Result<()> {
        let used = tape.bytes_used.max(position.min(tape.capacity));
        let margin = self.allocation.margin_for(tape.capacity);
        let status = if tape.status == TapeStatus::Available && tape.capacity - used <= margin {
            info!("Tape {} is full ({} of {} bytes used)", tape.barcode, used, tape.capacity);
            TapeStatus::Full
        } else {
            tape.status
        };
        self.tx.execute(
            "UPDATE tapes SET bytes_used = ?1, status = ?2 WHERE id = ?3",
            params![used as i64, status.as_str(), tape.id],
        )?;
        Ok(())
    }

    pub fn complete_verification(&self, attempt_id: i64, digest: Digest) -> Result<FileRecord> {
        let attempt = queries::attempt(&self.tx, attempt_id)?;
        let file = queries::file(&self.tx, attempt.file_id)?;
        match file.digest {
            Some(expected) if expected == digest => {}
            Some(expected) => {
                return Err(ArchiveError::DataIntegrity {
                    expected,
                    actual: digest,
                })
            }
            None => {
                return Err(ArchiveError::InvalidInput(format!(
                    "file {} has no source digest to verify against",
                    file.name
                )))
            }
        }
        let changed = self.tx.execute(
            "UPDATE attempts SET status = ?1, digest = ?2, ended_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                AttemptStatus::Verified.as_str(),
                digest.to_hex(),
                self.micros(),
                attempt_id,
                AttemptStatus::Verifying.as_str()
            ],
        )?;
        self.expect_changed(changed, attempt_id)?;
        let archived = self.tx.execute(
            "UPDATE files SET status = ?1, tape_id = ?2, archived_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                FileStatus::Archived.as_str(),
                attempt.tape_id,
                self.micros(),
                file.id,
                FileStatus::Allocated.as_str()
            ],
        )?;
        if archived != 1 {
            return Err(ArchiveError::InvalidInput(format!(
                "file {} is {}, not allocated",
                file.name, file.status
            )));
        }
        info!(
            "File {} archived on tape {} (attempt {})",
            file.name, attempt.tape, attempt.attempt_number
        );
        queries::file(&self.tx, file.id)
    }

    /// Mark an attempt failed without touching the file's retry state
    fn end_attempt(
        &self,
        attempt_id: i64,
        from: AttemptStatus,
        reason: FailureReason,
        detail: &str,
    ) -> Result<()> {
        if !from.can_transition_to(AttemptStatus::Failed) {
            return Err(ArchiveError::InvalidTransition {
                attempt: attempt_id,
                from,
                to: AttemptStatus::Failed,
            });
        }
        let changed = self.tx.execute(
            "UPDATE attempts SET status = ?1, failure_reason = ?2, failure_detail = ?3,
                                 ended_at = ?4, updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                AttemptStatus::Failed.as_str(),
                reason.as_str(),
                detail,
                self.micros(),
                attempt_id,
                from.as_str()
            ],
        )?;
        self.expect_changed(changed, attempt_id)
    }

    fn set_file_status(&self, file_id: i64, status: FileStatus) -> Result<()> {
        self.tx.execute(
            "UPDATE files SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), self.micros(), file_id],
        )?;
        Ok(())
    }

    pub fn fail_attempt(
        &self,
        attempt_id: i64,
        from: AttemptStatus,
        reason: FailureReason,
        detail: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        self.end_attempt(attempt_id, from, reason, detail)?;
        let attempt = queries::attempt(&self.tx, attempt_id)?;
        let file = queries::file(&self.tx, attempt.file_id)?;

        let (failures, integrity) = match reason.kind() {
            FailureKind::Transient => (file.failure_count + 1, file.integrity_failures),
            FailureKind::DataIntegrity => (file.failure_count + 1, file.integrity_failures + 1),
            FailureKind::Interruption => (file.failure_count, file.integrity_failures),
        };
        self.tx.execute(
            "UPDATE files SET failure_count = ?1, integrity_failures = ?2, last_failure = ?3,
                              updated_at = ?4
             WHERE id = ?5",
            params![failures, integrity, reason.as_str(), self.micros(), file.id],
        )?;

        warn!(
            "Attempt #{} ({} try {}) failed: {} ({})",
            attempt_id, file.name, attempt.attempt_number, reason, detail
        );

        if policy.decide(reason, failures, integrity) == RetryDecision::Escalate {
            self.set_file_status(file.id, FileStatus::PermanentlyFailed)?;
            warn!(
                "File {} permanently failed after {} counted failure(s), last reason {}",
                file.name, failures, reason
            );
            return Ok(FailureOutcome::PermanentlyFailed);
        }

        let tape = queries::tape_by_id(&self.tx, attempt.tape_id)?;
        let margin = self.allocation.margin_for(tape.capacity);
        let space = TapeSpace {
            reserved: self.reserved_bytes(tape.id)?,
            tape,
        };
        if space.tape.status.is_writable()
            && reason != FailureReason::DriveFault
            && file.size <= space.allocatable(margin)
        {
            let retry = self.insert_attempt(file.id, space.tape.id)?;
            info!(
                "Retrying file {} on tape {} as attempt {}",
                file.name, space.tape.barcode, retry.attempt_number
            );
            return Ok(FailureOutcome::Retried(retry));
        }

        self.set_file_status(file.id, FileStatus::Pending)?;
        info!(
            "File {} returned to the allocator after failure on tape {}",
            file.name, space.tape.barcode
        );
        Ok(FailureOutcome::Requeued)
    }

    // ----- tape leases -----

    pub fn record_mount(&self, barcode: &str, worker: &str) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE tapes SET mount_count = mount_count + 1, mounted_by = ?1, leased_at = ?2
             WHERE barcode = ?3",
            params![worker, self.micros(), barcode],
        )?;
        if changed != 1 {
            return Err(ArchiveError::NotFound(format!("tape {}", barcode)));
        }
        Ok(())
    }

    pub fn release_tape(&self, barcode: &str, worker: &str) -> Result<bool> {
        let changed = self.tx.execute(
            "UPDATE tapes SET mounted_by = NULL, leased_at = NULL
             WHERE barcode = ?1 AND mounted_by = ?2",
            params![barcode, worker],
        )?;
        Ok(changed == 1)
    }

    /// Drop every lease held by one of `workers`
    pub fn release_leases_of(&self, workers: &[String]) -> Result<usize> {
        let mut released = 0;
        for worker in workers {
            released += self.tx.execute(
                "UPDATE tapes SET mounted_by = NULL, leased_at = NULL WHERE mounted_by = ?1",
                params![worker],
            )?;
        }
        Ok(released)
    }

    /// Drop leases older than `cutoff` whose holder has nothing in flight
    pub fn release_idle_leases(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let released = self.tx.execute(
            "UPDATE tapes SET mounted_by = NULL, leased_at = NULL
             WHERE mounted_by IS NOT NULL AND leased_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM attempts a
                   WHERE a.tape_id = tapes.id
                     AND a.claimed_by = tapes.mounted_by
                     AND a.status IN ('copying', 'copied', 'verifying'))",
            params![to_micros(cutoff)],
        )?;
        Ok(released)
    }

    pub fn sync_tape_position(&self, barcode: &str, position: u64) -> Result<TapeRecord> {
        let tape = self.require_tape(barcode)?;
        if position > tape.bytes_used {
            if position > tape.capacity {
                warn!(
                    "Drive reports tape {} at {} bytes, beyond its declared capacity {}",
                    barcode, position, tape.capacity
                );
            } else {
                debug!(
                    "Tape {} append point moved from {} to {}",
                    barcode, tape.bytes_used, position
                );
            }
            self.advance_tape(&tape, position)?;
        }
        self.require_tape(barcode)
    }

    // ----- recovery -----

    /// Claimed attempts held by any of `workers`
    pub fn active_attempts_of(&self, workers: &[String]) -> Result<Vec<ArchiveAttempt>> {
        let all = queries::attempts_with_status(&self.tx, &AttemptStatus::ACTIVE)?;
        Ok(all
            .into_iter()
            .filter(|a| {
                a.claimed_by
                    .as_ref()
                    .map(|w| workers.contains(w))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Claimed attempts whose last transition is older than `cutoff`
    pub fn active_attempts_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ArchiveAttempt>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE a.status IN ({}) AND a.updated_at < ?1 ORDER BY a.id",
            ATTEMPT_COLUMNS,
            ATTEMPT_FROM,
            status_list(&AttemptStatus::ACTIVE)
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params![to_micros(cutoff)], attempt_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tape_exists(&self, barcode: &str) -> Result<bool> {
        Ok(queries::tape(&self.tx, barcode)?.is_some())
    }

    fn require_tape(&self, barcode: &str) -> Result<TapeRecord> {
        queries::tape(&self.tx, barcode)?
            .ok_or_else(|| ArchiveError::NotFound(format!("tape {}", barcode)))
    }
}

/// Read queries shared by [`Ledger`] and [`LedgerTx`]
pub mod queries {
    use super::*;

    pub fn file(conn: &Connection, id: i64) -> Result<FileRecord> {
        let sql = format!("SELECT {} FROM {} WHERE f.id = ?1", FILE_COLUMNS, FILE_FROM);
        conn.query_row(&sql, params![id], file_from_row)
            .optional()?
            .ok_or_else(|| ArchiveError::NotFound(format!("file #{}", id)))
    }

    pub fn file_by_name(conn: &Connection, name: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM {} WHERE f.name = ?1", FILE_COLUMNS, FILE_FROM);
        Ok(conn.query_row(&sql, params![name], file_from_row).optional()?)
    }

    pub fn files_by_status(conn: &Connection, status: FileStatus) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE f.status = ?1 ORDER BY f.id",
            FILE_COLUMNS, FILE_FROM
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn files_on_tape(conn: &Connection, barcode: &str) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE t.barcode = ?1 AND f.status = ?2 ORDER BY f.id",
            FILE_COLUMNS, FILE_FROM
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![barcode, FileStatus::Archived.as_str()],
            file_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn distinct_jds(conn: &Connection) -> Result<Vec<i64>> {
        let mut stmt =
            conn.prepare("SELECT DISTINCT jd FROM files WHERE jd IS NOT NULL ORDER BY jd")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tape(conn: &Connection, barcode: &str) -> Result<Option<TapeRecord>> {
        let sql = format!("SELECT {} FROM tapes t WHERE t.barcode = ?1", TAPE_COLUMNS);
        Ok(conn.query_row(&sql, params![barcode], tape_from_row).optional()?)
    }

    pub fn tape_by_id(conn: &Connection, id: i64) -> Result<TapeRecord> {
        let sql = format!("SELECT {} FROM tapes t WHERE t.id = ?1", TAPE_COLUMNS);
        conn.query_row(&sql, params![id], tape_from_row)
            .optional()?
            .ok_or_else(|| ArchiveError::NotFound(format!("tape #{}", id)))
    }

    pub fn tapes(conn: &Connection) -> Result<Vec<TapeRecord>> {
        let sql = format!("SELECT {} FROM tapes t ORDER BY t.id", TAPE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], tape_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tapes_with_remaining_capacity(conn: &Connection) -> Result<Vec<TapeRecord>> {
        let sql = format!(
            "SELECT {} FROM tapes t WHERE t.status = ?1 AND t.capacity > t.bytes_used
             ORDER BY t.id",
            TAPE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![TapeStatus::Available.as_str()], tape_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn attempt(conn: &Connection, id: i64) -> Result<ArchiveAttempt> {
        let sql = format!(
            "SELECT {} FROM {} WHERE a.id = ?1",
            ATTEMPT_COLUMNS, ATTEMPT_FROM
        );
        conn.query_row(&sql, params![id], attempt_from_row)
            .optional()?
            .ok_or_else(|| ArchiveError::NotFound(format!("attempt #{}", id)))
    }

    pub fn attempts_for_file(conn: &Connection, file_id: i64) -> Result<Vec<ArchiveAttempt>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE a.file_id = ?1 ORDER BY a.attempt_number",
            ATTEMPT_COLUMNS, ATTEMPT_FROM
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![file_id], attempt_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn pending_attempts_for_tape(
        conn: &Connection,
        barcode: &str,
    ) -> Result<Vec<ArchiveAttempt>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE t.barcode = ?1 AND a.status = ?2 ORDER BY a.id",
            ATTEMPT_COLUMNS, ATTEMPT_FROM
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![barcode, AttemptStatus::Pending.as_str()],
            attempt_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn attempts_with_status(
        conn: &Connection,
        statuses: &[AttemptStatus],
    ) -> Result<Vec<ArchiveAttempt>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE a.status IN ({}) ORDER BY a.id",
            ATTEMPT_COLUMNS,
            ATTEMPT_FROM,
            status_list(statuses)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], attempt_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(conn: &Connection) -> Result<LedgerStats> {
        let mut stats = LedgerStats::default();
        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM files GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                stats.files.insert(status.parse()?, count as u64);
            }
        }
        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM attempts GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                stats.attempts.insert(status.parse()?, count as u64);
            }
        }
        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tapes GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                stats.tapes.insert(status.parse()?, count as u64);
            }
        }
        let archived: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM files WHERE status = ?1",
            params![FileStatus::Archived.as_str()],
            |row| row.get(0),
        )?;
        stats.archived_bytes = archived.max(0) as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use tempfile::TempDir;

    fn open_ledger(dir: &TempDir) -> Ledger {
        let mut config = ArchiveConfig::new(dir.path().join("ledger.db"));
        config.ledger.min_tape_capacity = 1;
        config.allocation.capacity_margin_ratio = 0.0;
        Ledger::open(&config).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::from(RetryConfig::default())
    }

    fn allocate_one(ledger: &Ledger, file: &FileRecord, tape: &TapeRecord) -> ArchiveAttempt {
        ledger
            .write(|tx| tx.open_attempt(file.id, tape.id))
            .unwrap()
    }

    #[test]
    fn test_register_and_query_tape() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let date = chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let tape = ledger
            .register_tape(NewTape::new("HERA_01", 8_000).with_type("LTO-8").purchased(date))
            .unwrap();
        assert_eq!(tape.status, TapeStatus::Available);
        assert_eq!(tape.purchase_date, Some(date));

        let fetched = ledger.tape("HERA_01").unwrap().unwrap();
        assert_eq!(fetched, tape);
        assert!(ledger.tape("foo").unwrap().is_none());

        assert!(matches!(
            ledger.register_tape(NewTape::new("HERA_01", 8_000)),
            Err(ArchiveError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_minimum_tape_capacity() {
        let dir = TempDir::new().unwrap();
        let config = ArchiveConfig::new(dir.path().join("ledger.db"));
        let ledger = Ledger::open(&config).unwrap();
        let err = ledger
            .register_tape(NewTape::new("SMALL", 1_000_000))
            .unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_update_tape() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        ledger.register_tape(NewTape::new("HERA_01", 8_000)).unwrap();
        let updated = ledger
            .update_tape(
                "HERA_01",
                TapeUpdate {
                    tape_type: Some("foo".into()),
                    capacity: Some(5_000),
                    purchase_date: None,
                },
            )
            .unwrap();
        assert_eq!(updated.tape_type.as_deref(), Some("foo"));
        assert_eq!(updated.capacity, 5_000);
        assert!(ledger
            .update_tape("missing", TapeUpdate::default())
            .is_err());
    }

    #[test]
    fn test_stage_file_and_digest_immutability() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let file = ledger
            .stage_file(NewFile::new("/data/2459563/zen.uvh5", 100).observation(1, 2459563.7))
            .unwrap();
        assert_eq!(file.status, FileStatus::Pending);
        assert_eq!(file.jd, Some(2459563));
        assert!(file.digest.is_none());

        let digest = Digest::of(b"abc123");
        ledger.set_file_digest(file.id, digest).unwrap();
        ledger.set_file_digest(file.id, digest).unwrap();
        assert!(matches!(
            ledger.set_file_digest(file.id, Digest::of(b"xyz999")),
            Err(ArchiveError::DigestImmutable { .. })
        ));
        assert_eq!(ledger.file(file.id).unwrap().digest, Some(digest));

        assert!(ledger.stage_file(NewFile::new("/other/zen.uvh5", 1)).is_err());
        assert_eq!(ledger.distinct_jds().unwrap(), vec![2459563]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let file = ledger.stage_file(NewFile::new("/s/a", 10)).unwrap();
        let attempt = allocate_one(&ledger, &file, &tape);

        assert!(ledger.claim_attempt(attempt.id, "w1").unwrap());
        assert!(!ledger.claim_attempt(attempt.id, "w2").unwrap());
        let claimed = ledger.attempt(attempt.id).unwrap();
        assert_eq!(claimed.status, AttemptStatus::Copying);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn test_one_open_attempt_per_file() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let file = ledger.stage_file(NewFile::new("/s/a", 10)).unwrap();
        allocate_one(&ledger, &file, &tape);

        // Bypass the file-status guard to hit the schema rule directly
        let result = ledger.write(|tx| tx.insert_attempt(file.id, tape.id));
        assert!(matches!(result, Err(ArchiveError::Database(_))));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let file = ledger.stage_file(NewFile::new("/s/a", 10)).unwrap();
        let attempt = allocate_one(&ledger, &file, &tape);

        assert!(matches!(
            ledger.transition_attempt(attempt.id, AttemptStatus::Pending, AttemptStatus::Verified),
            Err(ArchiveError::InvalidTransition { .. })
        ));
        // Valid edge, wrong current state
        assert!(matches!(
            ledger.transition_attempt(attempt.id, AttemptStatus::Copied, AttemptStatus::Verifying),
            Err(ArchiveError::ClaimLost { .. })
        ));
    }

    #[test]
    fn test_happy_path_transitions() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let digest = Digest::of(b"0123456789");
        let file = ledger
            .stage_file(NewFile::new("/s/a", 10).with_digest(digest))
            .unwrap();
        let attempt = allocate_one(&ledger, &file, &tape);

        assert!(ledger.claim_attempt(attempt.id, "w1").unwrap());
        let copied = ledger.mark_copied(attempt.id, 0, 10).unwrap();
        assert_eq!(copied.offset, Some(0));
        assert_eq!(copied.length, Some(10));
        assert_eq!(ledger.tape("T1").unwrap().unwrap().bytes_used, 10);

        ledger
            .transition_attempt(attempt.id, AttemptStatus::Copied, AttemptStatus::Verifying)
            .unwrap();
        let archived = ledger.complete_verification(attempt.id, digest).unwrap();
        assert_eq!(archived.status, FileStatus::Archived);
        assert_eq!(archived.tape.as_deref(), Some("T1"));
        assert!(archived.archived_at.is_some());

        let history = ledger.attempts_for_file(file.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttemptStatus::Verified);
        assert_eq!(history[0].digest, Some(digest));
        assert_eq!(ledger.files_on_tape("T1").unwrap().len(), 1);

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.files_with(FileStatus::Archived), 1);
        assert_eq!(stats.archived_bytes, 10);
    }

    #[test]
    fn test_verification_rejects_wrong_digest() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let file = ledger
            .stage_file(NewFile::new("/s/a", 3).with_digest(Digest::of(b"abc")))
            .unwrap();
        let attempt = allocate_one(&ledger, &file, &tape);
        ledger.claim_attempt(attempt.id, "w1").unwrap();
        ledger.mark_copied(attempt.id, 0, 3).unwrap();
        ledger
            .transition_attempt(attempt.id, AttemptStatus::Copied, AttemptStatus::Verifying)
            .unwrap();
        assert!(matches!(
            ledger.complete_verification(attempt.id, Digest::of(b"abd")),
            Err(ArchiveError::DataIntegrity { .. })
        ));
        // Rolled back: still verifying
        assert_eq!(
            ledger.attempt(attempt.id).unwrap().status,
            AttemptStatus::Verifying
        );
    }

    #[test]
    fn test_failure_retries_on_same_tape() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let file = ledger.stage_file(NewFile::new("/s/a", 10)).unwrap();
        let attempt = allocate_one(&ledger, &file, &tape);
        ledger.claim_attempt(attempt.id, "w1").unwrap();

        let outcome = ledger
            .fail_attempt(
                attempt.id,
                AttemptStatus::Copying,
                FailureReason::DriveTimeout,
                "timed out",
                &policy(),
            )
            .unwrap();
        let retry = match outcome {
            FailureOutcome::Retried(retry) => retry,
            other => panic!("expected retry, got {:?}", other),
        };
        assert_eq!(retry.attempt_number, 2);
        assert_eq!(retry.status, AttemptStatus::Pending);

        let failed = ledger.attempt(attempt.id).unwrap();
        assert_eq!(failed.status, AttemptStatus::Failed);
        assert_eq!(failed.failure_reason, Some(FailureReason::DriveTimeout));
        assert!(failed.ended_at.is_some());

        let file = ledger.file(file.id).unwrap();
        assert_eq!(file.status, FileStatus::Allocated);
        assert_eq!(file.failure_count, 1);
        assert_eq!(file.last_failure, Some(FailureReason::DriveTimeout));
    }

    #[test]
    fn test_retired_tape_requeues_pending_attempts() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let tape = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let file = ledger.stage_file(NewFile::new("/s/a", 10)).unwrap();
        let attempt = allocate_one(&ledger, &file, &tape);

        let retired = ledger.retire_tape("T1").unwrap();
        assert_eq!(retired.status, TapeStatus::Retired);
        let attempt = ledger.attempt(attempt.id).unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.failure_reason, Some(FailureReason::TapeUnavailable));
        assert_eq!(ledger.file(file.id).unwrap().status, FileStatus::Pending);
        assert!(ledger.tapes_with_remaining_capacity().unwrap().is_empty());
    }

    #[test]
    fn test_claim_next_respects_leases_and_filters() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let t1 = ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        let t2 = ledger.register_tape(NewTape::new("T2", 1_000)).unwrap();
        let a = ledger.stage_file(NewFile::new("/s/a", 10)).unwrap();
        let b = ledger.stage_file(NewFile::new("/s/b", 10)).unwrap();
        let c = ledger.stage_file(NewFile::new("/s/c", 10)).unwrap();
        allocate_one(&ledger, &a, &t1);
        allocate_one(&ledger, &b, &t1);
        allocate_one(&ledger, &c, &t2);

        let first = ledger.claim_next("w1", &TapeFilter::Any, None).unwrap().unwrap();
        assert_eq!(first.tape, "T1");

        // T1 is leased to w1, so w2 only sees T2
        let second = ledger.claim_next("w2", &TapeFilter::Any, None).unwrap().unwrap();
        assert_eq!(second.tape, "T2");
        assert!(ledger.claim_next("w2", &TapeFilter::Any, None).unwrap().is_none());

        let only_t2 = TapeFilter::from_list(Some(&["T2".to_string()]));
        assert!(ledger.claim_next("w1", &only_t2, None).unwrap().is_none());

        let third = ledger
            .claim_next("w1", &TapeFilter::Any, Some("T1"))
            .unwrap()
            .unwrap();
        assert_eq!(third.tape, "T1");

        assert!(ledger.release_tape("T1", "w1").unwrap());
        assert!(!ledger.release_tape("T1", "w1").unwrap());
    }

    #[test]
    fn test_sync_tape_position_marks_full() {
        let dir = TempDir::new().unwrap();
        let mut config = ArchiveConfig::new(dir.path().join("ledger.db"));
        config.ledger.min_tape_capacity = 1;
        config.allocation.capacity_margin_ratio = 0.1;
        let ledger = Ledger::open(&config).unwrap();
        ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();

        let tape = ledger.sync_tape_position("T1", 500).unwrap();
        assert_eq!(tape.bytes_used, 500);
        assert_eq!(tape.status, TapeStatus::Available);

        let tape = ledger.sync_tape_position("T1", 950).unwrap();
        assert_eq!(tape.status, TapeStatus::Full);

        // Never moves backwards, never exceeds capacity
        let tape = ledger.sync_tape_position("T1", 5_000).unwrap();
        assert_eq!(tape.bytes_used, 1_000);
        let tape = ledger.sync_tape_position("T1", 10).unwrap();
        assert_eq!(tape.bytes_used, 1_000);
    }

    #[test]
    fn test_try_clone_sees_same_data() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let other = ledger.try_clone().unwrap();
        ledger.register_tape(NewTape::new("T1", 1_000)).unwrap();
        assert!(other.tape("T1").unwrap().is_some());
    }
}
