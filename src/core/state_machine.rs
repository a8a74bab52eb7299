//! Archive state machine
//!
//! Drives one claimed attempt through the copy-and-verify protocol:
//!
//! ```text
//! copying ──write all blocks──▶ copied ──▶ verifying ──digests equal──▶ verified
//!    │                                         │
//!    └──────────── any failure ────────────────┴──▶ failed ──▶ retry policy
//! ```
//!
//! Every step is a conditional ledger update. If another actor moved the
//! attempt in the meantime (a recovery pass declared it abandoned), the next
//! update fails with `ClaimLost` and the machine stops without touching the
//! attempt again.

use crate::checksum::{Digest, StreamingDigest};
use crate::config::RetryConfig;
use crate::drive::{DriveError, MountedTape};
use crate::error::{ArchiveError, Result};
use crate::ledger::{FailureOutcome, Ledger};
use crate::model::{ArchiveAttempt, AttemptStatus, FailureKind, FailureReason, FileRecord};
use std::fs::File;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with a file after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Escalate,
}

/// Bounded retry budget per file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_integrity_retries: u32,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            max_integrity_retries: config.max_integrity_retries,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl RetryPolicy {
    /// Decide from counters that already include the failure being judged
    pub fn decide(
        &self,
        reason: FailureReason,
        failure_count: u32,
        integrity_failures: u32,
    ) -> RetryDecision {
        match reason.kind() {
            FailureKind::Interruption => RetryDecision::Retry,
            _ if integrity_failures > self.max_integrity_retries => RetryDecision::Escalate,
            _ if failure_count > self.max_retries => RetryDecision::Escalate,
            _ => RetryDecision::Retry,
        }
    }
}

/// Cooperative cancellation flag shared between a coordinator and its workers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How a run of the state machine ended
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Copy verified; the file is archived
    Verified(FileRecord),
    /// Attempt failed and the retry policy was applied
    Failed {
        reason: FailureReason,
        outcome: FailureOutcome,
    },
    /// Another actor resolved the attempt first
    Lost,
}

/// Why execution stopped before `verified`
enum Halt {
    Failed {
        reason: FailureReason,
        detail: String,
    },
    Drive(DriveError),
    Ledger(ArchiveError),
}

impl From<ArchiveError> for Halt {
    fn from(error: ArchiveError) -> Self {
        match error {
            ArchiveError::DataIntegrity { expected, actual } => Halt::Failed {
                reason: FailureReason::DigestMismatch,
                detail: format!("expected {}, read back {}", expected, actual),
            },
            ArchiveError::DigestImmutable { file } => Halt::Failed {
                reason: FailureReason::DigestMismatch,
                detail: format!("source digest differs from the one recorded for {}", file),
            },
            other => Halt::Ledger(other),
        }
    }
}

impl From<DriveError> for Halt {
    fn from(error: DriveError) -> Self {
        Halt::Drive(error)
    }
}

fn failed(reason: FailureReason, detail: impl Into<String>) -> Halt {
    Halt::Failed {
        reason,
        detail: detail.into(),
    }
}

/// Copy-and-verify driver for claimed attempts
pub struct ArchiveStateMachine<'a> {
    ledger: &'a Ledger,
    policy: RetryPolicy,
    block_size: usize,
}

impl<'a> ArchiveStateMachine<'a> {
    pub fn new(ledger: &'a Ledger, policy: RetryPolicy, block_size: usize) -> Self {
        ArchiveStateMachine {
            ledger,
            policy,
            block_size: block_size.max(1),
        }
    }

    /// Drive a `copying` attempt to a terminal state
    ///
    /// The attempt must already be claimed and `tape` must hold its
    /// cartridge. Returns `Err` only when the ledger itself fails; every
    /// drive, source, or integrity problem ends the attempt as `failed`.
    pub fn run(
        &self,
        attempt: &ArchiveAttempt,
        tape: &mut MountedTape<'_>,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        if tape.barcode() != attempt.tape {
            return Err(ArchiveError::InvalidInput(format!(
                "attempt #{} targets tape {}, but {} is mounted",
                attempt.id,
                attempt.tape,
                tape.barcode()
            )));
        }
        let file = self.ledger.file(attempt.file_id)?;
        let mut stage = AttemptStatus::Copying;
        info!(
            "Archiving {} ({} bytes) to tape {}, attempt {}",
            file.name, file.size, attempt.tape, attempt.attempt_number
        );

        let halt = match self.execute(attempt, &file, tape, cancel, &mut stage) {
            Ok(archived) => return Ok(AttemptOutcome::Verified(archived)),
            Err(halt) => halt,
        };

        let (reason, detail) = match halt {
            Halt::Failed { reason, detail } => (reason, detail),
            Halt::Drive(error) => {
                self.handle_drive_error(&error, tape.barcode())?;
                (error.failure_reason(), error.to_string())
            }
            Halt::Ledger(ArchiveError::ClaimLost { .. }) => {
                warn!(
                    "Attempt #{} for {} was resolved by another actor while {}",
                    attempt.id, file.name, stage
                );
                return Ok(AttemptOutcome::Lost);
            }
            Halt::Ledger(error) => {
                // Leave nothing in flight; the worker settles the attempt if this fails too
                if let Err(e) = self.ledger.fail_attempt(
                    attempt.id,
                    stage,
                    FailureReason::LedgerUnavailable,
                    &error.to_string(),
                    &self.policy,
                ) {
                    warn!("Could not record failure of attempt #{}: {}", attempt.id, e);
                }
                return Err(error);
            }
        };

        match self
            .ledger
            .fail_attempt(attempt.id, stage, reason, &detail, &self.policy)
        {
            Ok(outcome) => Ok(AttemptOutcome::Failed { reason, outcome }),
            Err(ArchiveError::ClaimLost { .. }) => Ok(AttemptOutcome::Lost),
            Err(e) => Err(e),
        }
    }

    fn handle_drive_error(&self, error: &DriveError, barcode: &str) -> Result<()> {
        match error {
            DriveError::Fault { .. } => {
                self.ledger.mark_tape_faulted(barcode)?;
            }
            DriveError::MediaFull(_) => {
                if let Some(tape) = self.ledger.tape(barcode)? {
                    self.ledger.sync_tape_position(barcode, tape.capacity)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn execute(
        &self,
        attempt: &ArchiveAttempt,
        file: &FileRecord,
        tape: &mut MountedTape<'_>,
        cancel: &CancellationToken,
        stage: &mut AttemptStatus,
    ) -> std::result::Result<FileRecord, Halt> {
        let offset = tape.position()?;
        let record = self.ledger.sync_tape_position(tape.barcode(), offset)?;
        let end = offset.saturating_add(file.size);
        if end > record.capacity {
            return Err(failed(
                FailureReason::TapeUnavailable,
                format!(
                    "tape {} has {} bytes left at offset {}, file needs {}",
                    record.barcode,
                    record.capacity.saturating_sub(offset),
                    offset,
                    file.size
                ),
            ));
        }

        let source_digest = self.copy(file, tape, cancel)?;
        self.ledger.mark_copied(attempt.id, offset, file.size)?;
        *stage = AttemptStatus::Copied;

        self.ledger
            .transition_attempt(attempt.id, AttemptStatus::Copied, AttemptStatus::Verifying)?;
        *stage = AttemptStatus::Verifying;

        let read_back = self.read_back(tape, offset, file.size, cancel)?;
        if read_back != source_digest {
            return Err(failed(
                FailureReason::DigestMismatch,
                format!("source {}, read back {}", source_digest, read_back),
            ));
        }
        Ok(self.ledger.complete_verification(attempt.id, read_back)?)
    }

    /// Stream the source onto tape, hashing on the way
    fn copy(
        &self,
        file: &FileRecord,
        tape: &mut MountedTape<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Digest, Halt> {
        let mut source = File::open(&file.path).map_err(|e| {
            failed(
                FailureReason::SourceUnreadable,
                format!("cannot open {}: {}", file.path, e),
            )
        })?;
        let mut digest = StreamingDigest::new();
        let mut buf = vec![0u8; self.block_size];
        loop {
            if cancel.is_cancelled() {
                return Err(failed(
                    FailureReason::Cancelled,
                    format!("cancelled after {} bytes", digest.bytes()),
                ));
            }
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(failed(
                        FailureReason::SourceUnreadable,
                        format!("reading {}: {}", file.path, e),
                    ))
                }
            };
            if digest.bytes() + n as u64 > file.size {
                return Err(failed(
                    FailureReason::DigestMismatch,
                    format!("{} grew beyond its recorded {} bytes", file.path, file.size),
                ));
            }
            digest.update(&buf[..n]);
            tape.write_all(&buf[..n])?;
        }

        let written = digest.bytes();
        let source_digest = digest.finalize();
        if written != file.size {
            return Err(failed(
                FailureReason::DigestMismatch,
                format!(
                    "{} is {} bytes, recorded as {}",
                    file.path, written, file.size
                ),
            ));
        }
        match file.digest {
            Some(expected) if expected != source_digest => Err(failed(
                FailureReason::DigestMismatch,
                format!("source {} hashes to {}, recorded {}", file.path, source_digest, expected),
            )),
            Some(_) => Ok(source_digest),
            None => {
                self.ledger.set_file_digest(file.id, source_digest)?;
                debug!("Recorded digest {} for {}", source_digest, file.name);
                Ok(source_digest)
            }
        }
    }

    /// Read the written extent back and hash it
    fn read_back(
        &self,
        tape: &mut MountedTape<'_>,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<Digest, Halt> {
        let mut digest = StreamingDigest::new();
        let mut done = 0u64;
        while done < length {
            if cancel.is_cancelled() {
                return Err(failed(
                    FailureReason::Cancelled,
                    format!("cancelled during verification after {} bytes", done),
                ));
            }
            let n = (length - done).min(self.block_size as u64) as usize;
            let block = tape.read_exact(offset + done, n)?;
            digest.update(&block);
            done += n as u64;
        }
        Ok(digest.finalize())
    }
}
