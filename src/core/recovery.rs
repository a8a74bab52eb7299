//! Crash and timeout recovery
//!
//! Partial tape writes are never trusted. An attempt that was in flight when
//! its worker died, or that has not moved for longer than the attempt
//! budget, is failed and superseded by a fresh `pending` attempt. The bytes
//! it may have written stay on tape as dead space; the next attempt appends
//! after them.

use crate::error::Result;
use crate::ledger::{FailureOutcome, Ledger, LedgerTx};
use crate::model::{ArchiveAttempt, FailureReason};
use crate::state_machine::RetryPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{info, warn};

/// What a recovery pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Attempts failed by the pass
    pub failed: Vec<ArchiveAttempt>,
    /// Fresh attempts opened in their place
    pub retried: Vec<ArchiveAttempt>,
    /// Files sent back to the allocator
    pub requeued: usize,
    /// Files that ran out of retries
    pub exhausted: usize,
    /// Tape leases dropped
    pub leases_released: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.leases_released == 0
    }
}

/// Recovery passes over a shared ledger
pub struct Recovery<'a> {
    ledger: &'a Ledger,
    policy: RetryPolicy,
}

impl<'a> Recovery<'a> {
    pub fn new(ledger: &'a Ledger, policy: RetryPolicy) -> Self {
        Recovery { ledger, policy }
    }

    /// Resolve in-flight attempts left behind by a restarted process
    ///
    /// `worker_ids` are the identities the restarting process is about to
    /// reuse; nothing else can still be acting under them.
    pub fn recover_orphaned(&self, worker_ids: &[String]) -> Result<RecoveryReport> {
        let report = self.release_workers(worker_ids, FailureReason::Stale)?;
        if !report.is_empty() {
            info!(
                "Orphan recovery: {} stale attempt(s), {} lease(s) released",
                report.failed.len(),
                report.leases_released
            );
        }
        Ok(report)
    }

    /// Fail every in-flight attempt held under `worker_ids` and drop their leases
    ///
    /// Used on restart and by a live worker that lost track of its own
    /// attempt, e.g. because the ledger refused the write that would have
    /// closed it.
    pub fn release_workers(
        &self,
        worker_ids: &[String],
        reason: FailureReason,
    ) -> Result<RecoveryReport> {
        let policy = self.policy;
        self.ledger.write(|tx| {
            let held = tx.active_attempts_of(worker_ids)?;
            let mut report = RecoveryReport::default();
            for attempt in held {
                let detail = format!(
                    "worker {} released attempt while {} ({})",
                    attempt.claimed_by.as_deref().unwrap_or("?"),
                    attempt.status,
                    reason
                );
                resolve(tx, attempt, reason, &detail, &policy, &mut report)?;
            }
            report.leases_released = tx.release_leases_of(worker_ids)?;
            Ok(report)
        })
    }

    /// Resolve attempts that have not moved within `budget`
    pub fn recover_abandoned(&self, now: DateTime<Utc>, budget: Duration) -> Result<RecoveryReport> {
        let budget = ChronoDuration::from_std(budget).unwrap_or_else(|_| ChronoDuration::weeks(52 * 1000));
        let cutoff = now.checked_sub_signed(budget).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let policy = self.policy;
        let report = self.ledger.write(|tx| {
            let abandoned = tx.active_attempts_updated_before(cutoff)?;
            let mut report = RecoveryReport::default();
            for attempt in abandoned {
                let detail = format!(
                    "no progress since {} while {}",
                    attempt.updated_at.to_rfc3339(),
                    attempt.status
                );
                resolve(tx, attempt, FailureReason::Abandoned, &detail, &policy, &mut report)?;
            }
            report.leases_released = tx.release_idle_leases(cutoff)?;
            Ok(report)
        })?;
        if !report.is_empty() {
            warn!(
                "Abandonment recovery: {} attempt(s) exceeded the budget, {} lease(s) released",
                report.failed.len(),
                report.leases_released
            );
        }
        Ok(report)
    }
}

fn resolve(
    tx: &LedgerTx<'_>,
    attempt: ArchiveAttempt,
    reason: FailureReason,
    detail: &str,
    policy: &RetryPolicy,
    report: &mut RecoveryReport,
) -> Result<()> {
    match tx.fail_attempt(attempt.id, attempt.status, reason, detail, policy)? {
        FailureOutcome::Retried(fresh) => report.retried.push(fresh),
        FailureOutcome::Requeued => report.requeued += 1,
        // A worker that keeps dying on the same file uses up its budget
        FailureOutcome::PermanentlyFailed => report.exhausted += 1,
    }
    report.failed.push(attempt);
    Ok(())
}
