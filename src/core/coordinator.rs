//! Archive coordinator
//!
//! Runs one worker thread per tape drive. Workers never share in-process
//! state that matters for correctness: each owns its own ledger connection
//! and coordinates with every other worker, on this host or another, only
//! through conditional ledger updates and tape leases.
//!
//! A worker loop:
//! 1. claim the next pending attempt, preferring the tape it has mounted
//! 2. mount the tape (held by a [`MountedTape`] guard for the session)
//! 3. drive the attempt through the [`ArchiveStateMachine`]
//! 4. when nothing is claimable, unmount, release the lease, run an
//!    allocation pass and an abandonment recovery pass, then wait
//!
//! A session always ends with the tape unmounted and its lease released. If
//! an error left an attempt claimed (the ledger refused the write that would
//! have failed it), the worker fails it as `ledger_unavailable` before it
//! claims anything else.
//!
//! Shutdown is signalled over crossbeam channels. `drain` stops claiming
//! and lets in-flight attempts finish; `cancel` additionally trips the
//! shared [`CancellationToken`] so in-flight copies stop between blocks.

use crate::allocator::{AllocationReport, Allocator, SparePool};
use crate::config::{ArchiveConfig, CoordinatorConfig};
use crate::drive::{DriveError, MountedTape, TapeDrive};
use crate::error::{ArchiveError, ErrorClass, Result};
use crate::ledger::{FailureOutcome, Ledger, TapeFilter};
use crate::model::{ArchiveAttempt, AttemptStatus, FailureReason};
use crate::recovery::{Recovery, RecoveryReport};
use crate::state_machine::{
    ArchiveStateMachine, AttemptOutcome, CancellationToken, RetryPolicy,
};
use chrono::Utc;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Control messages from the coordinator to its workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Drain,
    Cancel,
}

/// Progress reports from workers
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started {
        worker: String,
    },
    Finished {
        worker: String,
        attempt: i64,
        outcome: AttemptOutcome,
    },
    Allocated {
        worker: String,
        report: AllocationReport,
    },
    Recovered {
        worker: String,
        report: RecoveryReport,
    },
    Error {
        worker: String,
        class: ErrorClass,
        message: String,
    },
    Stopped {
        worker: String,
        summary: RunSummary,
    },
}

/// Attempt outcomes counted by a worker or a whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub verified: usize,
    pub failed: usize,
    pub permanently_failed: usize,
    pub lost: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Verified(_) => self.verified += 1,
            AttemptOutcome::Failed { outcome, .. } => {
                self.failed += 1;
                if *outcome == FailureOutcome::PermanentlyFailed {
                    self.permanently_failed += 1;
                }
            }
            AttemptOutcome::Lost => self.lost += 1,
        }
    }

    fn merge(&mut self, other: &RunSummary) {
        self.verified += other.verified;
        self.failed += other.failed;
        self.permanently_failed += other.permanently_failed;
        self.lost += other.lost;
    }
}

/// Orchestrates concurrent drive workers
pub struct Coordinator {
    ledger: Ledger,
    config: ArchiveConfig,
    drives: Vec<Box<dyn TapeDrive>>,
}

impl Coordinator {
    /// Prepare a coordinator; fails fast if there is nothing to run
    pub fn new(ledger: &Ledger, config: ArchiveConfig, drives: Vec<Box<dyn TapeDrive>>) -> Result<Self> {
        if drives.is_empty() {
            return Err(ArchiveError::FatalConfig(
                "no tape drives available".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for drive in &drives {
            if !seen.insert(drive.id().to_string()) {
                return Err(ArchiveError::FatalConfig(format!(
                    "drive id '{}' is used twice",
                    drive.id()
                )));
            }
        }
        Ok(Coordinator {
            ledger: ledger.try_clone()?,
            config,
            drives,
        })
    }

    fn worker_ids(&self) -> Vec<String> {
        self.drives
            .iter()
            .map(|d| self.config.coordinator.worker_id(d.id()))
            .collect()
    }

    /// Recover orphans and spawn one worker per drive
    pub fn start(self) -> Result<CoordinatorHandle> {
        self.spawn(false)
    }

    /// Run until no claimable work remains and allocation assigns nothing
    pub fn run_until_idle(self) -> Result<RunSummary> {
        let mut handle = self.spawn(true)?;
        handle.wait()
    }

    fn spawn(self, stop_when_idle: bool) -> Result<CoordinatorHandle> {
        let worker_ids = self.worker_ids();
        let policy = RetryPolicy::from(self.config.retry);
        let recovered = Recovery::new(&self.ledger, policy).recover_orphaned(&worker_ids)?;
        if !recovered.is_empty() {
            info!(
                "Recovered {} orphaned attempt(s) before starting workers",
                recovered.failed.len()
            );
        }

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = channel::unbounded();
        let mut workers = Vec::with_capacity(self.drives.len());
        let mut signals = Vec::with_capacity(self.drives.len());

        for (drive, worker_id) in self.drives.into_iter().zip(worker_ids) {
            let filter = self
                .config
                .drives
                .iter()
                .find(|d| d.id == drive.id())
                .map(|d| TapeFilter::from_list(d.tapes.as_deref()))
                .unwrap_or(TapeFilter::Any);
            let (signal_tx, signal_rx) = channel::unbounded();
            let worker = Worker {
                drive,
                ctx: WorkerContext {
                    worker: worker_id.clone(),
                    ledger: self.ledger.try_clone()?,
                    filter,
                    policy,
                    settings: self.config.coordinator.clone(),
                    allocator: Allocator::new(SparePool::new(self.config.spare_tapes.clone())),
                    control: Control {
                        signals: signal_rx,
                        cancel: cancel.clone(),
                        draining: false,
                    },
                    events: event_tx.clone(),
                    stop_when_idle,
                    summary: RunSummary::default(),
                },
            };
            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker.run())?;
            info!("Started worker {}", worker_id);
            workers.push((worker_id, handle));
            signals.push(signal_tx);
        }

        Ok(CoordinatorHandle {
            workers,
            signals,
            cancel,
            events: event_rx,
        })
    }
}

/// Control surface of a running coordinator
///
/// Dropping the handle drains the workers and waits for them.
pub struct CoordinatorHandle {
    workers: Vec<(String, JoinHandle<Result<RunSummary>>)>,
    signals: Vec<Sender<Signal>>,
    cancel: CancellationToken,
    events: Receiver<WorkerEvent>,
}

impl CoordinatorHandle {
    /// Stop claiming new work; in-flight attempts run to completion
    pub fn drain(&self) {
        info!("Draining {} worker(s)", self.workers.len());
        self.broadcast(Signal::Drain);
    }

    /// Stop claiming and cancel in-flight copies between blocks
    pub fn cancel(&self) {
        warn!("Cancelling {} worker(s)", self.workers.len());
        self.cancel.cancel();
        self.broadcast(Signal::Cancel);
    }

    fn broadcast(&self, signal: Signal) {
        for tx in &self.signals {
            // A worker that already exited has dropped its receiver
            let _ = tx.send(signal);
        }
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Drain and wait for every worker
    pub fn join(mut self) -> Result<RunSummary> {
        self.drain();
        self.wait()
    }

    /// Wait for workers to stop on their own; the first fatal error wins
    fn wait(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut first_error = None;
        for (id, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(Ok(worker)) => summary.merge(&worker),
                Ok(Err(e)) => {
                    error!("Worker {} stopped with error: {}", id, e);
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    error!("Worker {} panicked", id);
                    first_error.get_or_insert(ArchiveError::FatalConfig(format!(
                        "worker {} panicked",
                        id
                    )));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.broadcast(Signal::Drain);
            let _ = self.wait();
        }
    }
}

/// Per-worker state other than the drive itself
struct WorkerContext {
    worker: String,
    ledger: Ledger,
    filter: TapeFilter,
    policy: RetryPolicy,
    settings: CoordinatorConfig,
    allocator: Allocator<SparePool>,
    control: Control,
    events: Sender<WorkerEvent>,
    stop_when_idle: bool,
    summary: RunSummary,
}

/// Receiving end of coordinator signals
struct Control {
    signals: Receiver<Signal>,
    cancel: CancellationToken,
    draining: bool,
}

impl Control {
    /// Poll for control signals; sticky once a stop was requested
    fn should_stop(&mut self) -> bool {
        if !self.draining {
            match self.signals.try_recv() {
                Ok(Signal::Drain) | Ok(Signal::Cancel) => self.draining = true,
                Err(TryRecvError::Disconnected) => self.draining = true,
                Err(TryRecvError::Empty) => {}
            }
        }
        self.draining || self.cancel.is_cancelled()
    }

    /// Sleep for `interval`, waking early on a control signal
    fn pause(&mut self, interval: std::time::Duration) {
        match self.signals.recv_timeout(interval) {
            Ok(Signal::Drain) | Ok(Signal::Cancel) => self.draining = true,
            Err(RecvTimeoutError::Disconnected) => self.draining = true,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

struct Worker {
    drive: Box<dyn TapeDrive>,
    ctx: WorkerContext,
}

impl Worker {
    fn run(mut self) -> Result<RunSummary> {
        self.ctx.emit(WorkerEvent::Started {
            worker: self.ctx.worker.clone(),
        });
        let result = self.work();
        if let Err(e) = &result {
            self.ctx.report_error(e);
        }
        // Nothing may stay claimed or leased under this identity once the thread ends
        if let Err(e) = self.ctx.settle() {
            warn!(
                "Worker {} could not release its attempts on exit: {}",
                self.ctx.worker, e
            );
        }
        self.ctx.emit(WorkerEvent::Stopped {
            worker: self.ctx.worker.clone(),
            summary: self.ctx.summary,
        });
        info!("Worker {} stopped: {:?}", self.ctx.worker, self.ctx.summary);
        result.map(|_| self.ctx.summary)
    }

    fn work(&mut self) -> Result<()> {
        let mut carry: Option<ArchiveAttempt> = None;
        let mut unsettled = false;
        loop {
            if self.ctx.control.should_stop() {
                if let Some(attempt) = carry.take() {
                    self.ctx.abandon_unstarted(&attempt, FailureReason::Cancelled, "worker draining")?;
                }
                return Ok(());
            }

            // An error may have left an attempt claimed that nothing will finish
            if unsettled {
                match self.ctx.settle() {
                    Ok(()) => unsettled = false,
                    Err(e) if e.class() == ErrorClass::Transient => {
                        warn!("Worker {} could not settle yet: {}", self.ctx.worker, e);
                        self.ctx.report_error(&e);
                        self.ctx.pause();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let step = match carry.take() {
                Some(attempt) => self.serve_tape(attempt),
                None => match self.ctx.claim(None) {
                    Ok(Some(attempt)) => self.serve_tape(attempt),
                    Ok(None) => match self.ctx.idle() {
                        Ok(true) => Ok(None),
                        Ok(false) => return Ok(()),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                },
            };

            match step {
                Ok(next) => carry = next,
                Err(e) if e.class() == ErrorClass::Transient => {
                    warn!("Worker {} hit a transient error: {}", self.ctx.worker, e);
                    self.ctx.report_error(&e);
                    unsettled = true;
                    self.ctx.pause();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mount a tape and work through its attempts
    ///
    /// Returns an already claimed attempt on a different tape, if the
    /// session ended because the next claimable work lives elsewhere. The
    /// tape is unmounted and its lease dropped however the session ends.
    fn serve_tape(&mut self, first: ArchiveAttempt) -> Result<Option<ArchiveAttempt>> {
        let barcode = first.tape.clone();
        let ctx = &mut self.ctx;
        let mut tape = match MountedTape::mount(self.drive.as_mut(), &barcode) {
            Ok(tape) => tape,
            Err(e) => {
                let recorded = ctx.mount_failed(&first, &e);
                let released = ctx.ledger.release_tape(&barcode, &ctx.worker);
                recorded?;
                released?;
                return Ok(None);
            }
        };

        let session = ctx.session(&mut tape, first);

        if let Err(e) = tape.release() {
            warn!("Worker {} could not unmount {}: {}", ctx.worker, barcode, e);
        }
        let released = ctx.ledger.release_tape(&barcode, &ctx.worker);
        if let Err(e) = &released {
            warn!(
                "Worker {} could not release its lease on {}: {}",
                ctx.worker, barcode, e
            );
        }
        let carry = session?;
        released?;
        debug!("Worker {} released tape {}", ctx.worker, barcode);
        Ok(carry)
    }
}

impl WorkerContext {
    /// Run attempts on a mounted tape until the next one lives elsewhere
    fn session(
        &mut self,
        tape: &mut MountedTape<'_>,
        first: ArchiveAttempt,
    ) -> Result<Option<ArchiveAttempt>> {
        let barcode = tape.barcode().to_string();
        self.ledger.record_mount(&barcode, &self.worker)?;
        info!("Worker {} mounted tape {}", self.worker, barcode);

        let machine = ArchiveStateMachine::new(&self.ledger, self.policy, self.settings.block_size);
        let mut next = Some(first);
        while let Some(attempt) = next.take() {
            if attempt.tape != barcode {
                return Ok(Some(attempt));
            }
            let outcome = machine.run(&attempt, tape, &self.control.cancel)?;
            self.summary.record(&outcome);
            let _ = self.events.send(WorkerEvent::Finished {
                worker: self.worker.clone(),
                attempt: attempt.id,
                outcome,
            });
            if self.control.should_stop() {
                break;
            }
            next = self
                .ledger
                .claim_next(&self.worker, &self.filter, Some(&barcode))?;
        }
        Ok(None)
    }

    /// Fail whatever this worker still holds and drop its leases
    ///
    /// Covers attempts whose failure could not be recorded because the
    /// ledger itself was unavailable; they are retried without counting.
    fn settle(&mut self) -> Result<()> {
        let report = Recovery::new(&self.ledger, self.policy).release_workers(
            std::slice::from_ref(&self.worker),
            FailureReason::LedgerUnavailable,
        )?;
        if !report.is_empty() {
            info!(
                "Worker {} released {} attempt(s) and {} lease(s) left by an error",
                self.worker,
                report.failed.len(),
                report.leases_released
            );
            self.emit(WorkerEvent::Recovered {
                worker: self.worker.clone(),
                report,
            });
        }
        Ok(())
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn report_error(&self, e: &ArchiveError) {
        self.emit(WorkerEvent::Error {
            worker: self.worker.clone(),
            class: e.class(),
            message: e.to_string(),
        });
    }

    fn claim(&self, prefer: Option<&str>) -> Result<Option<ArchiveAttempt>> {
        self.ledger.claim_next(&self.worker, &self.filter, prefer)
    }

    fn mount_failed(&mut self, attempt: &ArchiveAttempt, e: &DriveError) -> Result<()> {
        warn!(
            "Worker {} could not mount tape {}: {}",
            self.worker, attempt.tape, e
        );
        let outcome = self.ledger.fail_attempt(
            attempt.id,
            AttemptStatus::Copying,
            e.failure_reason(),
            &e.to_string(),
            &self.policy,
        )?;
        let outcome = AttemptOutcome::Failed {
            reason: e.failure_reason(),
            outcome,
        };
        self.summary.record(&outcome);
        self.emit(WorkerEvent::Finished {
            worker: self.worker.clone(),
            attempt: attempt.id,
            outcome,
        });
        Ok(())
    }

    /// Give back an attempt claimed but never started
    fn abandon_unstarted(
        &mut self,
        attempt: &ArchiveAttempt,
        reason: FailureReason,
        detail: &str,
    ) -> Result<()> {
        self.ledger.fail_attempt(
            attempt.id,
            AttemptStatus::Copying,
            reason,
            detail,
            &self.policy,
        )?;
        self.ledger.release_tape(&attempt.tape, &self.worker)?;
        Ok(())
    }

    /// Housekeeping when nothing is claimable; `false` ends the worker
    fn idle(&mut self) -> Result<bool> {
        let report = self.allocator.run_pruned(&self.ledger)?;
        let assigned = !report.assigned.is_empty();
        if !report.is_noop() {
            self.emit(WorkerEvent::Allocated {
                worker: self.worker.clone(),
                report,
            });
        }

        let recovered = Recovery::new(&self.ledger, self.policy)
            .recover_abandoned(Utc::now(), self.settings.attempt_timeout())?;
        let recovered_any = !recovered.retried.is_empty() || recovered.requeued > 0;
        if !recovered.is_empty() {
            self.emit(WorkerEvent::Recovered {
                worker: self.worker.clone(),
                report: recovered,
            });
        }

        if self.stop_when_idle {
            if assigned || recovered_any {
                return Ok(true);
            }
            debug!("Worker {} found no more work", self.worker);
            return Ok(false);
        }
        if !assigned && !recovered_any {
            self.pause();
        }
        Ok(true)
    }

    fn pause(&mut self) {
        self.control.pause(self.settings.poll_interval());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::memory::{MemoryTapeDrive, MemoryTapeLibrary};
    use crate::drive::{DriveResult, TapeCapacity, TapeHandle};
    use crate::model::{FileStatus, NewFile, NewTape};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Memory drive that calls `hook` with the write count before each write
    struct HookedDrive {
        inner: MemoryTapeDrive,
        writes: usize,
        hook: Box<dyn FnMut(usize) + Send>,
    }

    impl HookedDrive {
        fn new(inner: MemoryTapeDrive, hook: impl FnMut(usize) + Send + 'static) -> Self {
            HookedDrive {
                inner,
                writes: 0,
                hook: Box::new(hook),
            }
        }
    }

    impl TapeDrive for HookedDrive {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn mount(&mut self, tape: &str) -> DriveResult<TapeHandle> {
            self.inner.mount(tape)
        }

        fn position(&mut self, handle: &TapeHandle) -> DriveResult<u64> {
            self.inner.position(handle)
        }

        fn write(&mut self, handle: &TapeHandle, bytes: &[u8]) -> DriveResult<usize> {
            self.writes += 1;
            (self.hook)(self.writes);
            self.inner.write(handle, bytes)
        }

        fn read(&mut self, handle: &TapeHandle, offset: u64, len: usize) -> DriveResult<Vec<u8>> {
            self.inner.read(handle, offset, len)
        }

        fn unmount(&mut self, handle: TapeHandle) -> DriveResult<()> {
            self.inner.unmount(handle)
        }

        fn capacity(&mut self, tape: &str) -> DriveResult<TapeCapacity> {
            self.inner.capacity(tape)
        }
    }

    /// A drive that stops on its second write until the test lets it go
    fn gated_drive(library: &MemoryTapeLibrary) -> (HookedDrive, Receiver<()>, Sender<()>) {
        let (reached_tx, reached_rx) = channel::bounded(1);
        let (go_tx, go_rx) = channel::bounded::<()>(1);
        let drive = HookedDrive::new(library.drive("st0"), move |n| {
            if n == 2 {
                let _ = reached_tx.send(());
                let _ = go_rx.recv();
            }
        });
        (drive, reached_rx, go_tx)
    }

    /// Start a coordinator on one staged 4 KiB file and wait until it is mid-copy
    fn copying(
        dir: &TempDir,
        ledger: &Ledger,
        library: &MemoryTapeLibrary,
    ) -> (CoordinatorHandle, Sender<()>) {
        library.insert_tape("T1", 100_000);
        ledger.register_tape(NewTape::new("T1", 100_000)).unwrap();
        stage(ledger, dir, "big.uvh5", 4096);

        let (drive, reached, go) = gated_drive(library);
        let drives: Vec<Box<dyn TapeDrive>> = vec![Box::new(drive)];
        let handle = Coordinator::new(ledger, config(dir), drives)
            .unwrap()
            .start()
            .unwrap();
        reached.recv_timeout(Duration::from_secs(10)).unwrap();
        (handle, go)
    }

    fn config(dir: &TempDir) -> ArchiveConfig {
        let mut config = ArchiveConfig::new(dir.path().join("ledger.db"));
        config.ledger.min_tape_capacity = 1;
        config.allocation.capacity_margin_ratio = 0.0;
        config.coordinator.host_id = "test".into();
        config.coordinator.poll_interval_ms = 10;
        config.coordinator.block_size = 512;
        config
    }

    fn stage(ledger: &Ledger, dir: &TempDir, name: &str, len: usize) {
        let path = dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();
        ledger
            .stage_file(NewFile::new(path.to_string_lossy(), len as u64))
            .unwrap();
    }

    #[test]
    fn test_requires_drives() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let ledger = Ledger::open(&config).unwrap();
        assert!(matches!(
            Coordinator::new(&ledger, config, Vec::new()),
            Err(ArchiveError::FatalConfig(_))
        ));
    }

    #[test]
    fn test_run_until_idle_archives_everything() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let ledger = Ledger::open(&config).unwrap();
        let library = MemoryTapeLibrary::new();
        for barcode in ["T1", "T2"] {
            library.insert_tape(barcode, 10_000);
            ledger.register_tape(NewTape::new(barcode, 10_000)).unwrap();
        }
        for i in 0..6 {
            stage(&ledger, &dir, &format!("f{}.uvh5", i), 1_000 + i * 100);
        }

        let drives: Vec<Box<dyn TapeDrive>> =
            vec![Box::new(library.drive("st0")), Box::new(library.drive("st1"))];
        let summary = Coordinator::new(&ledger, config, drives)
            .unwrap()
            .run_until_idle()
            .unwrap();
        assert_eq!(summary.verified, 6);
        assert_eq!(ledger.files_by_status(FileStatus::Archived).unwrap().len(), 6);
        assert!(ledger.open_attempts().unwrap().is_empty());
        assert!(!library.is_mounted("T1"));
        assert!(!library.is_mounted("T2"));
        assert!(ledger.tapes().unwrap().iter().all(|t| t.mounted_by.is_none()));
    }

    #[test]
    fn test_drain_stops_started_coordinator() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let ledger = Ledger::open(&config).unwrap();
        let library = MemoryTapeLibrary::new();
        let drives: Vec<Box<dyn TapeDrive>> = vec![Box::new(library.drive("st0"))];

        let handle = Coordinator::new(&ledger, config, drives).unwrap().start().unwrap();
        assert_eq!(handle.worker_ids(), vec!["test/st0".to_string()]);
        assert!(matches!(
            handle.events().recv().unwrap(),
            WorkerEvent::Started { .. }
        ));
        let summary = handle.join().unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[test]
    fn test_cancel_mid_copy_leaves_nothing_in_flight() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&config(&dir)).unwrap();
        let library = MemoryTapeLibrary::new();
        let (handle, go) = copying(&dir, &ledger, &library);

        handle.cancel();
        go.send(()).unwrap();
        let summary = handle.join().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.verified, 0);

        let file = &ledger.files_by_status(FileStatus::Allocated).unwrap()[0];
        let attempts = ledger.attempts_for_file(file.id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[0].failure_reason, Some(FailureReason::Cancelled));
        assert_eq!(attempts[1].status, AttemptStatus::Pending);
        assert!(attempts[1].claimed_by.is_none());
        assert_eq!(file.failure_count, 0);

        let tape = ledger.tape("T1").unwrap().unwrap();
        assert!(tape.mounted_by.is_none());
        assert!(!library.is_mounted("T1"));
    }

    #[test]
    fn test_drain_mid_copy_finishes_the_attempt() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&config(&dir)).unwrap();
        let library = MemoryTapeLibrary::new();
        let (handle, go) = copying(&dir, &ledger, &library);

        handle.drain();
        go.send(()).unwrap();
        let summary = handle.join().unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.failed, 0);

        let archived = ledger.files_by_status(FileStatus::Archived).unwrap();
        assert_eq!(archived.len(), 1);
        let attempts = ledger.attempts_for_file(archived[0].id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Verified);
        assert!(ledger.open_attempts().unwrap().is_empty());
        assert!(ledger.tape("T1").unwrap().unwrap().mounted_by.is_none());
        assert!(!library.is_mounted("T1"));
    }

    #[test]
    fn test_busy_ledger_mid_copy_is_settled_and_retried() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.ledger.busy_timeout_ms = 1;
        let ledger = Ledger::open(&config).unwrap();
        let library = MemoryTapeLibrary::new();
        library.insert_tape("T1", 100_000);
        ledger.register_tape(NewTape::new("T1", 100_000)).unwrap();
        stage(&ledger, &dir, "busy.uvh5", 2048);

        // On the first write another process grabs the write lock for a while
        let db = config.ledger.path.clone();
        let drive = HookedDrive::new(library.drive("st0"), move |n| {
            if n != 1 {
                return;
            }
            let (locked_tx, locked_rx) = channel::bounded(1);
            let db = db.clone();
            thread::spawn(move || {
                let conn = rusqlite::Connection::open(&db).unwrap();
                conn.busy_timeout(Duration::from_secs(5)).unwrap();
                conn.execute_batch("BEGIN IMMEDIATE").unwrap();
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
                conn.execute_batch("ROLLBACK").unwrap();
            });
            let _ = locked_rx.recv();
        });

        let drives: Vec<Box<dyn TapeDrive>> = vec![Box::new(drive)];
        let summary = Coordinator::new(&ledger, config, drives)
            .unwrap()
            .run_until_idle()
            .unwrap();
        assert_eq!(summary.verified, 1);

        let archived = ledger.files_by_status(FileStatus::Archived).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].failure_count, 0);
        let attempts = ledger.attempts_for_file(archived[0].id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(
            attempts[0].failure_reason,
            Some(FailureReason::LedgerUnavailable)
        );
        assert_eq!(attempts[1].status, AttemptStatus::Verified);
        assert!(ledger.open_attempts().unwrap().is_empty());
        assert!(ledger.tapes().unwrap().iter().all(|t| t.mounted_by.is_none()));
        assert!(!library.is_mounted("T1"));
    }
}
