//! Retry budgets and escalation to permanent failure

mod common;

use common::{pattern, Scratch};
use tapeledger_rs::{
    ArchiveError, AttemptStatus, Coordinator, Digest, Fault, FailureReason, FileStatus,
    MemoryTapeLibrary, NewTape, TapeDrive, TapeStatus,
};

fn run_once(scratch: &Scratch, library: &MemoryTapeLibrary) {
    let drives: Vec<Box<dyn TapeDrive>> = vec![Box::new(library.drive("st0"))];
    Coordinator::new(&scratch.ledger, scratch.config.clone(), drives)
        .unwrap()
        .run_until_idle()
        .unwrap();
}

fn with_tape(capacity: u64) -> (Scratch, MemoryTapeLibrary) {
    let scratch = Scratch::new();
    let library = MemoryTapeLibrary::new();
    library.insert_tape("HERA_01", capacity);
    scratch
        .ledger
        .register_tape(NewTape::new("HERA_01", capacity))
        .unwrap();
    (scratch, library)
}

#[test]
fn test_single_mismatch_is_retried() {
    let (scratch, library) = with_tape(100_000);
    let body = pattern(2_000, 3);
    let file = scratch.stage("flaky.uvh5", &body);
    library.inject("HERA_01", Fault::CorruptRead);

    run_once(&scratch, &library);

    let file = scratch.ledger.file(file.id).unwrap();
    assert_eq!(file.status, FileStatus::Archived);
    assert_eq!(file.integrity_failures, 1);
    assert_eq!(file.last_failure, Some(FailureReason::DigestMismatch));

    let attempts = scratch.ledger.attempts_for_file(file.id).unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].failure_reason, Some(FailureReason::DigestMismatch));
    assert_eq!(attempts[1].status, AttemptStatus::Verified);
    assert_eq!(attempts[1].digest, Some(Digest::of(&body)));
}

#[test]
fn test_second_mismatch_escalates() {
    let (scratch, library) = with_tape(100_000);
    let file = scratch.stage("cursed.uvh5", &pattern(2_000, 4));
    library.inject("HERA_01", Fault::CorruptRead);
    library.inject("HERA_01", Fault::CorruptRead);

    run_once(&scratch, &library);

    let failed = scratch.ledger.file(file.id).unwrap();
    assert_eq!(failed.status, FileStatus::PermanentlyFailed);
    assert_eq!(failed.integrity_failures, 2);
    assert_eq!(failed.last_failure, Some(FailureReason::DigestMismatch));
    let attempts = scratch.ledger.attempts_for_file(file.id).unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));
    assert!(scratch.ledger.open_attempts().unwrap().is_empty());

    // An operator hands it a fresh budget; the media is healthy now
    let requeued = scratch.ledger.requeue_file("cursed.uvh5").unwrap();
    assert_eq!(requeued.status, FileStatus::Pending);
    assert_eq!(requeued.failure_count, 0);
    assert_eq!(requeued.integrity_failures, 0);

    run_once(&scratch, &library);
    let archived = scratch.ledger.file(file.id).unwrap();
    assert_eq!(archived.status, FileStatus::Archived);
    let attempts = scratch.ledger.attempts_for_file(file.id).unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].attempt_number, 3);
}

#[test]
fn test_transient_failures_exhaust_budget() {
    let (scratch, library) = with_tape(100_000);
    let file = scratch.stage("slow.uvh5", &pattern(1_000, 5));
    for _ in 0..4 {
        library.inject("HERA_01", Fault::WriteTimeout);
    }

    run_once(&scratch, &library);

    let file = scratch.ledger.file(file.id).unwrap();
    assert_eq!(file.status, FileStatus::PermanentlyFailed);
    assert_eq!(file.failure_count, 4);
    assert_eq!(file.integrity_failures, 0);
    assert_eq!(file.last_failure, Some(FailureReason::DriveTimeout));
    assert_eq!(scratch.ledger.attempts_for_file(file.id).unwrap().len(), 4);
}

#[test]
fn test_drive_fault_moves_file_to_another_tape() {
    let (scratch, library) = with_tape(100_000);
    library.insert_tape("HERA_02", 100_000);
    scratch
        .ledger
        .register_tape(NewTape::new("HERA_02", 100_000))
        .unwrap();
    let file = scratch.stage("moved.uvh5", &pattern(1_000, 6));
    library.inject("HERA_01", Fault::WriteFault);

    run_once(&scratch, &library);

    let file = scratch.ledger.file(file.id).unwrap();
    assert_eq!(file.status, FileStatus::Archived);
    assert_eq!(file.tape.as_deref(), Some("HERA_02"));
    assert_eq!(file.failure_count, 1);
    assert_eq!(
        scratch.ledger.tape("HERA_01").unwrap().unwrap().status,
        TapeStatus::Faulted
    );
}

#[test]
fn test_requeue_rejects_healthy_files() {
    let (scratch, _library) = with_tape(100_000);
    scratch.stage_virtual("fine.uvh5", 10);
    assert!(matches!(
        scratch.ledger.requeue_file("fine.uvh5"),
        Err(ArchiveError::InvalidInput(_))
    ));
    assert!(matches!(
        scratch.ledger.requeue_file("missing.uvh5"),
        Err(ArchiveError::NotFound(_))
    ));
}
