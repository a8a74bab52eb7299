//! Allocation against realistic tape inventories

mod common;

use common::Scratch;
use tapeledger_rs::{Allocator, ArchiveError, FileStatus, NewTape};

const GIB: u64 = 1 << 30;

#[test]
fn test_oversized_file_waits_for_a_big_enough_tape() {
    let scratch = Scratch::new();
    for barcode in ["HERA_01", "HERA_02"] {
        scratch
            .ledger
            .register_tape(NewTape::new(barcode, 6 * GIB))
            .unwrap();
    }
    let file = scratch.stage_virtual("huge.uvh5", 10 * GIB);

    let mut allocator = Allocator::without_spares();
    let report = allocator.run(&scratch.ledger).unwrap();
    assert!(report.assigned.is_empty());
    assert_eq!(report.deferred.len(), 1);
    assert!(matches!(
        report.deferred[0].to_error(),
        ArchiveError::NoCapacity { size, .. } if size == 10 * GIB
    ));
    // The file is never split across tapes
    assert!(scratch.ledger.open_attempts().unwrap().is_empty());
    assert_eq!(
        scratch.ledger.file(file.id).unwrap().status,
        FileStatus::Pending
    );

    scratch
        .ledger
        .register_tape(NewTape::new("HERA_03", 12 * GIB))
        .unwrap();
    let report = allocator.run(&scratch.ledger).unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].tape, "HERA_03");
    assert!(report.deferred.is_empty());
    assert_eq!(
        scratch.ledger.file(file.id).unwrap().status,
        FileStatus::Allocated
    );
}

#[test]
fn test_spare_registered_on_demand() {
    let scratch = Scratch::new();
    scratch
        .ledger
        .register_tape(NewTape::new("HERA_01", 6 * GIB))
        .unwrap();
    scratch.stage_virtual("huge.uvh5", 10 * GIB);

    let mut allocator = Allocator::with_spares(vec![
        NewTape::new("SPARE_SMALL", 8 * GIB),
        NewTape::new("SPARE_BIG", 12 * GIB),
    ]);
    let report = allocator.run_pruned(&scratch.ledger).unwrap();
    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.registered[0].barcode, "SPARE_BIG");
    assert_eq!(report.assigned[0].tape, "SPARE_BIG");
    assert_eq!(allocator.source().len(), 1);
}

#[test]
fn test_margin_is_withheld() {
    // 1% of 100_000 bytes is held back
    let scratch = Scratch::with_margin(0.01);
    scratch
        .ledger
        .register_tape(NewTape::new("HERA_01", 100_000))
        .unwrap();
    scratch.stage_virtual("too_big.uvh5", 99_001);

    let mut allocator = Allocator::without_spares();
    let report = allocator.run(&scratch.ledger).unwrap();
    assert_eq!(report.deferred.len(), 1);

    scratch.stage_virtual("just_fits.uvh5", 99_000);
    let report = allocator.run(&scratch.ledger).unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.deferred[0].name, "too_big.uvh5");
}

#[test]
fn test_reservations_count_against_free_space() {
    let scratch = Scratch::new();
    scratch
        .ledger
        .register_tape(NewTape::new("HERA_01", 10_000))
        .unwrap();
    let mut allocator = Allocator::without_spares();

    scratch.stage_virtual("a.uvh5", 6_000);
    assert_eq!(allocator.run(&scratch.ledger).unwrap().assigned.len(), 1);

    // Nothing is on the media yet, but 6_000 bytes are promised
    scratch.stage_virtual("b.uvh5", 6_000);
    let report = allocator.run(&scratch.ledger).unwrap();
    assert!(report.assigned.is_empty());
    assert_eq!(report.deferred.len(), 1);

    scratch.stage_virtual("c.uvh5", 4_000);
    let report = allocator.run(&scratch.ledger).unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(
        scratch
            .ledger
            .pending_attempts_for_tape("HERA_01")
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn test_best_fit_prefers_tightest_tape() {
    let scratch = Scratch::new();
    for (barcode, capacity) in [("HERA_01", 50_000), ("HERA_02", 3_000), ("HERA_03", 8_000)] {
        scratch
            .ledger
            .register_tape(NewTape::new(barcode, capacity))
            .unwrap();
    }
    scratch.stage_virtual("mid.uvh5", 2_500);

    let report = Allocator::without_spares().run(&scratch.ledger).unwrap();
    assert_eq!(report.assigned[0].tape, "HERA_02");
}

#[test]
fn test_empty_pass_changes_nothing() {
    let scratch = Scratch::new();
    scratch
        .ledger
        .register_tape(NewTape::new("HERA_01", 10_000))
        .unwrap();
    let before = scratch.ledger.stats().unwrap();
    let report = Allocator::without_spares().run(&scratch.ledger).unwrap();
    assert!(report.is_noop());
    assert!(report.deferred.is_empty());
    assert_eq!(scratch.ledger.stats().unwrap(), before);
}
