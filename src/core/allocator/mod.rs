//! Allocation of pending files onto tapes
//!
//! An allocation pass reads every `pending` file and every `available`
//! tape inside one IMMEDIATE transaction, packs files with [`BestFit`],
//! and opens a `pending` attempt per placement. Files that fit nowhere may
//! pull a blank cartridge from a [`TapeSource`]; if none is available they
//! are deferred to the next pass.
//!
//! A tape's allocatable space is its unwritten capacity, minus the sizes of
//! attempts already promised to it (`pending` or `copying`), minus the
//! safety margin. Running a pass with nothing pending changes nothing.

pub mod best_fit;

pub use best_fit::{plan_allocation, AllocationPlan, BestFit, FileDemand, TapeBin};

use crate::config::AllocationConfig;
use crate::error::{ArchiveError, Result};
use crate::ledger::{Ledger, LedgerTx};
use crate::model::{ArchiveAttempt, FileRecord, NewTape, TapeRecord};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Supplier of blank cartridges that may be registered on demand
pub trait TapeSource: Send {
    /// Hand out a blank tape able to hold `size` bytes after its margin
    fn take_spare(&mut self, size: u64, allocation: &AllocationConfig) -> Option<NewTape>;
}

/// No cartridges beyond the ones already registered
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSpareTapes;

impl TapeSource for NoSpareTapes {
    fn take_spare(&mut self, _size: u64, _allocation: &AllocationConfig) -> Option<NewTape> {
        None
    }
}

/// Blank cartridges listed in configuration
#[derive(Debug, Clone, Default)]
pub struct SparePool {
    spares: Vec<NewTape>,
}

impl SparePool {
    pub fn new(spares: Vec<NewTape>) -> Self {
        SparePool { spares }
    }

    pub fn len(&self) -> usize {
        self.spares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spares.is_empty()
    }

    /// Forget spares already known to the ledger
    fn prune(&mut self, tx: &LedgerTx<'_>) -> Result<()> {
        let mut keep = Vec::with_capacity(self.spares.len());
        for spare in self.spares.drain(..) {
            if tx.tape_exists(&spare.barcode)? {
                debug!("Spare {} is already registered", spare.barcode);
            } else {
                keep.push(spare);
            }
        }
        self.spares = keep;
        Ok(())
    }
}

impl TapeSource for SparePool {
    fn take_spare(&mut self, size: u64, allocation: &AllocationConfig) -> Option<NewTape> {
        // Smallest spare that fits, so big blanks stay available for big files
        let idx = self
            .spares
            .iter()
            .enumerate()
            .filter(|(_, spare)| {
                spare
                    .capacity
                    .saturating_sub(allocation.margin_for(spare.capacity))
                    >= size
            })
            .min_by_key(|(idx, spare)| (spare.capacity, *idx))
            .map(|(idx, _)| idx)?;
        Some(self.spares.remove(idx))
    }
}

/// A file left without a tape in this pass
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredFile {
    pub file_id: i64,
    pub name: String,
    pub size: u64,
}

impl DeferredFile {
    pub fn to_error(&self) -> ArchiveError {
        ArchiveError::NoCapacity {
            file: self.name.clone(),
            size: self.size,
        }
    }
}

/// What an allocation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationReport {
    pub assigned: Vec<ArchiveAttempt>,
    pub registered: Vec<TapeRecord>,
    pub deferred: Vec<DeferredFile>,
}

impl AllocationReport {
    pub fn is_noop(&self) -> bool {
        self.assigned.is_empty() && self.registered.is_empty()
    }
}

/// Assigns pending files to tapes
pub struct Allocator<S: TapeSource = NoSpareTapes> {
    source: S,
}

impl Allocator<NoSpareTapes> {
    pub fn without_spares() -> Self {
        Allocator {
            source: NoSpareTapes,
        }
    }
}

impl Allocator<SparePool> {
    pub fn with_spares(spares: Vec<NewTape>) -> Self {
        Allocator {
            source: SparePool::new(spares),
        }
    }
}

impl<S: TapeSource> Allocator<S> {
    pub fn new(source: S) -> Self {
        Allocator { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run one allocation pass
    pub fn run(&mut self, ledger: &Ledger) -> Result<AllocationReport> {
        let allocation = ledger.allocation_config().clone();
        let source = &mut self.source;
        ledger.write(|tx| allocate_in(tx, source, &allocation))
    }
}

impl Allocator<SparePool> {
    /// Run a pass, first dropping spares another process already registered
    pub fn run_pruned(&mut self, ledger: &Ledger) -> Result<AllocationReport> {
        let allocation = ledger.allocation_config().clone();
        let source = &mut self.source;
        ledger.write(|tx| {
            source.prune(tx)?;
            allocate_in(tx, source, &allocation)
        })
    }
}

fn allocate_in<S: TapeSource>(
    tx: &LedgerTx<'_>,
    source: &mut S,
    allocation: &AllocationConfig,
) -> Result<AllocationReport> {
    let files = tx.pending_files()?;
    let mut report = AllocationReport::default();
    if files.is_empty() {
        return Ok(report);
    }

    let bins = tx
        .allocatable_tapes()?
        .iter()
        .map(|space| TapeBin {
            tape_id: space.tape.id,
            free: space.allocatable(tx.margin_for(space.tape.capacity)),
        })
        .collect();
    let mut packer = BestFit::new(bins);

    let by_id: HashMap<i64, &FileRecord> = files.iter().map(|f| (f.id, f)).collect();
    let mut demands: Vec<FileDemand> = files
        .iter()
        .map(|f| FileDemand {
            file_id: f.id,
            size: f.size,
        })
        .collect();
    best_fit::placement_order(&mut demands);

    for demand in demands {
        let tape_id = match packer.place(demand.size) {
            Some(tape_id) => Some(tape_id),
            None => register_spare(tx, source, allocation, demand.size, &mut packer, &mut report)?,
        };
        match tape_id {
            Some(tape_id) => {
                let attempt = tx.open_attempt(demand.file_id, tape_id)?;
                debug!(
                    "Assigned file #{} ({} bytes) to tape {}",
                    demand.file_id, demand.size, attempt.tape
                );
                report.assigned.push(attempt);
            }
            None => {
                let name = by_id
                    .get(&demand.file_id)
                    .map(|f| f.name.clone())
                    .unwrap_or_default();
                let deferred = DeferredFile {
                    file_id: demand.file_id,
                    name,
                    size: demand.size,
                };
                warn!("{}; deferring to the next allocation pass", deferred.to_error());
                report.deferred.push(deferred);
            }
        }
    }

    if !report.is_noop() || !report.deferred.is_empty() {
        info!(
            "Allocation pass: {} assigned, {} tape(s) registered, {} deferred",
            report.assigned.len(),
            report.registered.len(),
            report.deferred.len()
        );
    }
    Ok(report)
}

fn register_spare<S: TapeSource>(
    tx: &LedgerTx<'_>,
    source: &mut S,
    allocation: &AllocationConfig,
    size: u64,
    packer: &mut BestFit,
    report: &mut AllocationReport,
) -> Result<Option<i64>> {
    while let Some(spare) = source.take_spare(size, allocation) {
        let tape = match tx.register_tape(&spare) {
            Ok(tape) => tape,
            Err(ArchiveError::InvalidInput(reason)) => {
                warn!("Skipping spare tape {}: {}", spare.barcode, reason);
                continue;
            }
            Err(e) => return Err(e),
        };
        info!("Registered spare tape {} for a {} byte file", tape.barcode, size);
        packer.add_bin(TapeBin {
            tape_id: tape.id,
            free: tape
                .capacity
                .saturating_sub(tape.bytes_used)
                .saturating_sub(tx.margin_for(tape.capacity)),
        });
        report.registered.push(tape);
        return Ok(packer.place(size));
    }
    Ok(None)
}
