//! Best-fit bin packing of files onto tapes
//!
//! Files are placed largest first. Each goes to the tape whose allocatable
//! space is the smallest that still holds it; ties go to the oldest tape.
//! This keeps large holes open for large files and fills older media first.

/// A file waiting for a tape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDemand {
    pub file_id: i64,
    pub size: u64,
}

/// A tape's allocatable space, after reservations and the safety margin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeBin {
    pub tape_id: i64,
    pub free: u64,
}

/// Result of a planning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    /// `(file_id, tape_id)` in placement order
    pub assignments: Vec<(i64, i64)>,
    /// Files no tape could hold, largest first
    pub unplaced: Vec<FileDemand>,
}

/// Incremental best-fit packer
#[derive(Debug, Clone, Default)]
pub struct BestFit {
    bins: Vec<TapeBin>,
}

impl BestFit {
    pub fn new(bins: Vec<TapeBin>) -> Self {
        BestFit { bins }
    }

    pub fn add_bin(&mut self, bin: TapeBin) {
        self.bins.push(bin);
    }

    pub fn bins(&self) -> &[TapeBin] {
        &self.bins
    }

    /// Place `size` bytes, returning the chosen tape
    pub fn place(&mut self, size: u64) -> Option<i64> {
        let bin = self
            .bins
            .iter_mut()
            .filter(|bin| bin.free >= size)
            .min_by_key(|bin| (bin.free, bin.tape_id))?;
        bin.free -= size;
        Some(bin.tape_id)
    }
}

/// Largest first, then by id for a stable order
pub fn placement_order(files: &mut [FileDemand]) {
    files.sort_by(|a, b| b.size.cmp(&a.size).then(a.file_id.cmp(&b.file_id)));
}

/// Plan placements without touching the ledger
pub fn plan_allocation(files: &[FileDemand], bins: Vec<TapeBin>) -> AllocationPlan {
    let mut ordered = files.to_vec();
    placement_order(&mut ordered);

    let mut packer = BestFit::new(bins);
    let mut plan = AllocationPlan::default();
    for file in ordered {
        match packer.place(file.size) {
            Some(tape_id) => plan.assignments.push((file.file_id, tape_id)),
            None => plan.unplaced.push(file),
        }
    }
    plan
}
