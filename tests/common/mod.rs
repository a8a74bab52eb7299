//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use tapeledger_rs::{ArchiveConfig, FileRecord, Ledger, NewFile};
use tempfile::TempDir;

/// A scratch ledger with a staging directory next to it
pub struct Scratch {
    pub dir: TempDir,
    pub config: ArchiveConfig,
    pub ledger: Ledger,
}

impl Scratch {
    pub fn new() -> Self {
        Self::with_margin(0.0)
    }

    /// Scratch ledger withholding `ratio` of every tape
    pub fn with_margin(ratio: f64) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.allocation.capacity_margin_ratio = ratio;
        std::fs::create_dir_all(dir.path().join("staging")).unwrap();
        let ledger = Ledger::open(&config).unwrap();
        Scratch { dir, config, ledger }
    }

    pub fn staging(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    /// Write `contents` to the staging area and stage it
    pub fn stage(&self, name: &str, contents: &[u8]) -> FileRecord {
        let path = self.staging().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents)
            .unwrap();
        self.ledger
            .stage_file(NewFile::new(path.to_string_lossy(), contents.len() as u64))
            .unwrap()
    }

    /// Stage a file that only exists in the ledger
    pub fn stage_virtual(&self, name: &str, size: u64) -> FileRecord {
        let path = self.staging().join(name);
        self.ledger
            .stage_file(NewFile::new(path.to_string_lossy(), size))
            .unwrap()
    }
}

/// Small tapes, no margin, fast polling
pub fn test_config(dir: &TempDir) -> ArchiveConfig {
    let mut config = ArchiveConfig::new(dir.path().join("ledger.db"));
    config.ledger.min_tape_capacity = 1;
    config.allocation.capacity_margin_ratio = 0.0;
    config.coordinator.host_id = "itest".into();
    config.coordinator.poll_interval_ms = 5;
    config.coordinator.block_size = 512;
    config
}

/// Deterministic file body
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
