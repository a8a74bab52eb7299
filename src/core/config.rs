//! Archive configuration
//!
//! Loaded from TOML and validated before anything touches the ledger:
//!
//! ```toml
//! [ledger]
//! path = "/var/lib/tapeledger/ledger.db"
//!
//! [allocation]
//! capacity_margin_ratio = 0.01
//!
//! [retry]
//! max_retries = 3
//! max_integrity_retries = 1
//!
//! [coordinator]
//! attempt_timeout_secs = 21600
//!
//! [[drives]]
//! id = "st0"
//! library = "/srv/tapes"
//!
//! [[spare_tapes]]
//! barcode = "HERA_07"
//! capacity = 18000000000000
//! ```

use crate::error::{ArchiveError, Result};
use crate::model::NewTape;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

/// Smallest tape accepted at registration (1 TB)
pub const DEFAULT_MIN_TAPE_CAPACITY: u64 = 1_000_000_000_000;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ArchiveConfig {
    #[validate(nested)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub allocation: AllocationConfig,

    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    #[validate(nested)]
    pub drives: Vec<DriveConfig>,

    #[serde(default)]
    pub spare_tapes: Vec<NewTape>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LedgerConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// How long a writer waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    #[validate(range(min = 1))]
    pub busy_timeout_ms: u64,

    /// Registration floor for tape capacity
    #[serde(default = "default_min_tape_capacity")]
    pub min_tape_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AllocationConfig {
    /// Fraction of each tape's capacity withheld for format overhead
    #[serde(default = "default_capacity_margin_ratio")]
    #[validate(range(min = 0.0, max = 0.5))]
    pub capacity_margin_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Counted failures tolerated before a file is permanently failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Digest mismatches tolerated before a file is permanently failed
    #[serde(default = "default_max_integrity_retries")]
    pub max_integrity_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CoordinatorConfig {
    /// Prefix of every worker identity; must be stable across restarts
    #[serde(default = "default_host_id")]
    #[validate(length(min = 1))]
    pub host_id: String,

    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Wall-clock budget before an in-flight attempt counts as abandoned
    #[serde(default = "default_attempt_timeout_secs")]
    #[validate(range(min = 1))]
    pub attempt_timeout_secs: u64,

    /// Bytes per write/read call to the drive
    #[serde(default = "default_block_size")]
    #[validate(range(min = 512))]
    pub block_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DriveConfig {
    #[validate(length(min = 1))]
    pub id: String,

    /// Directory holding tape images for the file-backed drive
    pub library: PathBuf,

    /// Barcodes this drive may serve; absent means any tape
    #[serde(default)]
    pub tapes: Option<Vec<String>>,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_min_tape_capacity() -> u64 {
    DEFAULT_MIN_TAPE_CAPACITY
}

fn default_capacity_margin_ratio() -> f64 {
    0.01
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_integrity_retries() -> u32 {
    1
}

fn default_host_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_attempt_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_block_size() -> usize {
    1024 * 1024
}

impl LedgerConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        LedgerConfig {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            min_tape_capacity: default_min_tape_capacity(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig {
            capacity_margin_ratio: default_capacity_margin_ratio(),
        }
    }
}

impl AllocationConfig {
    /// Bytes withheld on a tape of the given capacity
    pub fn margin_for(&self, capacity: u64) -> u64 {
        (capacity as f64 * self.capacity_margin_ratio).ceil() as u64
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: default_max_retries(),
            max_integrity_retries: default_max_integrity_retries(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            host_id: default_host_id(),
            poll_interval_ms: default_poll_interval_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            block_size: default_block_size(),
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Ledger identity of the worker driving `drive_id` on this host
    pub fn worker_id(&self, drive_id: &str) -> String {
        format!("{}/{}", self.host_id, drive_id)
    }
}

impl ArchiveConfig {
    /// Configuration with defaults everywhere except the ledger path
    pub fn new<P: Into<PathBuf>>(ledger_path: P) -> Self {
        ArchiveConfig {
            ledger: LedgerConfig::new(ledger_path),
            allocation: AllocationConfig::default(),
            retry: RetryConfig::default(),
            coordinator: CoordinatorConfig::default(),
            drives: Vec::new(),
            spare_tapes: Vec::new(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ArchiveConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ArchiveError::FatalConfig(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Fail fast when there is nothing to drive tapes with
    pub fn require_drives(&self) -> Result<&[DriveConfig]> {
        if self.drives.is_empty() {
            return Err(ArchiveError::FatalConfig(
                "no tape drives configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for drive in &self.drives {
            if !seen.insert(drive.id.as_str()) {
                return Err(ArchiveError::FatalConfig(format!(
                    "drive id '{}' is configured twice",
                    drive.id
                )));
            }
        }
        Ok(&self.drives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [ledger]
        path = "/tmp/ledger.db"
        min_tape_capacity = 1000

        [allocation]
        capacity_margin_ratio = 0.02

        [retry]
        max_retries = 5

        [coordinator]
        host_id = "archiver-1"
        block_size = 4096

        [[drives]]
        id = "st0"
        library = "/srv/tapes"

        [[drives]]
        id = "st1"
        library = "/srv/tapes"
        tapes = ["HERA_01"]

        [[spare_tapes]]
        barcode = "HERA_09"
        capacity = 8000000000000
        tape_type = "LTO-8"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ArchiveConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.ledger.min_tape_capacity, 1000);
        assert_eq!(config.ledger.busy_timeout_ms, 5_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_integrity_retries, 1);
        assert_eq!(config.coordinator.worker_id("st0"), "archiver-1/st0");
        assert_eq!(config.drives.len(), 2);
        assert_eq!(config.drives[1].tapes.as_deref(), Some(&["HERA_01".to_string()][..]));
        assert_eq!(config.spare_tapes[0].tape_type.as_deref(), Some("LTO-8"));
        assert!(config.require_drives().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = ArchiveConfig::from_toml_str("[ledger]\npath = \"l.db\"\n").unwrap();
        assert_eq!(config.ledger.min_tape_capacity, DEFAULT_MIN_TAPE_CAPACITY);
        assert_eq!(config.allocation.capacity_margin_ratio, 0.01);
        assert_eq!(config.coordinator.block_size, 1024 * 1024);
        assert!(matches!(
            config.require_drives(),
            Err(ArchiveError::FatalConfig(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_margin() {
        let text = "[ledger]\npath = \"l.db\"\n[allocation]\ncapacity_margin_ratio = 0.9\n";
        assert!(matches!(
            ArchiveConfig::from_toml_str(text),
            Err(ArchiveError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_duplicate_drive_ids() {
        let mut config = ArchiveConfig::new("l.db");
        for _ in 0..2 {
            config.drives.push(DriveConfig {
                id: "st0".into(),
                library: "/srv".into(),
                tapes: None,
            });
        }
        assert!(config.require_drives().is_err());
    }

    #[test]
    fn test_margin() {
        let alloc = AllocationConfig {
            capacity_margin_ratio: 0.01,
        };
        assert_eq!(alloc.margin_for(1000), 10);
        assert_eq!(alloc.margin_for(0), 0);
    }
}
