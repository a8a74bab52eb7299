//! Ledger schema bootstrap
//!
//! Full migrations are handled by external tooling; this module creates a
//! fresh schema and refuses to open a database written by a newer version.

use crate::error::{ArchiveError, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

/// Schema version written by this build
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tapes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    barcode TEXT NOT NULL UNIQUE,
    tape_type TEXT,
    capacity INTEGER NOT NULL CHECK (capacity > 0),
    bytes_used INTEGER NOT NULL DEFAULT 0 CHECK (bytes_used >= 0 AND bytes_used <= capacity),
    mount_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    purchase_date TEXT,
    mounted_by TEXT,
    leased_at INTEGER,
    registered_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    name TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL CHECK (size >= 0),
    digest TEXT,
    status TEXT NOT NULL,
    obsid INTEGER,
    jd_start REAL,
    jd INTEGER,
    tape_id INTEGER REFERENCES tapes(id),
    failure_count INTEGER NOT NULL DEFAULT 0,
    integrity_failures INTEGER NOT NULL DEFAULT 0,
    last_failure TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    archived_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_files_status ON files (status);
CREATE INDEX IF NOT EXISTS idx_files_jd ON files (jd);

CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL REFERENCES files(id),
    tape_id INTEGER NOT NULL REFERENCES tapes(id),
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    claimed_by TEXT,
    tape_offset INTEGER,
    length INTEGER,
    digest TEXT,
    failure_reason TEXT,
    failure_detail TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    ended_at INTEGER,
    updated_at INTEGER NOT NULL,
    UNIQUE (file_id, attempt_number)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_open ON attempts (file_id)
    WHERE status IN ('pending', 'copying', 'copied', 'verifying');
CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_verified ON attempts (file_id)
    WHERE status = 'verified';
CREATE INDEX IF NOT EXISTS idx_attempts_tape_status ON attempts (tape_id, status);
CREATE INDEX IF NOT EXISTS idx_attempts_status_updated ON attempts (status, updated_at);
";

/// Create the schema or validate an existing one
pub(crate) fn initialize(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute_batch(SCHEMA)?;
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(ArchiveError::FatalConfig(format!(
                "ledger schema version {} is not supported (expected {})",
                v, SCHEMA_VERSION
            )));
        }
    }
    tx.commit()?;
    Ok(())
}
