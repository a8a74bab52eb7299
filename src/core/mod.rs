//! Archival engine
//!
//! Leaves first: checksums and the tape capability interface, then the
//! ledger, the allocator and state machine built on it, and the
//! coordinator that runs them across drives.

pub mod allocator;
pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod drive;
pub mod error;
pub mod ledger;
pub mod model;
pub mod recovery;
pub mod state_machine;
