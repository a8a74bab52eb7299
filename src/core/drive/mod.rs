//! Tape capability interface
//!
//! The archival core never talks to hardware directly. A [`TapeDrive`]
//! exposes the handful of blocking operations the core needs:
//! - `mount` / `unmount` a cartridge by barcode
//! - `position` to find the append point
//! - `write` a block at the append point
//! - `read` an extent back for verification
//! - `capacity` to query what the media reports about itself
//!
//! Mounted media is held through a [`MountedTape`] guard which unmounts on
//! every exit path, including panics and cancellation.
//!
//! Two implementations ship with the crate:
//! - [`file::FileTapeDrive`] - tapes as append-only image files
//! - [`memory::MemoryTapeLibrary`] - shared in-memory media with fault injection

pub mod file;
pub mod memory;

use crate::model::FailureReason;
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by a tape drive
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("drive {0} is busy")]
    Busy(String),

    #[error("drive operation timed out: {0}")]
    Timeout(String),

    #[error("failed to mount tape {tape}: {detail}")]
    Mount { tape: String, detail: String },

    #[error("drive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("drive reported a media fault on {tape}: {detail}")]
    Fault { tape: String, detail: String },

    #[error("tape {0} is full")]
    MediaFull(String),

    #[error("no tape is mounted under this handle")]
    NotMounted,
}

impl DriveError {
    /// Ledger failure code recorded when this error ends an attempt
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DriveError::Busy(_) => FailureReason::DriveBusy,
            DriveError::Timeout(_) => FailureReason::DriveTimeout,
            DriveError::Mount { .. } | DriveError::NotMounted => FailureReason::MountError,
            DriveError::Io(_) => FailureReason::IoError,
            DriveError::Fault { .. } => FailureReason::DriveFault,
            DriveError::MediaFull(_) => FailureReason::TapeUnavailable,
        }
    }

    /// Whether the media itself is unusable for further writes
    pub fn is_media_fault(&self) -> bool {
        matches!(self, DriveError::Fault { .. })
    }
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;

/// Opaque handle to a mounted cartridge
#[derive(Debug, PartialEq, Eq)]
pub struct TapeHandle {
    tape: String,
    token: u64,
}

impl TapeHandle {
    /// Drive implementations mint handles; `token` distinguishes mounts
    pub fn new(tape: impl Into<String>, token: u64) -> Self {
        TapeHandle {
            tape: tape.into(),
            token,
        }
    }

    pub fn tape(&self) -> &str {
        &self.tape
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// What a drive reports about a cartridge's space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeCapacity {
    /// Capacity the media reports, when the drive knows it
    pub total: Option<u64>,
    /// Bytes already written
    pub used: u64,
}

/// Blocking capability interface implemented outside the core
pub trait TapeDrive: Send {
    /// Stable drive identifier
    fn id(&self) -> &str;

    /// Load a cartridge and return a handle to it
    fn mount(&mut self, tape: &str) -> DriveResult<TapeHandle>;

    /// Current append point in bytes
    fn position(&mut self, handle: &TapeHandle) -> DriveResult<u64>;

    /// Write a block at the append point, returning the bytes accepted
    fn write(&mut self, handle: &TapeHandle, bytes: &[u8]) -> DriveResult<usize>;

    /// Read `len` bytes starting at `offset`
    fn read(&mut self, handle: &TapeHandle, offset: u64, len: usize) -> DriveResult<Vec<u8>>;

    /// Release the cartridge
    fn unmount(&mut self, handle: TapeHandle) -> DriveResult<()>;

    /// Query space on a cartridge
    fn capacity(&mut self, tape: &str) -> DriveResult<TapeCapacity>;
}

impl<D: TapeDrive + ?Sized> TapeDrive for Box<D> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn mount(&mut self, tape: &str) -> DriveResult<TapeHandle> {
        (**self).mount(tape)
    }

    fn position(&mut self, handle: &TapeHandle) -> DriveResult<u64> {
        (**self).position(handle)
    }

    fn write(&mut self, handle: &TapeHandle, bytes: &[u8]) -> DriveResult<usize> {
        (**self).write(handle, bytes)
    }

    fn read(&mut self, handle: &TapeHandle, offset: u64, len: usize) -> DriveResult<Vec<u8>> {
        (**self).read(handle, offset, len)
    }

    fn unmount(&mut self, handle: TapeHandle) -> DriveResult<()> {
        (**self).unmount(handle)
    }

    fn capacity(&mut self, tape: &str) -> DriveResult<TapeCapacity> {
        (**self).capacity(tape)
    }
}

/// A cartridge mounted in a drive
///
/// Acquired with [`MountedTape::mount`]. The tape is unmounted by
/// [`MountedTape::release`], or by `Drop` if the guard goes away on any
/// other path.
pub struct MountedTape<'d> {
    drive: &'d mut dyn TapeDrive,
    handle: Option<TapeHandle>,
    barcode: String,
}

impl<'d> MountedTape<'d> {
    pub fn mount(drive: &'d mut dyn TapeDrive, barcode: &str) -> DriveResult<Self> {
        let handle = drive.mount(barcode)?;
        debug!("Drive {} mounted tape {}", drive.id(), barcode);
        Ok(MountedTape {
            drive,
            handle: Some(handle),
            barcode: barcode.to_string(),
        })
    }

    pub fn barcode(&self) -> &str {
        &self.barcode
    }

    pub fn drive_id(&self) -> &str {
        self.drive.id()
    }

    fn handle(&self) -> DriveResult<&TapeHandle> {
        self.handle.as_ref().ok_or(DriveError::NotMounted)
    }

    pub fn position(&mut self) -> DriveResult<u64> {
        let handle = self.handle.as_ref().ok_or(DriveError::NotMounted)?;
        self.drive.position(handle)
    }

    /// Write the whole buffer, looping over short writes
    pub fn write_all(&mut self, mut bytes: &[u8]) -> DriveResult<()> {
        let handle = self.handle.as_ref().ok_or(DriveError::NotMounted)?;
        while !bytes.is_empty() {
            let n = self.drive.write(handle, bytes)?;
            if n == 0 {
                return Err(DriveError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("drive accepted no bytes on tape {}", self.barcode),
                )));
            }
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Read an extent, failing on short reads
    pub fn read_exact(&mut self, offset: u64, len: usize) -> DriveResult<Vec<u8>> {
        let handle = self.handle.as_ref().ok_or(DriveError::NotMounted)?;
        let data = self.drive.read(handle, offset, len)?;
        if data.len() != len {
            return Err(DriveError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "short read on tape {} at offset {}: wanted {} bytes, got {}",
                    self.barcode,
                    offset,
                    len,
                    data.len()
                ),
            )));
        }
        Ok(data)
    }

    pub fn capacity(&mut self) -> DriveResult<TapeCapacity> {
        self.handle()?;
        self.drive.capacity(&self.barcode)
    }

    /// Unmount explicitly and surface any error
    pub fn release(mut self) -> DriveResult<()> {
        match self.handle.take() {
            Some(handle) => {
                debug!("Drive {} unmounting tape {}", self.drive.id(), self.barcode);
                self.drive.unmount(handle)
            }
            None => Ok(()),
        }
    }
}

impl Drop for MountedTape<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.drive.unmount(handle) {
                warn!(
                    "Drive {} failed to unmount tape {} during cleanup: {}",
                    self.drive.id(),
                    self.barcode,
                    e
                );
            }
        }
    }
}
