//! In-memory tape library
//!
//! Media lives in a shared [`MemoryTapeLibrary`]; any number of
//! [`MemoryTapeDrive`]s can be created against it. A cartridge can be
//! mounted in only one drive at a time, exactly like physical media.
//!
//! Faults can be scripted per tape to exercise the failure paths of the
//! archive state machine:
//! - [`Fault::MountError`] - the next mount fails
//! - [`Fault::CorruptRead`] - the next read-back returns flipped bytes
//! - [`Fault::WriteFault`] - the next write reports a media fault
//! - [`Fault::WriteTimeout`] - the next write times out

use super::{DriveError, DriveResult, TapeCapacity, TapeDrive, TapeHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A scripted failure, consumed the first time it applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    MountError,
    CorruptRead,
    WriteFault,
    WriteTimeout,
}

#[derive(Debug, Default)]
struct MemoryTape {
    data: Vec<u8>,
    capacity: u64,
    mounted_in: Option<String>,
    mounts: u64,
    faults: VecDeque<Fault>,
}

impl MemoryTape {
    fn take_fault(&mut self, wanted: Fault) -> bool {
        match self.faults.iter().position(|f| *f == wanted) {
            Some(idx) => {
                self.faults.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct LibraryState {
    tapes: HashMap<String, MemoryTape>,
}

/// Shared in-memory media
#[derive(Debug, Clone, Default)]
pub struct MemoryTapeLibrary {
    state: Arc<Mutex<LibraryState>>,
    tokens: Arc<AtomicU64>,
}

impl MemoryTapeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a blank cartridge into the library
    pub fn insert_tape(&self, barcode: &str, capacity: u64) {
        self.state.lock().tapes.insert(
            barcode.to_string(),
            MemoryTape {
                capacity,
                ..MemoryTape::default()
            },
        );
    }

    /// Create a drive attached to this library
    pub fn drive(&self, id: &str) -> MemoryTapeDrive {
        MemoryTapeDrive {
            id: id.to_string(),
            library: self.clone(),
        }
    }

    /// Queue a fault against a cartridge
    pub fn inject(&self, barcode: &str, fault: Fault) {
        if let Some(tape) = self.state.lock().tapes.get_mut(barcode) {
            tape.faults.push_back(fault);
        }
    }

    /// Append raw bytes as if a write had reached the media and then the host died
    pub fn scribble(&self, barcode: &str, bytes: &[u8]) {
        if let Some(tape) = self.state.lock().tapes.get_mut(barcode) {
            tape.data.extend_from_slice(bytes);
        }
    }

    /// Copy of a cartridge's contents
    pub fn contents(&self, barcode: &str) -> Option<Vec<u8>> {
        self.state.lock().tapes.get(barcode).map(|t| t.data.clone())
    }

    pub fn mount_count(&self, barcode: &str) -> u64 {
        self.state
            .lock()
            .tapes
            .get(barcode)
            .map(|t| t.mounts)
            .unwrap_or(0)
    }

    /// Whether any drive currently holds the cartridge
    pub fn is_mounted(&self, barcode: &str) -> bool {
        self.state
            .lock()
            .tapes
            .get(barcode)
            .map(|t| t.mounted_in.is_some())
            .unwrap_or(false)
    }
}

/// Drive backed by a [`MemoryTapeLibrary`]
#[derive(Debug)]
pub struct MemoryTapeDrive {
    id: String,
    library: MemoryTapeLibrary,
}

impl MemoryTapeDrive {
    fn with_mounted<T>(
        &self,
        handle: &TapeHandle,
        f: impl FnOnce(&mut MemoryTape) -> DriveResult<T>,
    ) -> DriveResult<T> {
        let mut state = self.library.state.lock();
        let tape = state
            .tapes
            .get_mut(handle.tape())
            .ok_or(DriveError::NotMounted)?;
        if tape.mounted_in.as_deref() != Some(self.id.as_str()) {
            return Err(DriveError::NotMounted);
        }
        f(tape)
    }
}

impl TapeDrive for MemoryTapeDrive {
    fn id(&self) -> &str {
        &self.id
    }

    fn mount(&mut self, barcode: &str) -> DriveResult<TapeHandle> {
        let mut state = self.library.state.lock();
        let tape = state.tapes.get_mut(barcode).ok_or_else(|| DriveError::Mount {
            tape: barcode.to_string(),
            detail: "cartridge not present in library".to_string(),
        })?;
        if tape.take_fault(Fault::MountError) {
            return Err(DriveError::Mount {
                tape: barcode.to_string(),
                detail: "injected mount failure".to_string(),
            });
        }
        match &tape.mounted_in {
            Some(other) if other != &self.id => return Err(DriveError::Busy(other.clone())),
            _ => {}
        }
        tape.mounted_in = Some(self.id.clone());
        tape.mounts += 1;
        let token = self.library.tokens.fetch_add(1, Ordering::Relaxed);
        Ok(TapeHandle::new(barcode, token))
    }

    fn position(&mut self, handle: &TapeHandle) -> DriveResult<u64> {
        self.with_mounted(handle, |tape| Ok(tape.data.len() as u64))
    }

    fn write(&mut self, handle: &TapeHandle, bytes: &[u8]) -> DriveResult<usize> {
        let barcode = handle.tape().to_string();
        self.with_mounted(handle, |tape| {
            if tape.take_fault(Fault::WriteTimeout) {
                return Err(DriveError::Timeout(format!("write to {}", barcode)));
            }
            if tape.take_fault(Fault::WriteFault) {
                return Err(DriveError::Fault {
                    tape: barcode,
                    detail: "injected write fault".to_string(),
                });
            }
            let room = tape.capacity.saturating_sub(tape.data.len() as u64) as usize;
            if room == 0 {
                return Err(DriveError::MediaFull(barcode));
            }
            let n = bytes.len().min(room);
            tape.data.extend_from_slice(&bytes[..n]);
            Ok(n)
        })
    }

    fn read(&mut self, handle: &TapeHandle, offset: u64, len: usize) -> DriveResult<Vec<u8>> {
        self.with_mounted(handle, |tape| {
            let start = (offset as usize).min(tape.data.len());
            let end = start.saturating_add(len).min(tape.data.len());
            let mut data = tape.data[start..end].to_vec();
            if !data.is_empty() && tape.take_fault(Fault::CorruptRead) {
                for byte in data.iter_mut() {
                    *byte ^= 0xFF;
                }
            }
            Ok(data)
        })
    }

    fn unmount(&mut self, handle: TapeHandle) -> DriveResult<()> {
        let mut state = self.library.state.lock();
        let tape = state
            .tapes
            .get_mut(handle.tape())
            .ok_or(DriveError::NotMounted)?;
        if tape.mounted_in.as_deref() != Some(self.id.as_str()) {
            return Err(DriveError::NotMounted);
        }
        tape.mounted_in = None;
        Ok(())
    }

    fn capacity(&mut self, barcode: &str) -> DriveResult<TapeCapacity> {
        let state = self.library.state.lock();
        let tape = state.tapes.get(barcode).ok_or_else(|| DriveError::Mount {
            tape: barcode.to_string(),
            detail: "cartridge not present in library".to_string(),
        })?;
        Ok(TapeCapacity {
            total: Some(tape.capacity),
            used: tape.data.len() as u64,
        })
    }
}
