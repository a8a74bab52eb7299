//! File-backed tape drive
//!
//! Each cartridge is an append-only image file `<library>/<barcode>.tape`.
//! Useful for staging-host dry runs and for exercising the coordinator
//! without hardware.

use super::{DriveError, DriveResult, TapeCapacity, TapeDrive, TapeHandle};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Drive whose cartridges are image files in a library directory
pub struct FileTapeDrive {
    id: String,
    library: PathBuf,
    mounted: HashMap<u64, File>,
    next_token: u64,
}

impl FileTapeDrive {
    /// Attach a drive to a library directory, creating it if needed
    pub fn new<P: AsRef<Path>>(id: &str, library: P) -> DriveResult<Self> {
        fs::create_dir_all(&library)?;
        Ok(FileTapeDrive {
            id: id.to_string(),
            library: library.as_ref().to_path_buf(),
            mounted: HashMap::new(),
            next_token: 0,
        })
    }

    /// Image file path for a barcode
    pub fn image_path(&self, barcode: &str) -> PathBuf {
        self.library.join(format!("{}.tape", barcode))
    }

    fn file(&mut self, handle: &TapeHandle) -> DriveResult<&mut File> {
        self.mounted
            .get_mut(&handle.token())
            .ok_or(DriveError::NotMounted)
    }
}

impl TapeDrive for FileTapeDrive {
    fn id(&self) -> &str {
        &self.id
    }

    fn mount(&mut self, barcode: &str) -> DriveResult<TapeHandle> {
        if barcode.is_empty() || barcode.contains(['/', '\\']) {
            return Err(DriveError::Mount {
                tape: barcode.to_string(),
                detail: "barcode is not a valid image name".to_string(),
            });
        }
        let path = self.image_path(barcode);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| DriveError::Mount {
                tape: barcode.to_string(),
                detail: e.to_string(),
            })?;
        let token = self.next_token;
        self.next_token += 1;
        self.mounted.insert(token, file);
        debug!("Opened tape image {:?} in drive {}", path, self.id);
        Ok(TapeHandle::new(barcode, token))
    }

    fn position(&mut self, handle: &TapeHandle) -> DriveResult<u64> {
        let file = self.file(handle)?;
        Ok(file.metadata()?.len())
    }

    fn write(&mut self, handle: &TapeHandle, bytes: &[u8]) -> DriveResult<usize> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::End(0))?;
        let n = file.write(bytes)?;
        file.flush()?;
        Ok(n)
    }

    fn read(&mut self, handle: &TapeHandle, offset: u64, len: usize) -> DriveResult<Vec<u8>> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn unmount(&mut self, handle: TapeHandle) -> DriveResult<()> {
        let file = self
            .mounted
            .remove(&handle.token())
            .ok_or(DriveError::NotMounted)?;
        file.sync_all()?;
        Ok(())
    }

    fn capacity(&mut self, barcode: &str) -> DriveResult<TapeCapacity> {
        let used = match fs::metadata(self.image_path(barcode)) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(TapeCapacity { total: None, used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut drive = FileTapeDrive::new("d0", dir.path()).unwrap();

        let handle = drive.mount("T00001").unwrap();
        assert_eq!(drive.position(&handle).unwrap(), 0);
        drive.write(&handle, b"first").unwrap();
        drive.write(&handle, b"second").unwrap();
        assert_eq!(drive.position(&handle).unwrap(), 11);
        assert_eq!(drive.read(&handle, 5, 6).unwrap(), b"second");
        drive.unmount(handle).unwrap();

        let cap = drive.capacity("T00001").unwrap();
        assert_eq!(cap.used, 11);
        assert_eq!(cap.total, None);
    }

    #[test]
    fn test_image_survives_remount() {
        let dir = TempDir::new().unwrap();
        let mut drive = FileTapeDrive::new("d0", dir.path()).unwrap();
        let handle = drive.mount("T00002").unwrap();
        drive.write(&handle, b"persisted").unwrap();
        drive.unmount(handle).unwrap();

        let mut other = FileTapeDrive::new("d1", dir.path()).unwrap();
        let handle = other.mount("T00002").unwrap();
        assert_eq!(other.read(&handle, 0, 9).unwrap(), b"persisted");
        other.unmount(handle).unwrap();
    }

    #[test]
    fn test_rejects_path_barcodes() {
        let dir = TempDir::new().unwrap();
        let mut drive = FileTapeDrive::new("d0", dir.path()).unwrap();
        assert!(drive.mount("../escape").is_err());
        assert!(drive.capacity("never-mounted").unwrap().used == 0);
    }
}
