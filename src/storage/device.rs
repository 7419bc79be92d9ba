//! # Block Devices
//!
//! The whole-sector I/O contract. A device is an array of
//! [`SECTOR_SIZE`]-byte sectors addressed by [`Lba`]; there is no partial
//! I/O, no seek state, and no caching at this layer.
//!
//! Two backends:
//!
//! - [`FileDevice`]: a regular file or raw block device, accessed with
//!   positioned reads/writes so the handle can be shared without seek races.
//! - [`MemDevice`]: a heap-backed device for tests and ephemeral stores.
//!
//! Both validate the address range and the buffer length before touching the
//! backing storage; out-of-range access is reported as [`Error::Corruption`]
//! because a well-formed tree never references sectors past the capacity the
//! allocator was sized with.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

use crate::config::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::types::Lba;

/// Whole-sector read/write/size contract.
pub trait BlockDevice: Send + Sync {
    /// Read the sector at `lba` into `buf` (`buf.len() == SECTOR_SIZE`).
    fn read_sector(&self, lba: Lba, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` (`buf.len() == SECTOR_SIZE`) to the sector at `lba`.
    fn write_sector(&self, lba: Lba, buf: &[u8]) -> Result<()>;

    /// Device capacity in sectors.
    fn size_in_sectors(&self) -> u64;
}

fn check_access(lba: Lba, len: usize, sectors: u64) -> Result<()> {
    if len != SECTOR_SIZE {
        return Err(Error::corruption(format!(
            "sector buffer is {len} bytes, expected {SECTOR_SIZE}"
        )));
    }
    if lba.0 >= sectors {
        return Err(Error::corruption(format!(
            "{lba} out of range (device has {sectors} sectors)"
        )));
    }
    Ok(())
}

/// A file-backed block device.
///
/// The file length must be a whole number of sectors; the capacity is fixed
/// at open time.
pub struct FileDevice {
    file: File,
    sectors: u64,
}

impl FileDevice {
    /// Open an existing file (or raw device node) for sector I/O.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(Error::corruption(format!(
                "device length {len} is not a multiple of the sector size"
            )));
        }
        Ok(Self {
            file,
            sectors: len / SECTOR_SIZE as u64,
        })
    }

    /// Create (or truncate) a file spanning `sectors` sectors.
    pub fn create(path: impl AsRef<Path>, sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors * SECTOR_SIZE as u64)?;
        Ok(Self { file, sectors })
    }
}

impl BlockDevice for FileDevice {
    fn read_sector(&self, lba: Lba, buf: &mut [u8]) -> Result<()> {
        check_access(lba, buf.len(), self.sectors)?;
        self.file.read_exact_at(buf, lba.0 * SECTOR_SIZE as u64)?;
        Ok(())
    }

    fn write_sector(&self, lba: Lba, buf: &[u8]) -> Result<()> {
        check_access(lba, buf.len(), self.sectors)?;
        self.file.write_all_at(buf, lba.0 * SECTOR_SIZE as u64)?;
        Ok(())
    }

    fn size_in_sectors(&self) -> u64 {
        self.sectors
    }
}

/// A heap-backed block device.
pub struct MemDevice {
    sectors: u64,
    data: Mutex<Box<[u8]>>,
}

impl MemDevice {
    pub fn new(sectors: u64) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE].into_boxed_slice()),
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_sector(&self, lba: Lba, buf: &mut [u8]) -> Result<()> {
        check_access(lba, buf.len(), self.sectors)?;
        let data = self.data.lock();
        let start = lba.0 as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, lba: Lba, buf: &[u8]) -> Result<()> {
        check_access(lba, buf.len(), self.sectors)?;
        let mut data = self.data.lock();
        let start = lba.0 as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn size_in_sectors(&self) -> u64 {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trip() {
        let device = MemDevice::new(4);
        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[0] = 0xAB;
        sector[SECTOR_SIZE - 1] = 0xCD;

        device.write_sector(Lba(2), &sector).unwrap();

        let mut back = vec![0u8; SECTOR_SIZE];
        device.read_sector(Lba(2), &mut back).unwrap();
        assert_eq!(back, sector);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let device = MemDevice::new(4);
        let mut buf = vec![0u8; SECTOR_SIZE];
        let err = device.read_sector(Lba(4), &mut buf).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn mem_device_rejects_partial_buffer() {
        let device = MemDevice::new(1);
        let mut buf = vec![0u8; 512];
        assert!(device.read_sector(Lba(0), &mut buf).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.img");

        let device = FileDevice::create(&path, 8).unwrap();
        assert_eq!(device.size_in_sectors(), 8);

        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[100] = 42;
        device.write_sector(Lba(7), &sector).unwrap();

        let reopened = FileDevice::open(&path).unwrap();
        let mut back = vec![0u8; SECTOR_SIZE];
        reopened.read_sector(Lba(7), &mut back).unwrap();
        assert_eq!(back[100], 42);
    }

    #[test]
    fn file_device_rejects_ragged_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.img");
        std::fs::write(&path, vec![0u8; SECTOR_SIZE + 1]).unwrap();

        assert!(FileDevice::open(&path).is_err());
    }
}
