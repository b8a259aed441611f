//! Storage backends. The engine only sees the [`Device`] trait.

use crate::errors::{DeviceError, DeviceResult};

mod file;
mod shmem;

pub use self::file::FileDevice;
pub use self::shmem::ShmemDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// Status record followed by the slot array.
    Status,
    /// Framed message entries.
    Buffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    Create,
    ReadWrite,
    ReadOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionSizes {
    pub status: usize,
    pub buffer: usize,
}

pub trait Device: Send {
    /// Opens the backing store. `sizes` is only used by [`DeviceMode::Create`].
    fn open(&mut self, mode: DeviceMode, sizes: RegionSizes) -> DeviceResult<()>;
    fn close(&mut self);
    fn seek(&mut self, region: Region, offset: usize) -> DeviceResult<()>;
    fn read(&mut self, region: Region, buf: &mut [u8]) -> DeviceResult<()>;
    fn write(&mut self, region: Region, buf: &[u8]) -> DeviceResult<()>;
    /// Takes the advisory, process-wide lock.
    fn lock(&mut self) -> DeviceResult<()>;
    fn unlock(&mut self) -> DeviceResult<()>;
    fn exists(&self) -> bool;
    fn size_of(&self, region: Region) -> DeviceResult<usize>;
    /// Deletes the backing store.
    fn remove(&mut self) -> DeviceResult<()>;
    fn describe(&self) -> String;

    fn check_size(&self, region: Region, expected: usize) -> DeviceResult<()> {
        let actual = self.size_of(region)?;
        if actual < expected {
            return Err(DeviceError::Logic(format!(
                "{:?} region of {} is {} bytes, expected {}",
                region,
                self.describe(),
                actual,
                expected
            )));
        }
        Ok(())
    }
}

/// Extracts the key from a shared-memory queue name such as `/tmp/shmem_4100`.
pub fn shmem_key(path: &str) -> Option<u64> {
    let start = path.find("shmem")?;
    let rest = &path[start + "shmem".len()..];
    let underscore = rest.find('_')?;
    let digits: String = rest[underscore + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Picks the backend for a queue path.
pub fn for_path(path: &str) -> Box<dyn Device> {
    match shmem_key(path) {
        Some(key) => Box::new(ShmemDevice::new(key)),
        None => Box::new(FileDevice::new(path)),
    }
}
