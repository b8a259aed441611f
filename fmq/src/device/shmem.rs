use std::ptr;

use raw_sync::locks::{LockImpl, LockInit, Mutex};
use shared_memory::{Shmem, ShmemConf};

use super::{Device, DeviceMode, Region, RegionSizes};
use crate::errors::{DeviceError, DeviceResult};

const SEGMENT_MAGIC: u32 = 0x464d_514d;

// Segment header: magic (u32), padding, region length (u64).
const HEADER_LEN: usize = 16;
const LOCK_OFFSET: usize = 64;
const LOCK_SPACE: usize = 128;
const STATUS_DATA_OFFSET: usize = LOCK_OFFSET + LOCK_SPACE;
const BUFFER_DATA_OFFSET: usize = 64;

/// A queue held in two shared-memory segments keyed by an integer.
///
/// The status segment carries a process-shared mutex used for the advisory
/// lock. Segments outlive the handle that created them; [`Device::remove`]
/// unlinks them.
pub struct ShmemDevice {
    key: u64,
    status: Option<Shmem>,
    buffer: Option<Shmem>,
    lock: Option<Box<dyn LockImpl>>,
    locked: bool,
    writable: bool,
    status_pos: usize,
    buffer_pos: usize,
}

impl ShmemDevice {
    pub fn new(key: u64) -> ShmemDevice {
        ShmemDevice {
            key,
            status: None,
            buffer: None,
            lock: None,
            locked: false,
            writable: false,
            status_pos: 0,
            buffer_pos: 0,
        }
    }

    fn os_id(&self, region: Region) -> String {
        match region {
            Region::Status => format!("/fmq_{}_stat", self.key),
            Region::Buffer => format!("/fmq_{}_buf", self.key),
        }
    }

    fn data_offset(region: Region) -> usize {
        match region {
            Region::Status => STATUS_DATA_OFFSET,
            Region::Buffer => BUFFER_DATA_OFFSET,
        }
    }

    fn segment(&self, region: Region) -> DeviceResult<&Shmem> {
        let segment = match region {
            Region::Status => self.status.as_ref(),
            Region::Buffer => self.buffer.as_ref(),
        };
        segment.ok_or(DeviceError::NotOpen)
    }

    fn unlink(&self, region: Region) {
        if let Ok(mut existing) = ShmemConf::new().os_id(self.os_id(region)).open() {
            existing.set_owner(true);
        }
    }

    fn create_segment(&self, region: Region, len: usize) -> DeviceResult<Shmem> {
        self.unlink(region);
        let mut segment = ShmemConf::new()
            .os_id(self.os_id(region))
            .size(Self::data_offset(region) + len)
            .create()?;
        segment.set_owner(false);
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        header[8..16].copy_from_slice(&(len as u64).to_be_bytes());
        unsafe {
            ptr::copy_nonoverlapping(header.as_ptr(), segment.as_ptr(), HEADER_LEN);
        }
        Ok(segment)
    }

    fn open_segment(&self, region: Region) -> DeviceResult<Shmem> {
        let segment = ShmemConf::new().os_id(self.os_id(region)).open()?;
        Self::region_len(&segment)?;
        Ok(segment)
    }

    fn region_len(segment: &Shmem) -> DeviceResult<usize> {
        if segment.len() < HEADER_LEN {
            return Err(DeviceError::Logic(format!("segment {} too small", segment.get_os_id())));
        }
        let mut header = [0u8; HEADER_LEN];
        unsafe {
            ptr::copy_nonoverlapping(segment.as_ptr(), header.as_mut_ptr(), HEADER_LEN);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        if u32::from_be_bytes(magic) != SEGMENT_MAGIC {
            return Err(DeviceError::Logic(format!(
                "segment {} is not initialised",
                segment.get_os_id()
            )));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&header[8..16]);
        Ok(u64::from_be_bytes(len) as usize)
    }

    fn attach_lock(status: &Shmem, create: bool) -> DeviceResult<Box<dyn LockImpl>> {
        let base = status.as_ptr();
        let (lock, used) = unsafe {
            let mem = base.add(LOCK_OFFSET);
            let data = base.add(STATUS_DATA_OFFSET);
            if create {
                Mutex::new(mem, data)
            } else {
                Mutex::from_existing(mem, data)
            }
        }
        .map_err(|e| DeviceError::Lock(e.to_string()))?;
        if used > LOCK_SPACE {
            return Err(DeviceError::Lock(format!(
                "mutex needs {} bytes, {} reserved",
                used, LOCK_SPACE
            )));
        }
        Ok(lock)
    }

    fn bounds(&self, region: Region, len: usize) -> DeviceResult<*mut u8> {
        let segment = self.segment(region)?;
        let pos = match region {
            Region::Status => self.status_pos,
            Region::Buffer => self.buffer_pos,
        };
        let region_len = Self::region_len(segment)?;
        if pos + len > region_len {
            return Err(DeviceError::Logic(format!(
                "access of {} bytes at {} overruns {:?} region of {} bytes",
                len, pos, region, region_len
            )));
        }
        Ok(unsafe { segment.as_ptr().add(Self::data_offset(region) + pos) })
    }

    fn advance(&mut self, region: Region, by: usize) {
        match region {
            Region::Status => self.status_pos += by,
            Region::Buffer => self.buffer_pos += by,
        }
    }
}

// SAFETY: the mappings and the mutex live in process-shared memory, and every
// access goes through `&mut self`, so moving the device to another thread is sound.
unsafe impl Send for ShmemDevice {}

impl Device for ShmemDevice {
    fn open(&mut self, mode: DeviceMode, sizes: RegionSizes) -> DeviceResult<()> {
        self.close();
        let (status, buffer, create) = match mode {
            DeviceMode::Create => (
                self.create_segment(Region::Status, sizes.status)?,
                self.create_segment(Region::Buffer, sizes.buffer)?,
                true,
            ),
            DeviceMode::ReadWrite | DeviceMode::ReadOnly => (
                self.open_segment(Region::Status)?,
                self.open_segment(Region::Buffer)?,
                false,
            ),
        };
        self.lock = Some(Self::attach_lock(&status, create)?);
        self.status = Some(status);
        self.buffer = Some(buffer);
        self.writable = mode != DeviceMode::ReadOnly;
        self.status_pos = 0;
        self.buffer_pos = 0;
        Ok(())
    }

    fn close(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock() {
                tracing::warn!("failed to release lock on shmem key {}: {}", self.key, e);
            }
        }
        // The mutex lives inside the status segment, so drop it first.
        self.lock = None;
        self.status = None;
        self.buffer = None;
    }

    fn seek(&mut self, region: Region, offset: usize) -> DeviceResult<()> {
        self.segment(region)?;
        match region {
            Region::Status => self.status_pos = offset,
            Region::Buffer => self.buffer_pos = offset,
        }
        Ok(())
    }

    fn read(&mut self, region: Region, buf: &mut [u8]) -> DeviceResult<()> {
        let src = self.bounds(region, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len());
        }
        self.advance(region, buf.len());
        Ok(())
    }

    fn write(&mut self, region: Region, buf: &[u8]) -> DeviceResult<()> {
        if !self.writable {
            return Err(DeviceError::ReadOnly);
        }
        let dest = self.bounds(region, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), dest, buf.len());
        }
        self.advance(region, buf.len());
        Ok(())
    }

    fn lock(&mut self) -> DeviceResult<()> {
        let lock = self.lock.as_ref().ok_or(DeviceError::NotOpen)?;
        let guard = lock.lock().map_err(|e| DeviceError::Lock(e.to_string()))?;
        // Held until unlock(), which calls release() directly.
        std::mem::forget(guard);
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> DeviceResult<()> {
        let lock = self.lock.as_ref().ok_or(DeviceError::NotOpen)?;
        lock.release().map_err(|e| DeviceError::Lock(e.to_string()))?;
        self.locked = false;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.open_segment(Region::Status).is_ok() && self.open_segment(Region::Buffer).is_ok()
    }

    fn size_of(&self, region: Region) -> DeviceResult<usize> {
        match self.segment(region) {
            Ok(segment) => Self::region_len(segment),
            Err(_) => Self::region_len(&self.open_segment(region)?),
        }
    }

    fn remove(&mut self) -> DeviceResult<()> {
        self.close();
        self.unlink(Region::Status);
        self.unlink(Region::Buffer);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("shmem key {}", self.key)
    }
}

impl Drop for ShmemDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key() -> u64 {
        9_000_000 + (std::process::id() as u64 % 100_000) * 10
    }

    #[test]
    fn shared_segments_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let key = unique_key();
        let sizes = RegionSizes { status: 160, buffer: 512 };
        let mut writer = ShmemDevice::new(key);
        writer.open(DeviceMode::Create, sizes)?;
        assert!(writer.exists());
        writer.seek(Region::Buffer, 500)?;
        writer.write(Region::Buffer, b"tail")?;
        assert!(writer.write(Region::Buffer, b"overrun").is_err());

        let mut reader = ShmemDevice::new(key);
        reader.open(DeviceMode::ReadOnly, sizes)?;
        assert_eq!(reader.size_of(Region::Status)?, 160);
        assert_eq!(reader.size_of(Region::Buffer)?, 512);
        let mut buf = [0u8; 4];
        reader.seek(Region::Buffer, 500)?;
        reader.read(Region::Buffer, &mut buf)?;
        assert_eq!(&buf, b"tail");
        assert!(matches!(reader.write(Region::Buffer, b"x"), Err(DeviceError::ReadOnly)));

        writer.lock()?;
        writer.unlock()?;
        reader.lock()?;
        reader.unlock()?;

        drop(reader);
        writer.remove()?;
        assert!(!writer.exists());
        Ok(())
    }
}
