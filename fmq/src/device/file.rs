use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::{Device, DeviceMode, Region, RegionSizes};
use crate::errors::{DeviceError, DeviceResult};

pub const STATUS_SUFFIX: &str = ".stat";
pub const BUFFER_SUFFIX: &str = ".buf";

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// A queue stored as a status file and a buffer file side by side.
pub struct FileDevice {
    base: PathBuf,
    status_path: PathBuf,
    buffer_path: PathBuf,
    status: Option<File>,
    buffer: Option<File>,
    writable: bool,
    locked: bool,
}

impl FileDevice {
    pub fn new(path: impl AsRef<Path>) -> FileDevice {
        let base = path.as_ref();
        FileDevice {
            base: base.to_path_buf(),
            status_path: suffixed(base, STATUS_SUFFIX),
            buffer_path: suffixed(base, BUFFER_SUFFIX),
            status: None,
            buffer: None,
            writable: false,
            locked: false,
        }
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn file(&mut self, region: Region) -> DeviceResult<&mut File> {
        let file = match region {
            Region::Status => self.status.as_mut(),
            Region::Buffer => self.buffer.as_mut(),
        };
        file.ok_or(DeviceError::NotOpen)
    }

    fn create_file(path: &Path, len: usize) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Ok(file)
    }
}

impl Device for FileDevice {
    fn open(&mut self, mode: DeviceMode, sizes: RegionSizes) -> DeviceResult<()> {
        self.close();
        let (status, buffer) = match mode {
            DeviceMode::Create => (
                Self::create_file(&self.status_path, sizes.status)?,
                Self::create_file(&self.buffer_path, sizes.buffer)?,
            ),
            DeviceMode::ReadWrite => {
                let mut options = OpenOptions::new();
                options.read(true).write(true);
                (options.open(&self.status_path)?, options.open(&self.buffer_path)?)
            }
            DeviceMode::ReadOnly => (File::open(&self.status_path)?, File::open(&self.buffer_path)?),
        };
        self.status = Some(status);
        self.buffer = Some(buffer);
        self.writable = mode != DeviceMode::ReadOnly;
        Ok(())
    }

    fn close(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock() {
                tracing::warn!("failed to release lock on {}: {}", self.status_path.display(), e);
            }
        }
        self.status = None;
        self.buffer = None;
    }

    fn seek(&mut self, region: Region, offset: usize) -> DeviceResult<()> {
        self.file(region)?.seek(SeekFrom::Start(offset as u64))?;
        Ok(())
    }

    fn read(&mut self, region: Region, buf: &mut [u8]) -> DeviceResult<()> {
        self.file(region)?.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, region: Region, buf: &[u8]) -> DeviceResult<()> {
        if !self.writable {
            return Err(DeviceError::ReadOnly);
        }
        self.file(region)?.write_all(buf)?;
        Ok(())
    }

    fn lock(&mut self) -> DeviceResult<()> {
        let file = self.file(Region::Status)?;
        FileExt::lock_exclusive(&*file)?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> DeviceResult<()> {
        let file = self.file(Region::Status)?;
        FileExt::unlock(&*file)?;
        self.locked = false;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.status_path.is_file() && self.buffer_path.is_file()
    }

    fn size_of(&self, region: Region) -> DeviceResult<usize> {
        let path = match region {
            Region::Status => &self.status_path,
            Region::Buffer => &self.buffer_path,
        };
        Ok(fs::metadata(path)?.len() as usize)
    }

    fn remove(&mut self) -> DeviceResult<()> {
        self.close();
        for path in [&self.status_path, &self.buffer_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file pair {}", self.base.display())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SIZES: RegionSizes = RegionSizes { status: 256, buffer: 1024 };

    #[test]
    fn create_sizes_both_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut dev = FileDevice::new(dir.path().join("nested/queue"));
        assert!(!dev.exists());
        dev.open(DeviceMode::Create, SIZES)?;
        assert!(dev.exists());
        assert_eq!(dev.size_of(Region::Status)?, 256);
        assert_eq!(dev.size_of(Region::Buffer)?, 1024);
        dev.check_size(Region::Buffer, 1024)?;
        assert!(dev.check_size(Region::Buffer, 2048).is_err());
        Ok(())
    }

    #[test]
    fn regions_are_independent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut dev = FileDevice::new(dir.path().join("queue"));
        dev.open(DeviceMode::Create, SIZES)?;
        dev.seek(Region::Buffer, 100)?;
        dev.write(Region::Buffer, b"payload")?;
        dev.seek(Region::Status, 100)?;
        dev.write(Region::Status, b"status!")?;

        let mut buf = [0u8; 7];
        dev.seek(Region::Buffer, 100)?;
        dev.read(Region::Buffer, &mut buf)?;
        assert_eq!(&buf, b"payload");
        dev.seek(Region::Status, 100)?;
        dev.read(Region::Status, &mut buf)?;
        assert_eq!(&buf, b"status!");
        Ok(())
    }

    #[test]
    fn read_only_rejects_writes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("queue");
        FileDevice::new(&path).open(DeviceMode::Create, SIZES)?;
        let mut dev = FileDevice::new(&path);
        dev.open(DeviceMode::ReadOnly, SIZES)?;
        assert!(matches!(dev.write(Region::Buffer, b"x"), Err(DeviceError::ReadOnly)));
        Ok(())
    }

    #[test]
    fn lock_unlock_and_remove() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut dev = FileDevice::new(dir.path().join("queue"));
        assert!(matches!(dev.lock(), Err(DeviceError::NotOpen)));
        dev.open(DeviceMode::Create, SIZES)?;
        dev.lock()?;
        dev.unlock()?;
        dev.remove()?;
        assert!(!dev.exists());
        Ok(())
    }
}
