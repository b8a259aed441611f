use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::compress::CompressionMethod;
use crate::device::{self, Device, DeviceMode, Region, RegionSizes};
use crate::errors::{FmqError, FmqResult};
use crate::heartbeat::{self, Heartbeat};

pub mod layout;
pub mod ring;
mod integrity;
mod print;

use self::layout::{
    nslots_for_region, slot_offset, status_region_len, MessageId, QueueStatus, SlotRecord,
    FRAMING_OVERHEAD, MAX_SLOTS, SLOT_LEN, STATUS_LEN,
};

/// Attempts made to read a record whose checksum does not match, in case a
/// writer was halfway through updating it.
pub const CHECKSUM_RETRIES: usize = 5;
pub(crate) const RETRY_WAIT: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Create,
    ReadWrite,
    ReadOnly,
    BlockingReadOnly,
    BlockingReadWrite,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        matches!(self, OpenMode::Create | OpenMode::ReadWrite | OpenMode::BlockingReadWrite)
    }

    pub fn blocking(self) -> bool {
        matches!(self, OpenMode::BlockingReadOnly | OpenMode::BlockingReadWrite)
    }
}

/// Where a freshly opened handle starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    Start,
    End,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FmqConfig {
    /// File-pair base path, or a name containing `shmem_<key>` for shared memory.
    pub path: String,
    pub nslots: usize,
    pub buf_size: usize,
    pub mode: OpenMode,
    pub position: StartPosition,
    pub compression: CompressionMethod,
    pub blocking_write: bool,
    /// Skip the advisory lock; the caller guarantees a single writer.
    pub single_writer: bool,
    pub poll_interval_ms: u64,
    pub read_timeout_ms: Option<u64>,
    pub open_timeout_ms: Option<u64>,
}

impl Default for FmqConfig {
    fn default() -> Self {
        FmqConfig {
            path: "/tmp/fmq/queue".to_string(),
            nslots: 1024,
            buf_size: 1 << 20,
            mode: OpenMode::ReadWrite,
            position: StartPosition::End,
            compression: CompressionMethod::None,
            blocking_write: false,
            single_writer: false,
            poll_interval_ms: 10,
            read_timeout_ms: None,
            open_timeout_ms: None,
        }
    }
}

impl FmqConfig {
    pub fn new(path: impl Into<String>) -> FmqConfig {
        FmqConfig {
            path: path.into(),
            ..FmqConfig::default()
        }
    }

    pub fn nslots(mut self, nslots: usize) -> Self {
        self.nslots = nslots;
        self
    }

    pub fn buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn position(mut self, position: StartPosition) -> Self {
        self.position = position;
        self
    }

    pub fn compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    pub fn blocking_write(mut self, on: bool) -> Self {
        self.blocking_write = on;
        self
    }

    pub fn single_writer(mut self, on: bool) -> Self {
        self.single_writer = on;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn open_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.open_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> FmqResult<()> {
        if self.path.is_empty() {
            return Err(FmqError::Config("queue path is empty".to_string()));
        }
        if self.nslots == 0 || self.nslots > MAX_SLOTS {
            return Err(FmqError::Config(format!(
                "nslots must be within 1..={}, got {}",
                MAX_SLOTS, self.nslots
            )));
        }
        if self.buf_size <= FRAMING_OVERHEAD || self.buf_size > i32::MAX as usize {
            return Err(FmqError::Config(format!(
                "buf_size must be within {}..={}, got {}",
                FRAMING_OVERHEAD + 1,
                i32::MAX,
                self.buf_size
            )));
        }
        Ok(())
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Position of a handle in the id sequence: the last slot and id it returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadCursor {
    pub last_id_read: MessageId,
    pub last_slot_read: i32,
}

impl Default for ReadCursor {
    fn default() -> Self {
        ReadCursor {
            last_id_read: -1,
            last_slot_read: -1,
        }
    }
}

/// Messages a reader missed because the writer overtook it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Number of times the reader had to jump forward.
    pub skips: u64,
    /// Messages lost across all jumps.
    pub lost: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub slot: i32,
    pub msg_type: i32,
    pub subtype: i32,
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

/// A handle on one queue. Each process (or thread) opens its own; the queue
/// state lives in the device and is re-read at the start of every operation.
pub struct Fmq {
    pub(crate) cfg: FmqConfig,
    pub(crate) dev: Box<dyn Device>,
    pub(crate) heartbeat: Box<dyn Heartbeat>,
    pub(crate) nslots: usize,
    pub(crate) buf_size: usize,
    pub(crate) cursor: ReadCursor,
    pub(crate) stats: ReadStats,
    pub(crate) open: bool,
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Fmq {
    /// Opens the queue named by `cfg.path`, picking the backend from the name.
    pub fn open(cfg: FmqConfig) -> FmqResult<Fmq> {
        cfg.validate()?;
        let dev = device::for_path(&cfg.path);
        Fmq::open_with_device(cfg, dev)
    }

    pub fn open_with_device(cfg: FmqConfig, dev: Box<dyn Device>) -> FmqResult<Fmq> {
        cfg.validate()?;
        let mut fmq = Fmq {
            nslots: cfg.nslots,
            buf_size: cfg.buf_size,
            cfg,
            dev,
            heartbeat: heartbeat::noop(),
            cursor: ReadCursor::default(),
            stats: ReadStats::default(),
            open: false,
        };
        fmq.open_device()?;
        fmq.open = true;
        info!(
            "opened {} ({:?}, {} slots, {} bytes)",
            fmq.dev.describe(),
            fmq.cfg.mode,
            fmq.nslots,
            fmq.buf_size
        );
        match fmq.cfg.position {
            StartPosition::Start => fmq.seek(crate::reader::Seek::Start)?,
            StartPosition::End => fmq.seek(crate::reader::Seek::End)?,
        }
        Ok(fmq)
    }

    pub fn set_heartbeat(&mut self, heartbeat: impl Heartbeat + 'static) {
        self.heartbeat = Box::new(heartbeat);
    }

    pub fn config(&self) -> &FmqConfig {
        &self.cfg
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    pub fn read_stats(&self) -> ReadStats {
        self.stats
    }

    pub fn is_writable(&self) -> bool {
        self.cfg.mode.writable()
    }

    pub fn close(&mut self) {
        if self.open {
            self.dev.close();
            self.open = false;
            info!("closed {}", self.dev.describe());
        }
    }

    /// Closes the handle and deletes the backing storage.
    pub fn remove(mut self) -> FmqResult<()> {
        self.close();
        self.dev.remove()?;
        Ok(())
    }

    fn open_device(&mut self) -> FmqResult<()> {
        let mode = self.cfg.mode;
        if mode.blocking() {
            self.wait_for_queue()?;
        }
        match mode {
            OpenMode::Create => self.create(),
            OpenMode::ReadWrite | OpenMode::BlockingReadWrite => {
                if self.dev.exists() {
                    self.attach(DeviceMode::ReadWrite)
                } else {
                    self.create()
                }
            }
            OpenMode::ReadOnly | OpenMode::BlockingReadOnly => {
                if !self.dev.exists() {
                    return Err(FmqError::NotFound(self.cfg.path.clone()));
                }
                self.attach(DeviceMode::ReadOnly)
            }
        }
    }

    fn wait_for_queue(&mut self) -> FmqResult<()> {
        let started = Instant::now();
        let limit = self.cfg.open_timeout_ms.map(Duration::from_millis);
        loop {
            if self.dev.exists() && self.probe_status() {
                return Ok(());
            }
            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    return Err(FmqError::Timeout(limit));
                }
            }
            self.heartbeat.beat("FMQ: waiting for queue to be created");
            thread::sleep(self.cfg.poll_interval_duration());
        }
    }

    /// True once the storage carries a valid status record.
    fn probe_status(&mut self) -> bool {
        let sizes = self.sizes();
        if self.dev.open(DeviceMode::ReadOnly, sizes).is_err() {
            return false;
        }
        let mut buf = [0u8; STATUS_LEN];
        let valid = self.dev.seek(Region::Status, 0).is_ok()
            && self.dev.read(Region::Status, &mut buf).is_ok()
            && QueueStatus::decode(&buf).checksum_ok();
        self.dev.close();
        valid
    }

    pub(crate) fn sizes(&self) -> RegionSizes {
        RegionSizes {
            status: status_region_len(self.nslots),
            buffer: self.buf_size,
        }
    }

    fn create(&mut self) -> FmqResult<()> {
        self.nslots = self.cfg.nslots;
        self.buf_size = self.cfg.buf_size;
        let sizes = self.sizes();
        self.dev.open(DeviceMode::Create, sizes)?;
        self.open = true;
        info!("created {} with {} slots, {} bytes", self.dev.describe(), self.nslots, self.buf_size);
        self.with_lock(|q| q.reinitialize_locked())
    }

    fn attach(&mut self, mode: DeviceMode) -> FmqResult<()> {
        let sizes = self.sizes();
        self.dev.open(mode, sizes)?;
        self.open = true;

        // Geometry comes from the storage, not from the config.
        self.nslots = nslots_for_region(self.dev.size_of(Region::Status)?);
        self.buf_size = self.dev.size_of(Region::Buffer)?;
        if self.nslots == 0 || self.buf_size <= FRAMING_OVERHEAD {
            return Err(FmqError::CorruptQueue(format!(
                "{} has no room for slots or data",
                self.dev.describe()
            )));
        }

        let (status, valid) = self.read_status_checked()?;
        if valid && (status.nslots != self.nslots || status.buf_size > self.buf_size) {
            warn!(
                "status of {} declares {} slots / {} bytes, storage holds {} / {}",
                self.dev.describe(),
                status.nslots,
                status.buf_size,
                self.nslots,
                self.buf_size
            );
        }
        if valid {
            self.nslots = status.nslots.min(self.nslots);
            self.buf_size = status.buf_size.min(self.buf_size);
        }
        self.dev.check_size(Region::Status, status_region_len(self.nslots))?;
        self.dev.check_size(Region::Buffer, self.buf_size)?;

        if mode == DeviceMode::ReadWrite {
            if !valid {
                warn!("status record of {} is corrupt, attempting recovery", self.dev.describe());
                self.recover_heuristic()?;
            }
            self.check_integrity()?;
            if self.cfg.blocking_write {
                self.with_lock(|q| {
                    let mut status = q.read_status()?;
                    if !status.blocking_write {
                        status.blocking_write = true;
                        q.write_status(&mut status)?;
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> FmqResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(FmqError::NotOpen)
        }
    }

    pub(crate) fn ensure_writable(&self) -> FmqResult<()> {
        self.ensure_open()?;
        if self.is_writable() {
            Ok(())
        } else {
            Err(FmqError::ReadOnly)
        }
    }

    /// Runs `f` holding the advisory lock, unless the queue is in single-writer mode.
    pub(crate) fn with_lock<R, F>(&mut self, f: F) -> FmqResult<R>
    where
        F: FnOnce(&mut Fmq) -> FmqResult<R>,
    {
        if self.cfg.single_writer {
            return f(self);
        }
        self.dev.lock()?;
        let result = f(self);
        let unlocked = self.dev.unlock();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Reads the status record, retrying while its checksum is wrong. The flag
    /// is false when retries ran out and the returned copy is best effort.
    pub(crate) fn read_status_checked(&mut self) -> FmqResult<(QueueStatus, bool)> {
        let mut buf = [0u8; STATUS_LEN];
        let mut status = QueueStatus::new(self.nslots, self.buf_size);
        for attempt in 0..CHECKSUM_RETRIES {
            self.dev.seek(Region::Status, 0)?;
            self.dev.read(Region::Status, &mut buf)?;
            status = QueueStatus::decode(&buf);
            if status.checksum_ok() {
                return Ok((status, true));
            }
            if attempt + 1 < CHECKSUM_RETRIES {
                thread::sleep(RETRY_WAIT);
            }
        }
        Ok((status, false))
    }

    pub(crate) fn read_status(&mut self) -> FmqResult<QueueStatus> {
        let (status, valid) = self.read_status_checked()?;
        if !valid {
            warn!(
                "{}: {}, using best-effort copy",
                self.dev.describe(),
                FmqError::ChecksumMismatch("status record")
            );
        }
        Ok(status)
    }

    pub(crate) fn write_status(&mut self, status: &mut QueueStatus) -> FmqResult<()> {
        status.stamp();
        self.dev.seek(Region::Status, 0)?;
        self.dev.write(Region::Status, &status.encode())?;
        Ok(())
    }

    pub(crate) fn check_slot_index(&self, index: i32) -> FmqResult<usize> {
        if index < 0 || index as usize >= self.nslots {
            return Err(FmqError::InvalidSlot {
                index,
                nslots: self.nslots,
            });
        }
        Ok(index as usize)
    }

    pub(crate) fn read_slot_checked(&mut self, index: i32) -> FmqResult<(SlotRecord, bool)> {
        let index = self.check_slot_index(index)?;
        let mut buf = [0u8; SLOT_LEN];
        let mut slot = SlotRecord::default();
        for attempt in 0..CHECKSUM_RETRIES {
            self.dev.seek(Region::Status, slot_offset(index))?;
            self.dev.read(Region::Status, &mut buf)?;
            slot = SlotRecord::decode(&buf);
            if slot.checksum_ok() {
                return Ok((slot, true));
            }
            if attempt + 1 < CHECKSUM_RETRIES {
                thread::sleep(RETRY_WAIT);
            }
        }
        Ok((slot, false))
    }

    pub(crate) fn read_slot(&mut self, index: i32) -> FmqResult<SlotRecord> {
        let (slot, valid) = self.read_slot_checked(index)?;
        if !valid {
            warn!(
                "{}: {} for slot {}, using best-effort copy",
                self.dev.describe(),
                FmqError::ChecksumMismatch("slot record"),
                index
            );
        }
        Ok(slot)
    }

    pub(crate) fn write_slot(&mut self, index: i32, slot: &mut SlotRecord) -> FmqResult<()> {
        let index = self.check_slot_index(index)?;
        slot.stamp();
        self.dev.seek(Region::Status, slot_offset(index))?;
        self.dev.write(Region::Status, &slot.encode())?;
        Ok(())
    }

    pub(crate) fn read_entry(&mut self, slot: &SlotRecord) -> FmqResult<Vec<u8>> {
        if slot.offset + slot.stored_len > self.buf_size {
            return Err(FmqError::CorruptQueue(format!(
                "slot {} points past the buffer ({} + {} > {})",
                slot.id, slot.offset, slot.stored_len, self.buf_size
            )));
        }
        let mut entry = vec![0u8; slot.stored_len];
        self.dev.seek(Region::Buffer, slot.offset)?;
        self.dev.read(Region::Buffer, &mut entry)?;
        Ok(entry)
    }

    /// Snapshot of the status record.
    pub fn status(&mut self) -> FmqResult<QueueStatus> {
        self.ensure_open()?;
        self.read_status()
    }

    /// Snapshot of every slot record.
    pub fn slots(&mut self) -> FmqResult<Vec<SlotRecord>> {
        self.ensure_open()?;
        (0..self.nslots as i32).map(|i| self.read_slot(i)).collect()
    }
}

impl Drop for Fmq {
    fn drop(&mut self) {
        self.close();
    }
}
