use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures raised by a storage backend. They always propagate to the caller.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    // raw_sync hands back a non-Send Box<dyn Error>, so only its message is kept.
    #[error("lock error: {0}")]
    Lock(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("device is not open")]
    NotOpen,
    #[error("device was opened read-only")]
    ReadOnly,
    #[error("{0}")]
    Logic(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum FmqError {
    #[error("queue is not open")]
    NotOpen,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("message needs {stored} bytes but the buffer holds {capacity}")]
    MessageTooLarge { stored: usize, capacity: usize },
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),
    #[error("queue is corrupt: {0}")]
    CorruptQueue(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("slot index {index} is outside 0..{nslots}")]
    InvalidSlot { index: i32, nslots: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("queue {0} does not exist")]
    NotFound(String),
    #[error("message id {0} is not in the queue")]
    IdNotFound(i32),
    #[error("queue handle is read-only")]
    ReadOnly,
    #[error("compression error: {0}")]
    Compression(io::Error),
}

pub type FmqResult<T> = Result<T, FmqError>;
