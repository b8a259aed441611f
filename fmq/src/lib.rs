//! File Message Queue: a persistent, ring-buffered message queue shared
//! between processes through a pair of files or shared-memory segments.

pub mod compress;
pub mod core;
pub mod device;
pub mod errors;
pub mod heartbeat;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::compress::{compress_payload, CompressionMethod};
pub use crate::core::layout::{MessageId, QueueStatus, SlotRecord, MAX_ID};
pub use crate::core::{Fmq, FmqConfig, Message, OpenMode, ReadCursor, ReadStats, StartPosition};
pub use crate::errors::{DeviceError, FmqError, FmqResult};
pub use crate::heartbeat::Heartbeat;
pub use crate::reader::Seek;
