use std::borrow::Cow;
use std::thread;

use tracing::{debug, info, warn};

use crate::compress::{self, CompressionMethod};
use crate::core::layout::{encode_entry, stored_len, MessageId, QueueStatus, SlotRecord};
use crate::core::ring::{id_before, next_id, next_slot, Space};
use crate::core::{now_secs, Fmq};
use crate::device::Region;
use crate::errors::{FmqError, FmqResult};

/// A message ready to be framed: the body as it will be stored plus the
/// metadata that goes into its slot.
struct Outgoing<'a> {
    body: Cow<'a, [u8]>,
    msg_len: usize,
    compressed: bool,
    msg_type: i32,
    subtype: i32,
}

enum Attempt {
    Written(MessageId),
    /// Blocking write: this id has not been consumed yet.
    MustWait(MessageId),
}

impl Fmq {
    /// Appends a message and returns its id. With compression configured the
    /// payload is stored compressed only when that makes it smaller.
    pub fn write(&mut self, payload: &[u8], msg_type: i32, subtype: i32) -> FmqResult<MessageId> {
        self.ensure_writable()?;
        let (body, compressed) = match self.cfg.compression {
            CompressionMethod::None => (Cow::Borrowed(payload), false),
            method => {
                let packed = compress::compress_payload(method, payload)?;
                if packed.len() < payload.len() {
                    (Cow::Owned(packed), true)
                } else {
                    (Cow::Borrowed(payload), false)
                }
            }
        };
        self.write_framed(Outgoing {
            body,
            msg_len: payload.len(),
            compressed,
            msg_type,
            subtype,
        })
    }

    /// Appends a payload the caller already compressed with
    /// [`compress_payload`](crate::compress_payload). `uncompressed_len` is
    /// what readers get back after inflating it.
    pub fn write_precompressed(
        &mut self,
        payload: &[u8],
        msg_type: i32,
        subtype: i32,
        uncompressed_len: usize,
    ) -> FmqResult<MessageId> {
        self.ensure_writable()?;
        self.write_framed(Outgoing {
            body: Cow::Borrowed(payload),
            msg_len: uncompressed_len,
            compressed: true,
            msg_type,
            subtype,
        })
    }

    fn write_framed(&mut self, msg: Outgoing<'_>) -> FmqResult<MessageId> {
        let needed = stored_len(msg.body.len());
        if needed > self.buf_size {
            return Err(FmqError::MessageTooLarge {
                stored: needed,
                capacity: self.buf_size,
            });
        }

        let mut reset = false;
        let mut waiting_for = None;
        loop {
            match self.with_lock(|q| q.try_write(&msg, needed)) {
                Ok(Attempt::Written(id)) => {
                    if let Some(blocked) = waiting_for {
                        info!("readers consumed id {}, write resumed", blocked);
                    }
                    return Ok(id);
                }
                Ok(Attempt::MustWait(id)) => {
                    if waiting_for != Some(id) {
                        debug!("blocking write: waiting for readers to consume id {}", id);
                        waiting_for = Some(id);
                    }
                    self.heartbeat.beat("FMQ: blocking write waiting for readers");
                    thread::sleep(self.cfg.poll_interval_duration());
                }
                Err(FmqError::CorruptQueue(reason)) if !reset => {
                    warn!("{} is corrupt ({}), resetting before write", self.dev.describe(), reason);
                    self.clear_and_reinitialize()?;
                    reset = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass of the write protocol, run under the lock.
    fn try_write(&mut self, msg: &Outgoing<'_>, needed: usize) -> FmqResult<Attempt> {
        let mut status = self.read_status()?;
        let write_slot = next_slot(status.youngest_slot, self.nslots);
        let write_id = next_id(status.youngest_id);

        if status.oldest_slot >= 0 && write_slot == status.oldest_slot {
            if let Some(id) = self.free_oldest(&mut status)? {
                return self.park(status, id);
            }
        }

        // Each eviction frees a slot, so the ring empties well before this runs out.
        let limit = 2 * self.nslots + 4;
        let mut offset = None;
        for _ in 0..limit {
            match status.check_space(needed) {
                Space::Available(at) => {
                    offset = Some(at);
                    break;
                }
                Space::Retry => {}
                Space::EvictOldest => {
                    if status.oldest_slot < 0 {
                        return Err(FmqError::CorruptQueue(format!(
                            "empty queue has no room for {} bytes: {}",
                            needed, status
                        )));
                    }
                    if let Some(id) = self.free_oldest(&mut status)? {
                        return self.park(status, id);
                    }
                }
            }
        }
        let offset = offset.ok_or_else(|| {
            FmqError::CorruptQueue(format!("no room for {} bytes after {} passes", needed, limit))
        })?;

        let entry = encode_entry(write_slot, write_id, &msg.body);
        self.dev.seek(Region::Buffer, offset)?;
        self.dev.write(Region::Buffer, &entry)?;

        let now = now_secs();
        let mut slot = SlotRecord {
            active: true,
            id: write_id,
            msg_len: msg.msg_len,
            stored_len: needed,
            offset,
            msg_type: msg.msg_type,
            subtype: msg.subtype,
            compressed: msg.compressed,
            time: now,
            checksum: 0,
        };
        self.write_slot(write_slot, &mut slot)?;

        status.commit_space(offset, needed);
        status.youngest_slot = write_slot;
        if status.oldest_slot < 0 {
            status.oldest_slot = write_slot;
        }
        status.youngest_id = write_id;
        status.time_written = now;
        if self.cfg.blocking_write {
            status.blocking_write = true;
        }
        self.write_status(&mut status)?;
        Ok(Attempt::Written(write_id))
    }

    /// Frees the oldest slot and its buffer space. Returns the id a blocking
    /// writer has to wait for instead, leaving the slot in place.
    fn free_oldest(&mut self, status: &mut QueueStatus) -> FmqResult<Option<MessageId>> {
        let index = status.oldest_slot;
        let slot = self.read_slot(index)?;
        if !slot.active {
            return Err(FmqError::CorruptQueue(format!("oldest slot {} is not active", index)));
        }
        if self.cfg.blocking_write && id_before(status.last_id_read, slot.id) {
            return Ok(Some(slot.id));
        }
        status.release_oldest(&slot).map_err(FmqError::CorruptQueue)?;
        self.write_slot(index, &mut SlotRecord::free())?;
        debug!("expired id {} from slot {}", slot.id, index);
        Ok(None)
    }

    /// Saves what this pass already freed and flags the queue as blocking.
    fn park(&mut self, mut status: QueueStatus, id: MessageId) -> FmqResult<Attempt> {
        status.blocking_write = true;
        self.write_status(&mut status)?;
        Ok(Attempt::MustWait(id))
    }
}
