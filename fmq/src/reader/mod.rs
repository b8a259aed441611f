use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::compress;
use crate::core::layout::{MessageId, QueueStatus, SlotRecord, MAX_ID};
use crate::core::ring::{id_before, ids_between, next_id, next_slot, prev_id, prev_slot};
use crate::core::{Fmq, Message, ReadCursor, CHECKSUM_RETRIES, RETRY_WAIT};
use crate::errors::{FmqError, FmqResult};

enum Settled {
    Payload(Vec<u8>),
    /// The slot was reused while its entry was copied.
    Moved,
    Damaged(String),
}

/// Cursor moves relative to the queue contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seek {
    /// Before the oldest message, so the next read returns it.
    Start,
    /// After the youngest message; only new writes are returned.
    End,
    /// Before the youngest message.
    Last,
    /// One message back from the current position.
    Back,
}

impl Fmq {
    /// Returns the next message after the cursor, or `None` when the reader
    /// has caught up. With `type_filter` set, other message types are skipped.
    pub fn read_next(&mut self, type_filter: Option<i32>) -> FmqResult<Option<Message>> {
        loop {
            match self.read_one()? {
                None => return Ok(None),
                Some(msg) if type_filter.map_or(true, |t| t == msg.msg_type) => return Ok(Some(msg)),
                Some(msg) => debug!("skipped id {} of type {}", msg.id, msg.msg_type),
            }
        }
    }

    /// Polls until a message arrives. `timeout` overrides the configured
    /// read timeout; with neither set this waits forever.
    pub fn read_blocking(
        &mut self,
        type_filter: Option<i32>,
        timeout: Option<Duration>,
    ) -> FmqResult<Message> {
        let limit = timeout.or_else(|| self.cfg.read_timeout_ms.map(Duration::from_millis));
        let started = Instant::now();
        loop {
            if let Some(msg) = self.read_next(type_filter)? {
                return Ok(msg);
            }
            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    return Err(FmqError::Timeout(limit));
                }
            }
            self.heartbeat.beat("FMQ: waiting for data");
            thread::sleep(self.cfg.poll_interval_duration());
        }
    }

    pub fn seek(&mut self, pos: Seek) -> FmqResult<()> {
        self.ensure_open()?;
        let status = self.read_status()?;
        let end = ReadCursor {
            last_id_read: status.youngest_id,
            last_slot_read: status.youngest_slot,
        };
        self.cursor = match pos {
            Seek::End => end,
            Seek::Start | Seek::Last if status.is_empty() => end,
            Seek::Start => {
                // Consecutive slots hold consecutive ids.
                let count = (status.youngest_slot - status.oldest_slot).rem_euclid(self.nslots as i32) + 1;
                ReadCursor {
                    last_id_read: (status.youngest_id - count).rem_euclid(MAX_ID),
                    last_slot_read: prev_slot(status.oldest_slot, self.nslots),
                }
            }
            Seek::Last => ReadCursor {
                last_id_read: prev_id(status.youngest_id),
                last_slot_read: prev_slot(status.youngest_slot, self.nslots),
            },
            Seek::Back if self.cursor.last_slot_read < 0 => self.cursor,
            Seek::Back => ReadCursor {
                last_id_read: prev_id(self.cursor.last_id_read),
                last_slot_read: prev_slot(self.cursor.last_slot_read, self.nslots),
            },
        };
        debug!("seek {:?}: cursor now id {} slot {}", pos, self.cursor.last_id_read, self.cursor.last_slot_read);
        Ok(())
    }

    /// Positions the cursor on `id`, so the next read returns the message after it.
    pub fn seek_to_id(&mut self, id: MessageId) -> FmqResult<()> {
        self.ensure_open()?;
        for index in 0..self.nslots as i32 {
            let slot = self.read_slot(index)?;
            if slot.active && slot.id == id {
                self.cursor = ReadCursor {
                    last_id_read: id,
                    last_slot_read: index,
                };
                return Ok(());
            }
        }
        Err(FmqError::IdNotFound(id))
    }

    fn read_one(&mut self) -> FmqResult<Option<Message>> {
        self.ensure_open()?;
        let mut problem = None;
        for _ in 0..CHECKSUM_RETRIES {
            let status = self.read_status()?;
            if status.youngest_id < 0 {
                self.cursor = ReadCursor::default();
                return Ok(None);
            }
            self.publish_if_lagging(&status)?;
            if status.is_empty() || self.cursor.last_id_read == status.youngest_id {
                return Ok(None);
            }

            let wanted = next_id(self.cursor.last_id_read);
            let mut index = if self.cursor.last_slot_read < self.nslots as i32 {
                next_slot(self.cursor.last_slot_read, self.nslots)
            } else {
                status.oldest_slot
            };
            let mut slot = self.read_slot(index)?;
            if !slot.active || slot.id != wanted {
                index = status.oldest_slot;
                slot = self.read_slot(index)?;
                if !slot.active {
                    continue;
                }
                self.note_overtaken(wanted, slot.id);
            }

            let payload = match self.read_settled(index, &slot)? {
                Settled::Payload(payload) => payload,
                Settled::Moved => continue,
                Settled::Damaged(reason) => {
                    problem = Some(format!("slot {}: {}", index, reason));
                    thread::sleep(RETRY_WAIT);
                    continue;
                }
            };

            self.cursor = ReadCursor {
                last_id_read: slot.id,
                last_slot_read: index,
            };
            if status.blocking_write {
                self.publish_consumed()?;
            }
            return Ok(Some(Message {
                id: slot.id,
                slot: index,
                msg_type: slot.msg_type,
                subtype: slot.subtype,
                timestamp: slot.time,
                payload,
            }));
        }

        match problem {
            None => Ok(None),
            Some(problem) if self.is_writable() => {
                warn!("{} is corrupt ({}), resetting", self.dev.describe(), problem);
                self.clear_and_reinitialize()?;
                Ok(None)
            }
            Some(problem) => Err(FmqError::CorruptQueue(problem)),
        }
    }

    /// Copies the entry `slot` describes, then re-reads the slot. A writer that
    /// reused the space during the copy changes the slot; damage does not.
    fn read_settled(&mut self, index: i32, slot: &SlotRecord) -> FmqResult<Settled> {
        let decoded = self.decode_message(index, slot)?;
        if self.read_slot(index)? != *slot {
            debug!("slot {} of {} changed while reading", index, self.dev.describe());
            return Ok(Settled::Moved);
        }
        Ok(match decoded {
            Ok(payload) => Settled::Payload(payload),
            Err(reason) => Settled::Damaged(reason),
        })
    }

    fn decode_message(&mut self, index: i32, slot: &SlotRecord) -> FmqResult<Result<Vec<u8>, String>> {
        let mut payload = match self.load_entry(index, slot)? {
            Ok(payload) => payload,
            Err(reason) => return Ok(Err(reason)),
        };
        if slot.compressed {
            return Ok(compress::decompress_payload(&payload, slot.msg_len).map_err(|e| e.to_string()));
        }
        if payload.len() < slot.msg_len {
            return Ok(Err(format!(
                "entry holds {} bytes, slot says {}",
                payload.len(),
                slot.msg_len
            )));
        }
        payload.truncate(slot.msg_len);
        Ok(Ok(payload))
    }

    fn note_overtaken(&mut self, wanted: MessageId, resumed_at: MessageId) {
        let lost = if id_before(wanted, resumed_at) {
            ids_between(prev_id(wanted), resumed_at)
        } else {
            0
        };
        self.stats.skips += 1;
        self.stats.lost += lost;
        warn!(
            "reader of {} overtaken: wanted id {}, resuming at {} ({} lost)",
            self.dev.describe(),
            wanted,
            resumed_at,
            lost
        );
    }

    fn publish_if_lagging(&mut self, status: &QueueStatus) -> FmqResult<()> {
        // A cursor ahead of the youngest id predates a reset and is not published.
        if status.blocking_write
            && self.is_writable()
            && self.cursor.last_id_read >= 0
            && !id_before(status.youngest_id, self.cursor.last_id_read)
            && id_before(status.last_id_read, self.cursor.last_id_read)
        {
            self.publish_consumed()?;
        }
        Ok(())
    }

    /// Records the cursor as consumed so a blocking writer may overwrite up to it.
    fn publish_consumed(&mut self) -> FmqResult<()> {
        if !self.is_writable() {
            return Ok(());
        }
        let consumed = self.cursor.last_id_read;
        self.with_lock(|q| {
            let mut status = q.read_status()?;
            if status.last_id_read != consumed {
                status.last_id_read = consumed;
                q.write_status(&mut status)?;
            }
            Ok(())
        })
    }
}
