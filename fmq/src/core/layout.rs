//! On-storage layout of the queue.
//!
//! The status region starts with a [`QueueStatus`] record followed by
//! `nslots` [`SlotRecord`]s. The buffer region holds framed message entries:
//!
//! ```text
//! ENTRY_MAGIC | slot index | payload (padded to 4 bytes) | message id
//! ```
//!
//! Every integer is stored big-endian whatever the host order is.

use std::fmt;

pub const STATUS_MAGIC: i32 = 0x464d_5153;
pub const ENTRY_MAGIC: i32 = 0x464d_5145;

pub const STATUS_LEN: usize = 64;
pub const SLOT_LEN: usize = 48;
pub const FRAMING_OVERHEAD: usize = 12;

/// Ids wrap at this value, independently of slot indices.
pub const MAX_ID: i32 = 1_000_000_000;
pub const MAX_SLOTS: usize = 1_000_000;

pub type MessageId = i32;

#[inline]
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[inline]
pub fn stored_len(body_len: usize) -> usize {
    pad4(body_len) + FRAMING_OVERHEAD
}

#[inline]
pub fn status_region_len(nslots: usize) -> usize {
    STATUS_LEN + nslots * SLOT_LEN
}

#[inline]
pub fn slot_offset(index: usize) -> usize {
    STATUS_LEN + index * SLOT_LEN
}

/// Number of slots that fit in a status region of `len` bytes.
pub fn nslots_for_region(len: usize) -> usize {
    len.saturating_sub(STATUS_LEN) / SLOT_LEN
}

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_be_bytes(out)
}

fn get_i64(buf: &[u8], offset: usize) -> i64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_be_bytes(out)
}

// Lengths and offsets are bounded by buf_size, which is validated against i32::MAX.
fn get_len(buf: &[u8], offset: usize) -> usize {
    get_i32(buf, offset).max(0) as usize
}

fn fold_time(time: i64) -> i32 {
    (time as i32).wrapping_add((time >> 32) as i32)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub magic: i32,
    pub youngest_id: MessageId,
    pub youngest_slot: i32,
    pub oldest_slot: i32,
    pub nslots: usize,
    pub buf_size: usize,
    pub begin_insert: usize,
    pub end_insert: usize,
    pub begin_append: usize,
    pub append_mode: bool,
    pub blocking_write: bool,
    /// Highest id a reader has consumed, published for blocking writers.
    pub last_id_read: MessageId,
    pub time_written: i64,
    pub checksum: i32,
}

impl QueueStatus {
    /// Status of a freshly created, empty queue.
    pub fn new(nslots: usize, buf_size: usize) -> QueueStatus {
        let mut status = QueueStatus {
            magic: STATUS_MAGIC,
            youngest_id: -1,
            youngest_slot: -1,
            oldest_slot: -1,
            nslots,
            buf_size,
            begin_insert: 0,
            end_insert: 0,
            begin_append: 0,
            append_mode: true,
            blocking_write: false,
            last_id_read: -1,
            time_written: 0,
            checksum: 0,
        };
        status.checksum = status.compute_checksum();
        status
    }

    pub fn is_empty(&self) -> bool {
        self.youngest_id < 0 || self.oldest_slot < 0 || self.youngest_slot < 0
    }

    pub fn compute_checksum(&self) -> i32 {
        self.magic
            .wrapping_add(self.youngest_id)
            .wrapping_add(!self.youngest_slot)
            .wrapping_add(self.oldest_slot)
            .wrapping_add(!(self.nslots as i32))
            .wrapping_add(self.buf_size as i32)
            .wrapping_add(self.begin_insert as i32)
            .wrapping_add(!(self.end_insert as i32))
            .wrapping_add(self.begin_append as i32)
            .wrapping_add(self.append_mode as i32)
            .wrapping_add(self.blocking_write as i32)
            .wrapping_add(!self.last_id_read)
            .wrapping_add(fold_time(self.time_written))
    }

    pub fn stamp(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn checksum_ok(&self) -> bool {
        self.magic == STATUS_MAGIC && self.checksum == self.compute_checksum()
    }

    pub fn encode(&self) -> [u8; STATUS_LEN] {
        let mut buf = [0u8; STATUS_LEN];
        put_i32(&mut buf, 0, self.magic);
        put_i32(&mut buf, 4, self.youngest_id);
        put_i32(&mut buf, 8, self.youngest_slot);
        put_i32(&mut buf, 12, self.oldest_slot);
        put_i32(&mut buf, 16, self.nslots as i32);
        put_i32(&mut buf, 20, self.buf_size as i32);
        put_i32(&mut buf, 24, self.begin_insert as i32);
        put_i32(&mut buf, 28, self.end_insert as i32);
        put_i32(&mut buf, 32, self.begin_append as i32);
        put_i32(&mut buf, 36, self.append_mode as i32);
        put_i32(&mut buf, 40, self.blocking_write as i32);
        put_i32(&mut buf, 44, self.last_id_read);
        put_i64(&mut buf, 48, self.time_written);
        put_i32(&mut buf, 56, self.checksum);
        buf
    }

    pub fn decode(buf: &[u8]) -> QueueStatus {
        QueueStatus {
            magic: get_i32(buf, 0),
            youngest_id: get_i32(buf, 4),
            youngest_slot: get_i32(buf, 8),
            oldest_slot: get_i32(buf, 12),
            nslots: get_len(buf, 16),
            buf_size: get_len(buf, 20),
            begin_insert: get_len(buf, 24),
            end_insert: get_len(buf, 28),
            begin_append: get_len(buf, 32),
            append_mode: get_i32(buf, 36) != 0,
            blocking_write: get_i32(buf, 40) != 0,
            last_id_read: get_i32(buf, 44),
            time_written: get_i64(buf, 48),
            checksum: get_i32(buf, 56),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "youngest id {} slot {}, oldest slot {}, nslots {}, buf_size {}, \
             insert [{}, {}), append from {} ({} mode), blocking_write {}, last_id_read {}",
            self.youngest_id,
            self.youngest_slot,
            self.oldest_slot,
            self.nslots,
            self.buf_size,
            self.begin_insert,
            self.end_insert,
            self.begin_append,
            if self.append_mode { "append" } else { "insert" },
            self.blocking_write,
            self.last_id_read,
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotRecord {
    pub active: bool,
    pub id: MessageId,
    /// Length handed to the writer, before compression.
    pub msg_len: usize,
    /// Padded entry length including framing.
    pub stored_len: usize,
    pub offset: usize,
    pub msg_type: i32,
    pub subtype: i32,
    pub compressed: bool,
    pub time: i64,
    pub checksum: i32,
}

impl SlotRecord {
    /// A zeroed, inactive slot carrying a valid checksum.
    pub fn free() -> SlotRecord {
        let mut slot = SlotRecord::default();
        slot.stamp();
        slot
    }

    pub fn compute_checksum(&self) -> i32 {
        (self.active as i32)
            .wrapping_add(!self.id)
            .wrapping_add(self.msg_len as i32)
            .wrapping_add(self.stored_len as i32)
            .wrapping_add(!(self.offset as i32))
            .wrapping_add(self.msg_type)
            .wrapping_add(!self.subtype)
            .wrapping_add(self.compressed as i32)
            .wrapping_add(fold_time(self.time))
    }

    pub fn stamp(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn encode(&self) -> [u8; SLOT_LEN] {
        let mut buf = [0u8; SLOT_LEN];
        put_i32(&mut buf, 0, self.active as i32);
        put_i32(&mut buf, 4, self.id);
        put_i32(&mut buf, 8, self.msg_len as i32);
        put_i32(&mut buf, 12, self.stored_len as i32);
        put_i32(&mut buf, 16, self.offset as i32);
        put_i32(&mut buf, 20, self.msg_type);
        put_i32(&mut buf, 24, self.subtype);
        put_i32(&mut buf, 28, self.compressed as i32);
        put_i64(&mut buf, 32, self.time);
        put_i32(&mut buf, 40, self.checksum);
        buf
    }

    pub fn decode(buf: &[u8]) -> SlotRecord {
        SlotRecord {
            active: get_i32(buf, 0) != 0,
            id: get_i32(buf, 4),
            msg_len: get_len(buf, 8),
            stored_len: get_len(buf, 12),
            offset: get_len(buf, 16),
            msg_type: get_i32(buf, 20),
            subtype: get_i32(buf, 24),
            compressed: get_i32(buf, 28) != 0,
            time: get_i64(buf, 32),
            checksum: get_i32(buf, 40),
        }
    }
}

/// Frames `body` for slot `slot_index`. The result is `stored_len(body.len())` long.
pub fn encode_entry(slot_index: i32, id: MessageId, body: &[u8]) -> Vec<u8> {
    let len = stored_len(body.len());
    let mut buf = vec![0u8; len];
    put_i32(&mut buf, 0, ENTRY_MAGIC);
    put_i32(&mut buf, 4, slot_index);
    buf[8..8 + body.len()].copy_from_slice(body);
    put_i32(&mut buf, len - 4, id);
    buf
}

/// Checks the framing of `entry` against the slot that points at it and
/// returns the padded payload.
pub fn validate_entry<'a>(
    entry: &'a [u8],
    slot_index: i32,
    slot: &SlotRecord,
) -> Result<&'a [u8], String> {
    if entry.len() < FRAMING_OVERHEAD || entry.len() != slot.stored_len {
        return Err(format!(
            "entry length {} does not match stored length {}",
            entry.len(),
            slot.stored_len
        ));
    }
    let magic = get_i32(entry, 0);
    if magic != ENTRY_MAGIC {
        return Err(format!("bad entry magic {:#x}", magic));
    }
    let framed_slot = get_i32(entry, 4);
    if framed_slot != slot_index {
        return Err(format!("entry framed for slot {}, expected {}", framed_slot, slot_index));
    }
    let framed_id = get_i32(entry, entry.len() - 4);
    if framed_id != slot.id {
        return Err(format!("entry carries id {}, slot has {}", framed_id, slot.id));
    }
    Ok(&entry[8..entry.len() - 4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_big_endian() {
        let status = QueueStatus::new(4, 1024);
        let buf = status.encode();
        assert_eq!(&buf[0..4], &STATUS_MAGIC.to_be_bytes());
        assert_eq!(&buf[4..8], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&buf[16..20], &[0, 0, 0, 4]);
        assert_eq!(&buf[20..24], &[0, 0, 4, 0]);
    }

    #[test]
    fn status_decode_restores_fields() {
        let mut status = QueueStatus::new(16, 4096);
        status.youngest_id = 41;
        status.youngest_slot = 3;
        status.oldest_slot = 9;
        status.append_mode = false;
        status.begin_insert = 128;
        status.end_insert = 512;
        status.begin_append = 4000;
        status.time_written = 1_700_000_000;
        status.stamp();
        let decoded = QueueStatus::decode(&status.encode());
        assert_eq!(decoded, status);
        assert!(decoded.checksum_ok());
    }

    #[test]
    fn zeroed_status_fails_checksum() {
        let status = QueueStatus::decode(&[0u8; STATUS_LEN]);
        assert!(!status.checksum_ok());
    }

    #[test]
    fn status_checksum_catches_swapped_fields() {
        let mut status = QueueStatus::new(8, 2048);
        status.youngest_slot = 2;
        status.oldest_slot = 5;
        status.stamp();
        let mut swapped = status;
        swapped.youngest_slot = 5;
        swapped.oldest_slot = 2;
        assert!(!swapped.checksum_ok());
    }

    #[test]
    fn slot_checksum_detects_change() {
        let mut slot = SlotRecord {
            active: true,
            id: 7,
            msg_len: 100,
            stored_len: 112,
            offset: 224,
            msg_type: 3,
            subtype: 1,
            compressed: false,
            time: 12345,
            checksum: 0,
        };
        slot.stamp();
        let decoded = SlotRecord::decode(&slot.encode());
        assert!(decoded.checksum_ok());
        let mut moved = decoded;
        moved.offset = 336;
        assert!(!moved.checksum_ok());
    }

    #[test]
    fn free_slot_is_valid_and_inactive() {
        let slot = SlotRecord::decode(&SlotRecord::free().encode());
        assert!(slot.checksum_ok());
        assert!(!slot.active);
    }

    #[test]
    fn entry_framing() {
        let body = b"hello";
        let entry = encode_entry(2, 99, body);
        assert_eq!(entry.len(), 8 + FRAMING_OVERHEAD);
        assert_eq!(&entry[0..4], &ENTRY_MAGIC.to_be_bytes());
        assert_eq!(&entry[entry.len() - 4..], &99i32.to_be_bytes());

        let slot = SlotRecord {
            active: true,
            id: 99,
            msg_len: body.len(),
            stored_len: entry.len(),
            ..SlotRecord::default()
        };
        let payload = validate_entry(&entry, 2, &slot).unwrap();
        assert_eq!(&payload[..body.len()], body);
        assert!(validate_entry(&entry, 3, &slot).is_err());

        let mut torn = entry.clone();
        let end = torn.len();
        torn[end - 1] ^= 0x01;
        assert!(validate_entry(&torn, 2, &slot).is_err());
    }

    #[test]
    fn padding() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(stored_len(100), 112);
        assert_eq!(nslots_for_region(status_region_len(37)), 37);
    }
}
