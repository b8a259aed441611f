//! Slot ring arithmetic and data-buffer space bookkeeping.
//!
//! The buffer is split into an append region growing from `begin_append`
//! towards the end, and an insert region `[begin_insert, end_insert)` holding
//! space reclaimed from expired messages near the start. The oldest message
//! always starts at `end_insert`.

use super::layout::{MessageId, QueueStatus, SlotRecord, MAX_ID};

#[inline]
pub fn next_slot(index: i32, nslots: usize) -> i32 {
    (index + 1).rem_euclid(nslots as i32)
}

#[inline]
pub fn prev_slot(index: i32, nslots: usize) -> i32 {
    (index - 1).rem_euclid(nslots as i32)
}

#[inline]
pub fn next_id(id: MessageId) -> MessageId {
    (id + 1).rem_euclid(MAX_ID)
}

#[inline]
pub fn prev_id(id: MessageId) -> MessageId {
    (id - 1).rem_euclid(MAX_ID)
}

/// Wrap-aware "`a` was assigned before `b`". `-1` precedes every id near the start.
pub fn id_before(a: MessageId, b: MessageId) -> bool {
    let distance = (b - a).rem_euclid(MAX_ID);
    distance > 0 && distance < MAX_ID / 2
}

/// Number of ids strictly between `from` and `to`.
pub fn ids_between(from: MessageId, to: MessageId) -> u64 {
    let distance = (to - from).rem_euclid(MAX_ID);
    distance.saturating_sub(1) as u64
}

pub fn in_active_region(index: i32, oldest: i32, youngest: i32) -> bool {
    if oldest < 0 || youngest < 0 {
        return false;
    }
    if youngest >= oldest {
        index >= oldest && index <= youngest
    } else {
        index >= oldest || index <= youngest
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    /// The entry fits at this buffer offset.
    Available(usize),
    /// Switched from append to insert mode; ask again.
    Retry,
    /// The insert region is too small; free the oldest slot and ask again.
    EvictOldest,
}

impl QueueStatus {
    pub fn check_space(&mut self, needed: usize) -> Space {
        if self.append_mode {
            if self.buf_size.saturating_sub(self.begin_append) >= needed {
                Space::Available(self.begin_append)
            } else {
                self.append_mode = false;
                Space::Retry
            }
        } else if self.end_insert.saturating_sub(self.begin_insert) >= needed {
            Space::Available(self.begin_insert)
        } else {
            Space::EvictOldest
        }
    }

    /// Moves the live region pointer past an entry just placed at `offset`.
    pub fn commit_space(&mut self, offset: usize, stored_len: usize) {
        if self.append_mode {
            self.begin_append = offset + stored_len;
        } else {
            self.begin_insert = offset + stored_len;
        }
    }

    /// Releases the buffer space of `slot`, which must be the oldest active slot.
    pub fn release_oldest(&mut self, slot: &SlotRecord) -> Result<(), String> {
        if self.oldest_slot < 0 {
            return Err("no active slot to free".to_string());
        }
        if slot.offset != self.end_insert {
            return Err(format!(
                "oldest slot {} starts at {}, insert region ends at {}",
                self.oldest_slot, slot.offset, self.end_insert
            ));
        }
        self.end_insert += slot.stored_len;

        if self.oldest_slot == self.youngest_slot {
            self.reset_empty();
            return Ok(());
        }
        if self.end_insert > self.begin_append {
            return Err(format!(
                "insert region end {} passed append begin {}",
                self.end_insert, self.begin_append
            ));
        }
        if self.end_insert == self.begin_append {
            // Older entries are gone: what remains starts at offset 0.
            self.begin_append = self.begin_insert;
            self.begin_insert = 0;
            self.end_insert = 0;
            self.append_mode = true;
        }
        self.oldest_slot = next_slot(self.oldest_slot, self.nslots);
        Ok(())
    }

    /// Forgets every slot while keeping the id sequence going.
    pub fn reset_empty(&mut self) {
        self.oldest_slot = -1;
        self.youngest_slot = -1;
        self.begin_insert = 0;
        self.end_insert = 0;
        self.begin_append = 0;
        self.append_mode = true;
    }

    /// Free bytes the allocator can still hand out without evicting.
    pub fn free_space(&self) -> usize {
        let insert = self.end_insert.saturating_sub(self.begin_insert);
        let tail = self.buf_size.saturating_sub(self.begin_append);
        if self.append_mode {
            insert + tail
        } else {
            insert
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_at(offset: usize, stored_len: usize) -> SlotRecord {
        SlotRecord {
            active: true,
            offset,
            stored_len,
            ..SlotRecord::default()
        }
    }

    #[test]
    fn slot_and_id_wrap() {
        assert_eq!(next_slot(3, 4), 0);
        assert_eq!(next_slot(-1, 4), 0);
        assert_eq!(prev_slot(0, 4), 3);
        assert_eq!(next_id(MAX_ID - 1), 0);
        assert_eq!(next_id(-1), 0);
        assert_eq!(prev_id(0), MAX_ID - 1);
    }

    #[test]
    fn id_ordering_wraps() {
        assert!(id_before(1, 2));
        assert!(!id_before(2, 2));
        assert!(!id_before(3, 2));
        assert!(id_before(-1, 0));
        assert!(id_before(MAX_ID - 2, 1));
        assert_eq!(ids_between(1, 4), 2);
        assert_eq!(ids_between(MAX_ID - 1, 0), 0);
        assert_eq!(ids_between(-1, 2), 2);
    }

    #[test]
    fn active_region_membership() {
        assert!(!in_active_region(0, -1, -1));
        assert!(in_active_region(2, 1, 3));
        assert!(!in_active_region(0, 1, 3));
        // wrapped
        assert!(in_active_region(3, 2, 0));
        assert!(in_active_region(0, 2, 0));
        assert!(!in_active_region(1, 2, 0));
    }

    #[test]
    fn append_until_full_then_flip() {
        let mut status = QueueStatus::new(8, 100);
        assert_eq!(status.check_space(40), Space::Available(0));
        status.commit_space(0, 40);
        assert_eq!(status.check_space(40), Space::Available(40));
        status.commit_space(40, 40);
        assert_eq!(status.check_space(40), Space::Retry);
        assert!(!status.append_mode);
        assert_eq!(status.check_space(40), Space::EvictOldest);
    }

    #[test]
    fn eviction_opens_insert_region() {
        let mut status = QueueStatus::new(8, 100);
        status.commit_space(0, 40);
        status.commit_space(40, 40);
        status.oldest_slot = 0;
        status.youngest_slot = 1;
        assert_eq!(status.check_space(40), Space::Retry);
        status.release_oldest(&slot_at(0, 40)).unwrap();
        assert_eq!(status.oldest_slot, 1);
        assert_eq!(status.check_space(40), Space::Available(0));
        status.commit_space(0, 40);
        assert_eq!(status.begin_insert, 40);
        assert_eq!(status.begin_append, 80);
    }

    #[test]
    fn regions_merge_when_old_entries_expire() {
        let mut status = QueueStatus::new(8, 100);
        status.oldest_slot = 1;
        status.youngest_slot = 2;
        status.append_mode = false;
        status.begin_insert = 30;
        status.end_insert = 40;
        status.begin_append = 80;
        status.release_oldest(&slot_at(40, 40)).unwrap();
        assert!(status.append_mode);
        assert_eq!(status.begin_append, 30);
        assert_eq!((status.begin_insert, status.end_insert), (0, 0));
        assert_eq!(status.oldest_slot, 2);
    }

    #[test]
    fn freeing_last_slot_empties_layout() {
        let mut status = QueueStatus::new(4, 100);
        status.oldest_slot = 2;
        status.youngest_slot = 2;
        status.youngest_id = 9;
        status.end_insert = 16;
        status.begin_append = 40;
        status.release_oldest(&slot_at(16, 24)).unwrap();
        assert_eq!((status.oldest_slot, status.youngest_slot), (-1, -1));
        assert_eq!(status.youngest_id, 9);
        assert_eq!(status.free_space(), 100);
    }

    #[test]
    fn misplaced_oldest_is_reported() {
        let mut status = QueueStatus::new(4, 100);
        status.oldest_slot = 0;
        status.youngest_slot = 1;
        status.begin_append = 80;
        assert!(status.release_oldest(&slot_at(12, 40)).is_err());
    }
}
