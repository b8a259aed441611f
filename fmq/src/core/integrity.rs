use tracing::{info, warn};

use super::layout::{validate_entry, QueueStatus, SlotRecord, MAX_ID, SLOT_LEN, STATUS_LEN};
use super::ring::{in_active_region, prev_id, prev_slot};
use super::{now_secs, Fmq, ReadCursor};
use crate::device::Region;
use crate::errors::{FmqError, FmqResult};

impl Fmq {
    /// Checks that the slot flags agree with the active region and that every
    /// active entry can be read back. A writable handle resets a queue that
    /// fails the check and returns `Ok(false)`; a read-only one reports
    /// `CorruptQueue`.
    pub fn check_integrity(&mut self) -> FmqResult<bool> {
        self.ensure_open()?;
        let writable = self.is_writable();
        let problem = self.with_lock(|q| {
            let problem = q.find_inconsistency()?;
            if problem.is_some() && writable {
                q.reinitialize_locked()?;
            }
            Ok(problem)
        })?;
        match problem {
            None => Ok(true),
            Some(problem) if writable => {
                warn!("{} was corrupt ({}); queue reset to empty", self.dev.describe(), problem);
                Ok(false)
            }
            Some(problem) => Err(FmqError::CorruptQueue(problem)),
        }
    }

    /// Re-lays the status record and frees every slot.
    pub fn clear_and_reinitialize(&mut self) -> FmqResult<()> {
        self.ensure_writable()?;
        self.with_lock(|q| q.reinitialize_locked())
    }

    pub(crate) fn reinitialize_locked(&mut self) -> FmqResult<()> {
        let mut status = QueueStatus::new(self.nslots, self.buf_size);
        status.blocking_write = self.cfg.blocking_write;
        status.time_written = now_secs();

        let free = SlotRecord::free().encode();
        let mut slots = Vec::with_capacity(self.nslots * SLOT_LEN);
        for _ in 0..self.nslots {
            slots.extend_from_slice(&free);
        }
        self.dev.seek(Region::Status, STATUS_LEN)?;
        self.dev.write(Region::Status, &slots)?;
        self.write_status(&mut status)?;
        self.cursor = ReadCursor::default();
        info!("initialised {}", self.dev.describe());
        Ok(())
    }

    /// Reads and validates the framing of the entry `slot` points at,
    /// returning its padded payload. The inner error describes a bad entry.
    pub(crate) fn load_entry(
        &mut self,
        index: i32,
        slot: &SlotRecord,
    ) -> FmqResult<Result<Vec<u8>, String>> {
        if slot.offset + slot.stored_len > self.buf_size {
            return Ok(Err(format!(
                "entry at {} of {} bytes overruns the {} byte buffer",
                slot.offset, slot.stored_len, self.buf_size
            )));
        }
        let entry = self.read_entry(slot)?;
        Ok(validate_entry(&entry, index, slot).map(|payload| payload.to_vec()))
    }

    fn find_inconsistency(&mut self) -> FmqResult<Option<String>> {
        let (status, valid) = self.read_status_checked()?;
        if !valid {
            return Ok(Some("status checksum mismatch".to_string()));
        }
        if status.nslots != self.nslots || status.buf_size != self.buf_size {
            return Ok(Some(format!(
                "status declares {} slots / {} bytes, storage holds {} / {}",
                status.nslots, status.buf_size, self.nslots, self.buf_size
            )));
        }
        let nslots = self.nslots as i32;
        let slot_in_range = |i: i32| i >= -1 && i < nslots;
        if !slot_in_range(status.oldest_slot)
            || !slot_in_range(status.youngest_slot)
            || (status.oldest_slot < 0) != (status.youngest_slot < 0)
        {
            return Ok(Some(format!(
                "ring bounds oldest {} youngest {} are invalid",
                status.oldest_slot, status.youngest_slot
            )));
        }
        let regions_ok = status.begin_insert <= status.end_insert
            && status.end_insert <= status.buf_size
            && status.begin_append <= status.buf_size
            && (status.append_mode || status.end_insert <= status.begin_append);
        if !regions_ok {
            return Ok(Some(format!("region pointers are inconsistent: {}", status)));
        }

        for index in 0..nslots {
            let (slot, valid) = self.read_slot_checked(index)?;
            if !valid {
                return Ok(Some(format!("slot {} checksum mismatch", index)));
            }
            let expected = in_active_region(index, status.oldest_slot, status.youngest_slot);
            if slot.active != expected {
                return Ok(Some(format!(
                    "slot {} is {} but lies {} the active region",
                    index,
                    if slot.active { "active" } else { "free" },
                    if expected { "inside" } else { "outside" }
                )));
            }
            if !slot.active {
                continue;
            }
            if index == status.youngest_slot && slot.id != status.youngest_id {
                return Ok(Some(format!(
                    "youngest slot {} holds id {}, status says {}",
                    index, slot.id, status.youngest_id
                )));
            }
            if let Err(reason) = self.load_entry(index, &slot)? {
                return Ok(Some(format!("slot {}: {}", index, reason)));
            }
        }
        Ok(None)
    }

    /// Heuristic recovery for a queue whose status record was lost.
    ///
    /// Picks the slot with the highest id (treating ids as wrapped when they
    /// span more than half the id space), walks backwards while neighbouring
    /// slots hold consecutive ids, and rebuilds the region pointers from the
    /// offsets of that chain. Slots outside the chain are freed. The result is
    /// a guess: run [`Fmq::check_integrity`] afterwards. Returns false when no
    /// live slot survived and the queue was reset instead.
    pub fn recover_heuristic(&mut self) -> FmqResult<bool> {
        self.ensure_writable()?;
        self.with_lock(|q| q.recover_locked())
    }

    fn recover_locked(&mut self) -> FmqResult<bool> {
        let nslots = self.nslots;
        let mut live: Vec<Option<SlotRecord>> = Vec::with_capacity(nslots);
        for index in 0..nslots as i32 {
            let (slot, valid) = self.read_slot_checked(index)?;
            live.push(if valid && slot.active { Some(slot) } else { None });
        }

        let ids: Vec<i32> = live.iter().flatten().map(|s| s.id).collect();
        let (min, max) = match (ids.iter().min(), ids.iter().max()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => {
                warn!("no live slot in {}; resetting", self.dev.describe());
                self.reinitialize_locked()?;
                return Ok(false);
            }
        };
        let wrapped = max - min > MAX_ID / 2;
        let rank = |id: i32| -> i64 {
            if wrapped && id < MAX_ID / 2 {
                id as i64 + MAX_ID as i64
            } else {
                id as i64
            }
        };
        let youngest = live
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, rank(s.id))))
            .max_by_key(|&(_, r)| r)
            .map(|(i, _)| i as i32)
            .unwrap_or(0);

        // Oldest first.
        let mut chain: Vec<(i32, SlotRecord)> = Vec::new();
        let mut index = youngest;
        while let Some(slot) = live[index as usize] {
            if let Some(&(_, newer)) = chain.last() {
                if slot.id != prev_id(newer.id) {
                    break;
                }
            }
            chain.push((index, slot));
            if chain.len() == nslots {
                break;
            }
            index = prev_slot(index, nslots);
        }
        chain.reverse();
        let oldest = chain[0].0;
        for index in 0..nslots as i32 {
            if !in_active_region(index, oldest, youngest) {
                self.write_slot(index, &mut SlotRecord::free())?;
            }
        }

        let first = chain[0].1;
        let last = chain[chain.len() - 1].1;
        let mut status = QueueStatus::new(nslots, self.buf_size);
        status.youngest_id = last.id;
        status.youngest_slot = youngest;
        status.oldest_slot = oldest;
        status.blocking_write = self.cfg.blocking_write;
        status.time_written = now_secs();
        // Entries follow id order unless the writer went back to the start of the buffer.
        match chain.windows(2).position(|w| w[1].1.offset < w[0].1.offset) {
            None => {
                status.append_mode = true;
                status.begin_insert = 0;
                status.end_insert = first.offset;
                status.begin_append = last.offset + last.stored_len;
            }
            Some(at) => {
                let before_wrap = chain[at].1;
                status.append_mode = false;
                status.begin_insert = last.offset + last.stored_len;
                status.end_insert = first.offset;
                status.begin_append = before_wrap.offset + before_wrap.stored_len;
            }
        }
        self.write_status(&mut status)?;
        warn!(
            "rebuilt {} by heuristic: ids {}..={} in slots {}..={}",
            self.dev.describe(),
            first.id,
            last.id,
            oldest,
            youngest
        );
        Ok(true)
    }
}
