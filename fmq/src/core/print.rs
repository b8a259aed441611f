use std::io::Write;

use super::Fmq;
use crate::errors::{DeviceError, FmqResult};

impl Fmq {
    /// Dumps the status record and every active slot for debugging.
    pub fn print_status(&mut self, out: &mut dyn Write) -> FmqResult<()> {
        self.ensure_open()?;
        let status = self.read_status()?;
        let slots = self.slots()?;
        let stats = self.stats;
        let cursor = self.cursor;
        let free = status.free_space();
        let name = self.dev.describe();

        let mut dump = || -> std::io::Result<()> {
            writeln!(out, "FMQ {}", name)?;
            writeln!(out, "  {}", status)?;
            writeln!(out, "  free bytes {}, last written at {}", free, status.time_written)?;
            writeln!(
                out,
                "  cursor id {} slot {}, skips {}, lost {}",
                cursor.last_id_read, cursor.last_slot_read, stats.skips, stats.lost
            )?;
            for (index, slot) in slots.iter().enumerate().filter(|(_, s)| s.active) {
                writeln!(
                    out,
                    "  slot {:6} id {:10} type {:6}/{:<6} len {:8} stored {:8} at {:10}{}",
                    index,
                    slot.id,
                    slot.msg_type,
                    slot.subtype,
                    slot.msg_len,
                    slot.stored_len,
                    slot.offset,
                    if slot.compressed { " zlib" } else { "" }
                )?;
            }
            out.flush()
        };
        dump().map_err(DeviceError::from)?;
        Ok(())
    }
}
