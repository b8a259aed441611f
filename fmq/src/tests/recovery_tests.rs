use std::error::Error;
use std::fs::OpenOptions;
use std::io::{Seek as _, SeekFrom, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use super::{create_queue, payload_for, queue_path};
use crate::core::layout::{slot_offset, STATUS_LEN};
use crate::{Fmq, FmqConfig, FmqError, OpenMode, Seek, StartPosition};

fn scribble(path: &str, suffix: &str, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(format!("{}{}", path, suffix))?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn read_all(q: &mut Fmq) -> Result<Vec<i32>, FmqError> {
    q.seek(Seek::Start)?;
    let mut ids = Vec::new();
    while let Some(msg) = q.read_next(None)? {
        ids.push(msg.id);
    }
    Ok(ids)
}

#[test]
fn damaged_entry_resets_writable_queue() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 8, 1024)?;
    for n in 0..3 {
        w.write(&payload_for(n, 20), 0, 0)?;
    }
    assert!(w.check_integrity()?);

    scribble(&path, ".buf", 0, &[0xff; 8])?;
    assert!(!w.check_integrity()?);
    let status = w.status()?;
    assert_eq!(status.youngest_id, -1);
    assert!(w.slots()?.iter().all(|s| !s.active));
    assert_eq!(w.write(b"fresh", 0, 0)?, 0);
    Ok(())
}

#[test]
fn damaged_entry_is_reported_to_read_only_handle() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 8, 1024)?;
    w.write(&payload_for(0, 20), 0, 0)?;
    let mut r = Fmq::open(
        FmqConfig::new(&path)
            .mode(OpenMode::ReadOnly)
            .position(StartPosition::Start),
    )?;

    scribble(&path, ".buf", 0, &[0u8; 4])?;
    assert!(matches!(r.check_integrity(), Err(FmqError::CorruptQueue(_))));
    assert!(matches!(r.read_next(None), Err(FmqError::CorruptQueue(_))));
    assert_eq!(w.status()?.youngest_id, 0);
    Ok(())
}

#[test]
fn reader_with_write_access_heals_damage() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 8, 1024)?;
    let mut r = Fmq::open(FmqConfig::new(&path).position(StartPosition::Start))?;
    w.write(&payload_for(0, 20), 0, 0)?;

    scribble(&path, ".buf", 4, &7i32.to_be_bytes())?;
    assert_eq!(r.read_next(None)?, None);
    assert_eq!(r.status()?.youngest_id, -1);

    assert_eq!(w.write(b"after reset", 0, 0)?, 0);
    assert_eq!(r.read_next(None)?.map(|m| m.payload), Some(b"after reset".to_vec()));
    Ok(())
}

#[test]
fn flag_outside_active_region_fails_integrity() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 4, 1024)?;
    w.write(b"one", 0, 0)?;

    // A copy of slot 0 placed in slot 2 is checksum-valid but outside the ring.
    let slot0 = w.slots()?[0].encode();
    scribble(&path, ".stat", slot_offset(2) as u64, &slot0)?;
    assert!(!w.check_integrity()?);
    assert_eq!(w.status()?.youngest_id, -1);
    Ok(())
}

#[test]
fn bad_checksums_fall_back_to_best_effort_copies() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 8, 1024)?;
    for n in 0..3 {
        w.write(&payload_for(n, 24), 0, 0)?;
    }
    let mut r = Fmq::open(FmqConfig::new(&path).position(StartPosition::Start))?;

    scribble(&path, ".stat", slot_offset(1) as u64 + 40, &[0x5a; 4])?;
    scribble(&path, ".stat", 56, &[0x5a; 4])?;
    assert!(!r.read_slot_checked(1)?.1);
    assert!(!r.read_status_checked()?.1);

    let mut got = Vec::new();
    while let Some(msg) = r.read_next(None)? {
        assert_eq!(msg.payload, payload_for(msg.id as u32, 24));
        got.push(msg.id);
    }
    assert_eq!(got, vec![0, 1, 2]);
    assert_eq!(r.read_stats().skips, 0);
    Ok(())
}

#[test]
fn single_writer_skips_the_lock() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut holder = create_queue(&path, 4, 1024)?;
    let cfg = FmqConfig::new(&path).single_writer(true);
    let mut w = Fmq::open(cfg.clone())?;
    let mut r = Fmq::open(cfg.position(StartPosition::Start))?;

    holder.dev.lock()?;
    let (tx, rx) = mpsc::channel();
    let writer = thread::spawn(move || -> Result<(), FmqError> {
        for n in 0..6 {
            w.write(&payload_for(n, 30), 0, 0)?;
        }
        let _ = tx.send(());
        Ok(())
    });
    let finished = rx.recv_timeout(Duration::from_secs(5));
    holder.dev.unlock()?;
    writer.join().map_err(|_| "writer panicked")??;
    assert!(finished.is_ok(), "writer waited for the lock");

    assert_eq!(read_all(&mut r)?, vec![2, 3, 4, 5]);
    Ok(())
}

#[test]
fn lost_status_is_rebuilt_from_slots() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 8, 2048)?;
    for n in 0..5 {
        w.write(&payload_for(n, 40), 0, 0)?;
    }
    let before = w.status()?;
    drop(w);

    scribble(&path, ".stat", 0, &[0u8; STATUS_LEN])?;
    let mut q = Fmq::open(FmqConfig::new(&path))?;
    let after = q.status()?;
    assert_eq!(after.youngest_id, before.youngest_id);
    assert_eq!((after.oldest_slot, after.youngest_slot), (before.oldest_slot, before.youngest_slot));
    assert_eq!(after.begin_append, before.begin_append);
    assert_eq!(after.end_insert, before.end_insert);
    assert_eq!(read_all(&mut q)?, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn heuristic_follows_wrapped_ring() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 4, 1024)?;
    for n in 0..6 {
        w.write(&payload_for(n, 100), 0, 0)?;
    }
    let before = w.status()?;

    scribble(&path, ".stat", 0, &[0u8; STATUS_LEN])?;
    assert!(w.recover_heuristic()?);
    let after = w.status()?;
    assert_eq!(after.youngest_id, 5);
    assert_eq!((after.oldest_slot, after.youngest_slot), (2, 1));
    assert_eq!(after.end_insert, before.end_insert);
    assert_eq!(after.begin_append, before.begin_append);
    assert!(w.check_integrity()?);
    assert_eq!(read_all(&mut w)?, vec![2, 3, 4, 5]);
    Ok(())
}

#[test]
fn heuristic_on_empty_queue_resets() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 4, 512)?;
    assert!(!w.recover_heuristic()?);
    assert_eq!(w.status()?.youngest_id, -1);
    Ok(())
}

#[test]
fn clear_keeps_geometry() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = queue_path(dir.path());
    let mut w = create_queue(&path, 6, 600)?;
    for n in 0..4 {
        w.write(&payload_for(n, 10), 0, 0)?;
    }
    w.clear_and_reinitialize()?;
    let status = w.status()?;
    assert!(status.is_empty());
    assert_eq!((status.nslots, status.buf_size), (6, 600));
    assert_eq!(status.free_space(), 600);
    assert_eq!(w.cursor().last_id_read, -1);
    Ok(())
}
