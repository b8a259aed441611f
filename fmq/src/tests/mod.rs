mod recovery_tests;

use std::path::Path;

use crate::{Fmq, FmqConfig, FmqResult, OpenMode};

pub(crate) fn queue_path(dir: &Path) -> String {
    dir.join("queue").to_string_lossy().into_owned()
}

pub(crate) fn create_queue(path: &str, nslots: usize, buf_size: usize) -> FmqResult<Fmq> {
    Fmq::open(
        FmqConfig::new(path)
            .mode(OpenMode::Create)
            .nslots(nslots)
            .buf_size(buf_size),
    )
}

/// Payload whose bytes all derive from `n`, so a torn read shows up.
pub(crate) fn payload_for(n: u32, len: usize) -> Vec<u8> {
    let mut bytes = n.to_be_bytes().to_vec();
    bytes.resize(len.max(4), (n % 251) as u8);
    bytes
}

pub(crate) fn payload_is_consistent(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    let mut head = [0u8; 4];
    head.copy_from_slice(&bytes[..4]);
    let n = u32::from_be_bytes(head);
    bytes[4..].iter().all(|&b| b == (n % 251) as u8)
}
