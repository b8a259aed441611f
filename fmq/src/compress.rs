use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{FmqError, FmqResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    None,
    Zlib,
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::None
    }
}

/// Compresses `data` the way a queue configured with `method` stores it.
/// The result can be handed to `Fmq::write_precompressed`.
pub fn compress_payload(method: CompressionMethod, data: &[u8]) -> FmqResult<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => zlib(data).map_err(FmqError::Compression),
    }
}

fn zlib(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates a stored payload. Padding after the end of the zlib stream is ignored.
/// At most one byte past `expected_len` is inflated, enough to report the overrun.
pub fn decompress_payload(stored: &[u8], expected_len: usize) -> FmqResult<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    ZlibDecoder::new(stored)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(FmqError::Compression)?;
    if out.len() != expected_len {
        return Err(FmqError::Compression(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("inflated {} bytes, expected {}", out.len(), expected_len),
        )));
    }
    Ok(out)
}
