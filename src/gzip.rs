//! Gzip compression for frame bodies.
//!
//! Bodies are compressed as full gzip streams (RFC 1952). The frame codec
//! compresses on pack when the body crosses the configured threshold and
//! always surfaces decompressed bytes on unpack.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{FinwireError, Result};

/// Compress `data` into a full gzip stream.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::default(),
    );
    encoder.write_all(data).map_err(FinwireError::Gzip)?;
    encoder.finish().map_err(FinwireError::Gzip)
}

/// Decompress a full gzip stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(decompressed_size(data).unwrap_or(0));
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(FinwireError::Gzip)?;
    Ok(out)
}

/// Size hint from the gzip trailer.
///
/// RFC 1952: the last four bytes carry the uncompressed size modulo 2^32.
/// Only a hint — frame bodies are capped well below the wraparound point.
fn decompressed_size(data: &[u8]) -> Option<usize> {
    let tail: [u8; 4] = data.get(data.len().checked_sub(4)?..)?.try_into().ok()?;
    Some(u32::from_le_bytes(tail) as usize)
}
