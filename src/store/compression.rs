//! LZ4 compression for locally cached blobs
//!
//! Stored values carry a one-byte tag so small or incompressible blobs can
//! be kept as-is.

use crate::error::{Error, Result};

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;

/// Compress data using LZ4
///
/// Returns None if compression doesn't reduce size
pub fn compress(data: &[u8], threshold: usize) -> Option<Vec<u8>> {
    if data.len() < threshold {
        return None; // Too small to bother
    }

    let compressed = lz4_flex::compress_prepend_size(data);

    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress LZ4 data
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Serialization(format!("Decompression failed: {}", e)))
}

/// Encode a blob for storage, compressing when it helps
pub fn encode_stored(data: &[u8], threshold: usize) -> Vec<u8> {
    match compress(data, threshold) {
        Some(compressed) => {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            out
        }
        None => {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(TAG_RAW);
            out.extend_from_slice(data);
            out
        }
    }
}

/// Decode a value written by [`encode_stored`]
pub fn decode_stored(stored: &[u8]) -> Result<Vec<u8>> {
    match stored.split_first() {
        Some((&TAG_RAW, rest)) => Ok(rest.to_vec()),
        Some((&TAG_LZ4, rest)) => decompress(rest),
        Some((tag, _)) => Err(Error::Serialization(format!(
            "unknown blob encoding tag {}",
            tag
        ))),
        None => Err(Error::Serialization("empty stored blob".to_string())),
    }
}
