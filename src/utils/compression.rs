use crate::config::MAX_FRAME_SIZE;
use crate::error::{ConduitError, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Maximum output size for decompression (aligned with MAX_FRAME_SIZE to prevent DoS)
const MAX_DECOMPRESSION_SIZE: usize = MAX_FRAME_SIZE;

/// Deflate level used for outgoing payloads; balances ratio against CPU
const MODERATE_LEVEL: u32 = 6;

/// Compresses data with deflate at the moderate level
///
/// # Errors
/// Returns `ConduitError::CompressionFailure` if compression fails
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(MODERATE_LEVEL));
    encoder
        .write_all(data)
        .map_err(|_| ConduitError::CompressionFailure)?;
    encoder.finish().map_err(|_| ConduitError::CompressionFailure)
}

/// Decompresses deflated data.
///
/// Enforces a maximum output size limit to prevent decompression bombs.
/// The limit is set to MAX_FRAME_SIZE to align with protocol frame limits.
///
/// # Errors
/// Returns `ConduitError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds MAX_DECOMPRESSION_SIZE
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();

    // Read in chunks so the size limit is checked before each growth step
    let mut buffer = [0u8; 8192];
    loop {
        match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() + n > MAX_DECOMPRESSION_SIZE {
                    return Err(ConduitError::DecompressionFailure);
                }
                out.extend_from_slice(&buffer[..n]);
            }
            Err(_) => return Err(ConduitError::DecompressionFailure),
        }
    }
    Ok(out)
}

/// Compress data if it exceeds the threshold and deflate actually shrinks it;
/// otherwise return it unchanged.
///
/// Returns the output bytes and a flag indicating whether compression was applied.
pub fn maybe_compress(data: &[u8], threshold_bytes: usize) -> Result<(Vec<u8>, bool)> {
    if data.len() <= threshold_bytes {
        return Ok((data.to_vec(), false));
    }

    let compressed = compress(data)?;
    if compressed.len() < data.len() {
        Ok((compressed, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

/// Decompress data only if it was previously compressed; otherwise return as-is.
pub fn maybe_decompress(data: &[u8], was_compressed: bool) -> Result<Vec<u8>> {
    if was_compressed {
        decompress(data)
    } else {
        Ok(data.to_vec())
    }
}
