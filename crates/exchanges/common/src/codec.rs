//! Frame decompression and digest helpers.

use flate2::read::DeflateDecoder;
use sha2::{Digest, Sha256};
use std::io::{Error, ErrorKind, Read};

/// Largest inflated frame accepted from an exchange.
pub const MAX_INFLATED_FRAME: usize = 16 * 1024 * 1024;

/// Inflate a raw deflate stream (no zlib header or trailer).
pub fn inflate_raw(data: &[u8]) -> std::io::Result<Vec<u8>> {
    inflate_raw_limited(data, MAX_INFLATED_FRAME)
}

/// Inflate a raw deflate stream, failing once the output passes `limit` bytes.
pub fn inflate_raw_limited(data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::with_capacity((data.len() * 4).min(limit));
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("inflated frame exceeds {} bytes", limit),
        ));
    }
    Ok(out)
}

/// Lowercase hex digest of the given bytes.
pub fn hex_lower(bytes: impl AsRef<[u8]>) -> String {
    bytes
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// SHA-256 of the input string as lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_lower(hasher.finalize())
}
