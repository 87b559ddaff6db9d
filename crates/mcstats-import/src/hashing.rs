use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the canonical document bytes.
pub fn content_hash(canonical: &[u8]) -> String {
    hex::encode(Sha256::digest(canonical))
}

/// Gzip at level 6, the stored form of every payload.
pub fn compress_payload(canonical: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(canonical.len() / 4), Compression::new(6));
    encoder.write_all(canonical)?;
    encoder.finish()
}
