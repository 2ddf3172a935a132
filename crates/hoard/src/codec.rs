//! Whole-buffer zlib (deflate with an adler-32 trailer) and fixed-size chunking
//! for peer streaming.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use packrat_core::PeerFailure;
use std::io::{Read, Write};

pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates `data` and checks it is exactly `original_size` bytes.
///
/// Output is capped one byte past the declared size so a corrupt stream can
/// never balloon memory.
pub fn decompress(data: &[u8], original_size: u64) -> Result<Vec<u8>, PeerFailure> {
    let mut out = Vec::with_capacity(original_size.min(64 * 1024 * 1024) as usize);
    ZlibDecoder::new(data)
        .take(original_size.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| PeerFailure::Decompression(e.to_string()))?;

    if out.len() as u64 != original_size {
        return Err(PeerFailure::SizeMismatch {
            expected: original_size,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// `ceil(len / chunk_size)`; an empty payload still occupies one chunk.
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1);
    len.div_ceil(chunk_size).max(1) as u32
}

/// Most chunks a compressed payload of at most `max_bytes` original bytes can need.
///
/// Incompressible input grows by a few bytes per deflate block plus the zlib framing.
pub fn max_chunks(max_bytes: u64, chunk_size: usize) -> u32 {
    let bound = max_bytes
        .saturating_add(max_bytes / 1000)
        .saturating_add(64);
    let chunk_size = chunk_size.max(1) as u64;
    bound.div_ceil(chunk_size).clamp(1, u32::MAX as u64) as u32
}

pub fn split(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(chunk_size.max(1)).collect()
}
