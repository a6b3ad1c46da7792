//! zlib stream (de)compression of image data.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::Error;

/// zlib's own default compression level.
pub const DEFAULT_LEVEL: u32 = 6;

const MAX_PREALLOC: usize = 64 * 1_024 * 1_024;

/// Decompress a zlib stream holding at most `max_size` bytes.
///
/// The output may be shorter than `max_size`, but never longer.
pub fn inflate(compressed: &[u8], max_size: usize) -> Result<Vec<u8>, Error> {
    let mut raw = Vec::with_capacity(max_size.min(MAX_PREALLOC));

    // read one byte past the bound to tell an exact fit from an overflow
    let limit = (max_size as u64).saturating_add(1);
    ZlibDecoder::new(compressed)
        .take(limit)
        .read_to_end(&mut raw)
        .map_err(Error::Inflate)?;

    if raw.len() > max_size {
        return Err(Error::InflateOverflow { limit: max_size });
    }

    Ok(raw)
}

/// Compress into a zlib stream at `level` (clamped to `0..=9`).
pub fn deflate(raw: &[u8], level: u32) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(level.clamp(0, 9)));
    encoder.write_all(raw).map_err(Error::Deflate)?;
    encoder.finish().map_err(Error::Deflate)
}
