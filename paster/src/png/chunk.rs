use std::fmt;
use std::io::{self, Read, Write};

use bytes::Bytes;

use super::{Error, SIGNATURE};

/// Largest payload a single chunk may carry (2^31 - 1 bytes).
pub const MAX_CHUNK_LEN: usize = i32::MAX as usize;

// upper bound on the payload buffer reserved before any byte is actually read,
// so that a corrupted length field cannot trigger a huge allocation up front
const READ_AHEAD: usize = 64 * 1_024;

/// A 4-byte chunk type tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkType(pub [u8; 4]);

impl ChunkType {
    /// Image header chunk.
    pub const IHDR: ChunkType = ChunkType(*b"IHDR");
    /// Image data chunk.
    pub const IDAT: ChunkType = ChunkType(*b"IDAT");
    /// Image trailer chunk.
    pub const IEND: ChunkType = ChunkType(*b"IEND");

    /// Whether a decoder is required to understand this chunk (uppercase first letter).
    #[inline]
    pub fn is_critical(&self) -> bool {
        self.0[0].is_ascii_uppercase()
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkType({self})")
    }
}

/// A typed and checksum-verified chunk.
///
/// The checksum is not kept around: it is verified when reading and recomputed when writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkType,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(kind: ChunkType, data: impl Into<Bytes>) -> Self {
        Self { kind, data: data.into() }
    }

    #[inline]
    pub fn crc(&self) -> u32 {
        crc(self.kind, &self.data)
    }
}

/// CRC-32 (ISO-HDLC, as used by PNG and zlib) over the chunk type followed by its payload.
pub fn crc(kind: ChunkType, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&kind.0);
    hasher.update(data);
    hasher.finalize()
}

/// Read and check the 8-byte PNG signature.
pub fn read_signature(reader: &mut impl Read) -> Result<(), Error> {
    let mut signature = [0; 8];
    read_exact(reader, &mut signature)?;

    if signature != SIGNATURE {
        return Err(Error::NotAPng(signature));
    }

    Ok(())
}

/// Read one chunk and verify its checksum.
///
/// Layout is `length (u32 BE) | type (4 bytes) | payload (length bytes) | crc (u32 BE)`.
pub fn read_chunk(reader: &mut impl Read) -> Result<Chunk, Error> {
    let mut head = [0; 8];
    read_exact(reader, &mut head)?;

    let [l0, l1, l2, l3, t0, t1, t2, t3] = head;
    let len = u32::from_be_bytes([l0, l1, l2, l3]) as usize;
    let kind = ChunkType([t0, t1, t2, t3]);

    if len > MAX_CHUNK_LEN {
        return Err(Error::InvalidLength(len));
    }

    let mut data = Vec::with_capacity(len.min(READ_AHEAD));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;

    if data.len() != len {
        return Err(Error::Truncated);
    }

    let mut expected = [0; 4];
    read_exact(reader, &mut expected)?;
    let expected = u32::from_be_bytes(expected);

    let computed = crc(kind, &data);
    if computed != expected {
        return Err(Error::Integrity { kind, expected, computed });
    }

    Ok(Chunk::new(kind, data))
}

/// Write one chunk, computing its checksum.
pub fn write_chunk(writer: &mut impl Write, kind: ChunkType, data: &[u8]) -> Result<(), Error> {
    if data.len() > MAX_CHUNK_LEN {
        return Err(Error::InvalidLength(data.len()));
    }

    writer.write_all(&(data.len() as u32).to_be_bytes())?;
    writer.write_all(&kind.0)?;
    writer.write_all(data)?;
    writer.write_all(&crc(kind, data).to_be_bytes())?;

    Ok(())
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::Truncated,
        _ => Error::Io(err),
    })
}
