//! A deliberately narrow PNG container.
//!
//! Only what strips are made of is supported: 8-bit RGBA, no interlacing, filter method 0.
//! Pixel data is kept as raw scanlines, each one prefixed by its filter type byte, so that
//! strips of equal width can be stacked by plain concatenation.

use std::io::{self, Read, Write};
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;

mod chunk;
pub use chunk::*;

pub mod zlib;

/// The fixed 8-byte PNG file signature.
pub const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

const TEMP_EXT: &str = "tmp";

#[derive(Debug, Error)]
pub enum Error {
    #[error("not a PNG stream (signature {0:02x?})")]
    NotAPng([u8; 8]),
    #[error("{kind} chunk CRC error: computed {computed:08x}, expected {expected:08x}")]
    Integrity { kind: ChunkType, expected: u32, computed: u32 },
    #[error("truncated stream")]
    Truncated,
    #[error("invalid chunk length {0}")]
    InvalidLength(usize),
    #[error("unexpected {found} chunk, expected {expected}")]
    UnexpectedChunk { found: ChunkType, expected: &'static str },
    #[error("trailing data after IEND chunk")]
    TrailingData,
    #[error("unsupported image header: {0}")]
    UnsupportedHeader(&'static str),
    #[error("image data is {actual} bytes once inflated, expected {expected}")]
    PixelLength { expected: usize, actual: usize },
    #[error("scanline {row} uses filter type {filter} which cannot start a strip")]
    Filter { row: usize, filter: u8 },
    #[error("inflate failed: {0}")]
    Inflate(#[source] io::Error),
    #[error("inflated data exceeds {limit} bytes")]
    InflateOverflow { limit: usize },
    #[error("deflate failed: {0}")]
    Deflate(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Image dimensions, together with the fixed pixel format every strip shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
}

impl ImageHeader {
    /// Length of the IHDR payload.
    pub const LEN: usize = 13;
    pub const BIT_DEPTH: u8 = 8;
    /// Truecolor with alpha.
    pub const COLOR_TYPE: u8 = 6;
    pub const BYTES_PER_PIXEL: usize = 4;

    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse and validate an IHDR payload.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let data: &[u8; Self::LEN] = data.try_into().map_err(|_| Error::UnsupportedHeader("IHDR must be 13 bytes long"))?;
        let [w0, w1, w2, w3, h0, h1, h2, h3, bit_depth, color_type, compression, filter, interlace] = *data;

        let header = Self::new(u32::from_be_bytes([w0, w1, w2, w3]), u32::from_be_bytes([h0, h1, h2, h3]));

        if header.width == 0 || header.height == 0 {
            return Err(Error::UnsupportedHeader("zero-sized image"));
        }
        if header.width > i32::MAX as u32 || header.height > i32::MAX as u32 || header.checked_raw_len().is_none() {
            return Err(Error::UnsupportedHeader("image too large"));
        }
        if bit_depth != Self::BIT_DEPTH || color_type != Self::COLOR_TYPE {
            return Err(Error::UnsupportedHeader("only 8-bit RGBA is supported"));
        }
        if compression != 0 || filter != 0 {
            return Err(Error::UnsupportedHeader("unknown compression or filter method"));
        }
        if interlace != 0 {
            return Err(Error::UnsupportedHeader("interlacing is not supported"));
        }

        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut data = [0; Self::LEN];
        data[..4].copy_from_slice(&self.width.to_be_bytes());
        data[4..8].copy_from_slice(&self.height.to_be_bytes());
        data[8] = Self::BIT_DEPTH;
        data[9] = Self::COLOR_TYPE;
        // compression, filter and interlace methods are all 0
        data
    }

    /// Length of one scanline, filter type byte included.
    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * Self::BYTES_PER_PIXEL + 1
    }

    /// Length of the whole inflated image data.
    #[inline]
    pub fn raw_len(&self) -> usize {
        self.checked_raw_len().unwrap_or(usize::MAX)
    }

    fn checked_raw_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(Self::BYTES_PER_PIXEL)?
            .checked_add(1)?
            .checked_mul(self.height as usize)
    }
}

/// A decoded image: its header and its inflated scanlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub header: ImageHeader,
    pub pixels: Bytes,
}

impl Image {
    #[inline]
    pub fn new(header: ImageHeader, pixels: impl Into<Bytes>) -> Self {
        Self {
            header,
            pixels: pixels.into(),
        }
    }

    /// Decode a single-strip image stream: signature, IHDR, IDAT(s), IEND.
    ///
    /// Ancillary chunks are skipped. The inflated data must exactly fill `height` scanlines,
    /// and the first scanline must not depend on a previous row, so that the strip can be
    /// stacked below any other one.
    pub fn decode(mut reader: impl Read) -> Result<Self, Error> {
        read_signature(&mut reader)?;

        let chunk = read_chunk(&mut reader)?;
        if chunk.kind != ChunkType::IHDR {
            return Err(Error::UnexpectedChunk {
                found: chunk.kind,
                expected: "IHDR",
            });
        }
        let header = ImageHeader::parse(&chunk.data)?;

        // IDAT chunks must be consecutive, their payloads form a single zlib stream
        let mut compressed = Vec::new();
        let mut idat = IdatState::Pending;

        loop {
            let chunk = read_chunk(&mut reader)?;

            match (chunk.kind, idat) {
                (ChunkType::IDAT, IdatState::Pending | IdatState::Reading) => {
                    compressed.extend_from_slice(&chunk.data);
                    idat = IdatState::Reading;
                }
                (ChunkType::IEND, IdatState::Reading | IdatState::Done) => break,
                (kind, _) if !kind.is_critical() => {
                    if idat == IdatState::Reading {
                        idat = IdatState::Done;
                    }
                }
                (found, state) => {
                    return Err(Error::UnexpectedChunk {
                        found,
                        expected: if state == IdatState::Pending { "IDAT" } else { "IEND" },
                    })
                }
            }
        }

        if reader.read(&mut [0])? != 0 {
            return Err(Error::TrailingData);
        }

        let expected = header.raw_len();
        let pixels = zlib::inflate(&compressed, expected)?;

        if pixels.len() != expected {
            return Err(Error::PixelLength {
                expected,
                actual: pixels.len(),
            });
        }

        check_filters(&header, &pixels)?;

        Ok(Self::new(header, pixels))
    }

    /// Encode as a complete PNG stream.
    pub fn encode(&self, level: u32) -> Result<Vec<u8>, Error> {
        let compressed = zlib::deflate(&self.pixels, level)?;

        let mut buf = Vec::with_capacity(SIGNATURE.len() + 3 * 12 + ImageHeader::LEN + compressed.len());
        Self::write_parts(&mut buf, &self.header, &compressed)?;

        Ok(buf)
    }

    /// Encode and write to `writer`.
    #[inline]
    pub fn write_to(&self, mut writer: impl Write, level: u32) -> Result<(), Error> {
        let compressed = zlib::deflate(&self.pixels, level)?;
        Self::write_parts(&mut writer, &self.header, &compressed)
    }

    /// Encode and save to `path`.
    ///
    /// The image is fully encoded first, then written to a temporary sibling file which is renamed
    /// onto `path` once flushed, so that `path` is never left holding a partial image.
    pub async fn save(&self, path: impl AsRef<Path>, level: u32) -> Result<(), Error> {
        use tokio::io::AsyncWriteExt;

        let path = path.as_ref();
        let buf = self.encode(level)?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".");
        tmp.push(TEMP_EXT);

        tracing::debug!("Writing {}x{} image to `{}`", self.header.width, self.header.height, path.display());

        let written = async {
            let file = tokio::fs::File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .await?;

            let mut writer = tokio::io::BufWriter::new(file);

            writer.write_all(&buf).await?;
            writer.shutdown().await?;
            writer.into_inner().sync_all().await?;

            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(error) = written {
            if let Err(remove_error) = tokio::fs::remove_file(&tmp).await {
                tracing::debug!("Could not remove `{}`: {remove_error}", Path::new(&tmp).display());
            }

            return Err(error.into());
        }

        Ok(())
    }

    fn write_parts(writer: &mut impl Write, header: &ImageHeader, compressed: &[u8]) -> Result<(), Error> {
        writer.write_all(&SIGNATURE)?;
        write_chunk(writer, ChunkType::IHDR, &header.to_bytes())?;
        for data in compressed.chunks(MAX_CHUNK_LEN) {
            write_chunk(writer, ChunkType::IDAT, data)?;
        }
        write_chunk(writer, ChunkType::IEND, &[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdatState {
    Pending,
    Reading,
    Done,
}

fn check_filters(header: &ImageHeader, pixels: &[u8]) -> Result<(), Error> {
    for (row, scanline) in pixels.chunks(header.stride()).enumerate() {
        match scanline[0] {
            // none, sub
            0 | 1 => {}
            // up, average, paeth all read the previous row
            2..=4 if row > 0 => {}
            filter => return Err(Error::Filter { row, filter }),
        }
    }

    Ok(())
}

/// Build a strip whose pixel bytes are derived from `seed`, every scanline unfiltered.
#[cfg(test)]
pub(crate) fn sample(width: u32, height: u32, seed: u8) -> Image {
    let header = ImageHeader::new(width, height);
    let mut pixels = Vec::with_capacity(header.raw_len());

    for row in 0..height as usize {
        pixels.push(0);
        pixels.extend((0..header.stride() - 1).map(|col| seed.wrapping_add((row * 31 + col) as u8)));
    }

    Image::new(header, pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header() {
        let header = ImageHeader::new(400, 6);
        let bytes = header.to_bytes();

        assert_eq!(bytes, [0, 0, 1, 144, 0, 0, 0, 6, 8, 6, 0, 0, 0]);
        assert_eq!(ImageHeader::parse(&bytes).unwrap(), header);
        assert_eq!(header.stride(), 1_601);
        assert_eq!(header.raw_len(), 6 * 1_601);
    }

    #[test]
    fn test_unsupported_header() {
        let valid = ImageHeader::new(4, 4).to_bytes();

        assert!(ImageHeader::parse(&valid[..12]).is_err());

        for (offset, value) in [(3, 0), (7, 0), (8, 16), (9, 2), (10, 1), (11, 1), (12, 1), (0, 0x80)] {
            let mut bytes = valid;
            bytes[offset] = value;

            assert!(
                matches!(ImageHeader::parse(&bytes), Err(Error::UnsupportedHeader(_))),
                "byte {offset} set to {value} should be rejected"
            );
        }
    }

    #[test]
    fn test_encode_then_decode() {
        let image = sample(7, 3, 42);
        let buf = image.encode(zlib::DEFAULT_LEVEL).unwrap();

        assert_eq!(&buf[..8], &SIGNATURE);
        assert_eq!(&buf[buf.len() - 12..], &[0, 0, 0, 0, b'I', b'E', b'N', b'D', 0xae, 0x42, 0x60, 0x82]);
        assert_eq!(Image::decode(&buf[..]).unwrap(), image);

        let mut written = vec![];
        image.write_to(&mut written, zlib::DEFAULT_LEVEL).unwrap();
        assert_eq!(written, buf);
    }

    fn stream(chunks: &[(ChunkType, &[u8])]) -> Vec<u8> {
        let mut buf = SIGNATURE.to_vec();
        for (kind, data) in chunks {
            write_chunk(&mut buf, *kind, data).unwrap();
        }
        buf
    }

    #[test]
    fn test_decode_split_idat_and_ancillary_chunks() {
        let image = sample(5, 4, 1);
        let compressed = zlib::deflate(&image.pixels, 9).unwrap();
        let (a, b) = compressed.split_at(compressed.len() / 2);
        let header = image.header.to_bytes();

        let buf = stream(&[
            (ChunkType::IHDR, &header),
            (ChunkType(*b"gAMA"), &[0, 0, 0xb1, 0x8f]),
            (ChunkType::IDAT, a),
            (ChunkType::IDAT, b),
            (ChunkType(*b"tEXt"), b"k\0v"),
            (ChunkType::IEND, &[]),
        ]);

        assert_eq!(Image::decode(&buf[..]).unwrap(), image);
    }

    #[test]
    fn test_decode_structure_errors() {
        let image = sample(5, 4, 1);
        let compressed = zlib::deflate(&image.pixels, 9).unwrap();
        let header = image.header.to_bytes();

        let missing_idat = stream(&[(ChunkType::IHDR, &header), (ChunkType::IEND, &[])]);
        assert!(matches!(
            Image::decode(&missing_idat[..]),
            Err(Error::UnexpectedChunk { expected: "IDAT", .. })
        ));

        let missing_ihdr = stream(&[(ChunkType::IDAT, &compressed), (ChunkType::IEND, &[])]);
        assert!(matches!(
            Image::decode(&missing_ihdr[..]),
            Err(Error::UnexpectedChunk { expected: "IHDR", .. })
        ));

        let split_idat = stream(&[
            (ChunkType::IHDR, &header),
            (ChunkType::IDAT, &compressed[..4]),
            (ChunkType(*b"tIME"), &[0; 7]),
            (ChunkType::IDAT, &compressed[4..]),
            (ChunkType::IEND, &[]),
        ]);
        assert!(matches!(
            Image::decode(&split_idat[..]),
            Err(Error::UnexpectedChunk { expected: "IEND", .. })
        ));

        let unknown = ChunkType(*b"ABCD");

        let before_idat = stream(&[
            (ChunkType::IHDR, &header),
            (unknown, &[1, 2, 3]),
            (ChunkType::IDAT, &compressed),
            (ChunkType::IEND, &[]),
        ]);
        assert!(matches!(
            Image::decode(&before_idat[..]),
            Err(Error::UnexpectedChunk { found, expected: "IDAT" }) if found == unknown
        ));

        let between_idat = stream(&[
            (ChunkType::IHDR, &header),
            (ChunkType::IDAT, &compressed[..4]),
            (unknown, &[]),
            (ChunkType::IDAT, &compressed[4..]),
            (ChunkType::IEND, &[]),
        ]);
        assert!(matches!(
            Image::decode(&between_idat[..]),
            Err(Error::UnexpectedChunk { found, expected: "IEND" }) if found == unknown
        ));

        let mut trailing = stream(&[(ChunkType::IHDR, &header), (ChunkType::IDAT, &compressed), (ChunkType::IEND, &[])]);
        trailing.push(0);
        assert!(matches!(Image::decode(&trailing[..]), Err(Error::TrailingData)));

        let unterminated = stream(&[(ChunkType::IHDR, &header), (ChunkType::IDAT, &compressed)]);
        assert!(matches!(Image::decode(&unterminated[..]), Err(Error::Truncated)));

        assert!(matches!(Image::decode(&b"GIF89a.."[..]), Err(Error::NotAPng(_))));
    }

    #[test]
    fn test_decode_short_pixel_data() {
        let image = sample(5, 4, 1);
        // one scanline short of what the header announces
        let header = ImageHeader::new(5, 5);
        let buf = Image::new(header, image.pixels).encode(zlib::DEFAULT_LEVEL).unwrap();

        assert!(matches!(
            Image::decode(&buf[..]),
            Err(Error::PixelLength { expected, actual }) if expected == 5 * 21 && actual == 4 * 21
        ));
    }

    #[test]
    fn test_decode_filters() {
        let mut pixels = sample(2, 3, 0).pixels.to_vec();
        let stride = ImageHeader::new(2, 3).stride();

        // sub on the first row and paeth below it are fine
        pixels[0] = 1;
        pixels[stride] = 4;
        let buf = Image::new(ImageHeader::new(2, 3), pixels.clone()).encode(1).unwrap();
        assert!(Image::decode(&buf[..]).is_ok());

        // up on the first row would read the previous strip
        pixels[0] = 2;
        let buf = Image::new(ImageHeader::new(2, 3), pixels.clone()).encode(1).unwrap();
        assert!(matches!(Image::decode(&buf[..]), Err(Error::Filter { row: 0, filter: 2 })));

        pixels[0] = 0;
        pixels[2 * stride] = 5;
        let buf = Image::new(ImageHeader::new(2, 3), pixels).encode(1).unwrap();
        assert!(matches!(Image::decode(&buf[..]), Err(Error::Filter { row: 2, filter: 5 })));
    }

    #[tokio::test]
    async fn test_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all.png");
        let image = sample(3, 2, 9);

        image.save(&path, zlib::DEFAULT_LEVEL).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(Image::decode(&bytes[..]).unwrap(), image);
        assert!(!dir.path().join("all.png.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // a non-empty directory cannot be replaced by a file
        let path = dir.path().join("all.png");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"").unwrap();

        let err = sample(3, 2, 9).save(&path, zlib::DEFAULT_LEVEL).await.unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(path.join("keep").exists());
        assert!(!dir.path().join("all.png.tmp").exists());
    }
}
