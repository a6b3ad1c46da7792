#![allow(dead_code)]

use bytes::Bytes;
use paster::png::{zlib, Image, ImageHeader};

pub const WIDTH: u32 = 16;
pub const STRIP_HEIGHT: u32 = 2;

/// A strip whose unfiltered pixels are derived from its index.
pub fn strip(index: usize) -> Image {
    let header = ImageHeader::new(WIDTH, STRIP_HEIGHT);

    let pixels: Vec<u8> = (0..STRIP_HEIGHT as usize)
        .flat_map(|row| {
            std::iter::once(0).chain((0..header.stride() - 1).map(move |col| (index * 37 + row * 11 + col) as u8))
        })
        .collect();

    Image::new(header, pixels)
}

/// Every strip of a `count` strips image, as encoded by a fragment server.
pub fn encoded_strips(count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|index| strip(index).encode(zlib::DEFAULT_LEVEL).unwrap().into())
        .collect()
}

/// The expected pixels of the whole image.
pub fn expected_pixels(count: usize) -> Vec<u8> {
    (0..count).flat_map(|index| strip(index).pixels.to_vec()).collect()
}
