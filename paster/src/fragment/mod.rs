use bytes::Bytes;

use crate::png::Image;

mod store;
pub use store::*;

/// One horizontal strip of the final image.
///
/// Fragments are immutable once decoded; cloning one only bumps the reference count of its pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Sequence index, ie. position of the strip from the top of the image.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Inflated scanlines, filter type bytes included.
    pub pixels: Bytes,
}

impl Fragment {
    /// Create a new `Fragment` out of a decoded strip image.
    pub fn new(index: usize, image: Image) -> Self {
        Self {
            index,
            width: image.header.width,
            height: image.header.height,
            pixels: image.pixels,
        }
    }

    /// Payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}
