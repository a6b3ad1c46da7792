//! Stacking of fragments into the final image.

use bytes::BytesMut;
use thiserror::Error;

use crate::fragment::{Fragment, FragmentStore, Incomplete};
use crate::png::{Image, ImageHeader};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Incomplete(#[from] Incomplete),
    #[error("no fragment to assemble")]
    Empty,
    #[error("fragment {index} is {actual} pixels wide, expected {expected}")]
    WidthMismatch { index: usize, expected: u32, actual: u32 },
    #[error("summed fragment heights overflow")]
    HeightOverflow,
    #[error("assembled data is {actual} bytes, expected {expected} for a {width}x{height} image")]
    PixelLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// How the height of the final image is determined.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Sum of the heights announced by every fragment.
    #[default]
    Derived,
    /// A height agreed upon with the fragment servers, whatever fragments announce.
    Fixed(u32),
}

/// Stack every fragment of a complete store, from index 0 at the top.
pub fn assemble(store: &FragmentStore, layout: Layout) -> Result<Image, Error> {
    let fragments = store.snapshot_ordered()?;

    assemble_fragments(&fragments, layout)
}

/// Stack `fragments` in the given order.
///
/// Every fragment must share the same width, and the stacked scanlines must exactly fill the resulting image.
pub fn assemble_fragments(fragments: &[Fragment], layout: Layout) -> Result<Image, Error> {
    let width = fragments.first().ok_or(Error::Empty)?.width;

    if let Some(fragment) = fragments.iter().find(|fragment| fragment.width != width) {
        return Err(Error::WidthMismatch {
            index: fragment.index,
            expected: width,
            actual: fragment.width,
        });
    }

    let height = match layout {
        Layout::Derived => fragments
            .iter()
            .try_fold(0u32, |height, fragment| height.checked_add(fragment.height))
            .ok_or(Error::HeightOverflow)?,
        Layout::Fixed(height) => height,
    };

    let mut pixels = BytesMut::with_capacity(fragments.iter().map(Fragment::len).sum());
    for fragment in fragments {
        pixels.extend_from_slice(&fragment.pixels);
    }

    let header = ImageHeader::new(width, height);

    if pixels.len() != header.raw_len() {
        return Err(Error::PixelLength {
            width,
            height,
            expected: header.raw_len(),
            actual: pixels.len(),
        });
    }

    tracing::debug!("Assembled {} fragments into a {width}x{height} image", fragments.len());

    Ok(Image::new(header, pixels.freeze()))
}
