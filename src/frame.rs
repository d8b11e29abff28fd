use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use memmap2::MmapMut;

use crate::format::DataType;

/// Page-aligned host copy of one read-back frame.
///
/// Backed by an anonymous mapping so the start of the buffer is always page
/// aligned, which keeps the GPU -> host `memcpy` on its fast path. Ownership
/// moves from the ring slot to the hand-off queue and on to the writer; it is
/// never shared.
pub struct HostImage {
    map: MmapMut,
    len: usize,
}

impl HostImage {
    /// Allocate a zeroed buffer of `len` bytes, rounded up to whole pages internally.
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let page = page_size::get();
        let capacity = len.max(1).div_ceil(page) * page;
        let map = MmapMut::map_anon(capacity)?;
        Ok(Self { map, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }
}

impl Deref for HostImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[..self.len]
    }
}

impl DerefMut for HostImage {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

impl fmt::Debug for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostImage")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

/// Pixel storage of a delivered frame.
#[derive(Debug)]
pub enum FramePixels {
    /// Adopted host image from immediate-copy mode (no copy on delivery).
    Host(HostImage),
    /// Copy taken out of a mapped pixel buffer in deferred mode.
    Shared(Bytes),
}

impl FramePixels {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FramePixels::Host(image) => image,
            FramePixels::Shared(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row order of the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// First row in memory is the bottom of the image (GPU read-back order).
    BottomLeft,
    TopLeft,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct ImageMeta {
    /// Render-call order of the frame, starting at 0.
    pub sequence: u64,
    /// Output channel (eye) the frame belongs to.
    pub channel: usize,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub channels: usize,
    pub data_type: DataType,
    pub channel_names: Vec<String>,
    pub orientation: Orientation,
}

/// One frame as delivered to a writer by `images_at_frame`.
#[derive(Debug)]
pub struct FrameImage {
    pub pixels: FramePixels,
    pub meta: Arc<ImageMeta>,
    /// When the frame was handed to the writer.
    pub timestamp: Instant,
}

impl FrameImage {
    pub fn data(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Row `y` in memory order.
    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.meta.stride;
        &self.data()[y * stride..(y + 1) * stride]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_image_is_page_aligned_and_zeroed() {
        let mut image = HostImage::zeroed(64 * 64 * 3).unwrap();
        assert_eq!(image.len(), 64 * 64 * 3);
        assert_eq!(image.as_ptr() as usize % page_size::get(), 0);
        assert!(image.iter().all(|&b| b == 0));

        image[10] = 7;
        assert_eq!(image[10], 7);
    }

    #[test]
    fn rows_follow_stride() {
        let meta = Arc::new(ImageMeta {
            sequence: 0,
            channel: 0,
            width: 2,
            height: 2,
            stride: 6,
            channels: 3,
            data_type: DataType::UChar,
            channel_names: vec![],
            orientation: Orientation::BottomLeft,
        });
        let image = FrameImage {
            pixels: FramePixels::Shared(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1])),
            meta,
            timestamp: Instant::now(),
        };
        assert_eq!(image.row(1), &[1, 1, 1, 1, 1, 1]);
    }
}
