//! GPU collaborator contracts consumed by the transfer pipeline.
//!
//! The pipeline never allocates framebuffers itself; it only brackets access to
//! caller-supplied ones and drives pixel-buffer objects through these traits.

pub mod software;

pub use software::{SoftwareFramebuffer, SoftwareGpu};

use bytes::Bytes;

use crate::error::Result;
use crate::format::DataFormat;

/// Opaque handle of a GPU pixel-buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Geometry and layout of one read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLayout {
    pub width: usize,
    pub height: usize,
    pub format: DataFormat,
}

impl ReadLayout {
    pub fn stride(&self) -> usize {
        self.width * self.format.pixel_size()
    }

    pub fn len(&self) -> usize {
        self.stride() * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rendered framebuffer owned by the caller's renderer.
pub trait Framebuffer: Send + Sync {
    fn id(&self) -> u64;

    /// Make this framebuffer the read source for subsequent read-backs.
    fn bind(&self);

    /// Lock the framebuffer against re-rendering while its pixels are read back.
    fn begin_external_readback(&self);

    /// Release the lock taken by [`Framebuffer::begin_external_readback`].
    fn end_external_readback(&self);
}

/// Pixel transfer operations of the GPU context the renderer draws with.
///
/// All methods are called from the render thread (the thread calling
/// `transfer()`/`bind()`/`unbind()`), never from the pipeline's own threads.
pub trait GpuBackend: Send + Sync + 'static {
    type Framebuffer: Framebuffer + 'static;

    /// Allocate a pixel-buffer object of `len` bytes for read-back.
    fn create_pixel_buffer(&self, len: usize) -> Result<BufferHandle>;

    fn delete_pixel_buffer(&self, buffer: BufferHandle);

    /// Queue an asynchronous read of `framebuffer` into `buffer`; returns immediately.
    fn read_into_buffer(&self, framebuffer: &Self::Framebuffer, buffer: BufferHandle, layout: &ReadLayout);

    /// Map `buffer` for reading. `None` means the mapping failed.
    ///
    /// The returned view must stay valid after [`GpuBackend::unmap_buffer`];
    /// backends that cannot guarantee that hand out a staging copy.
    fn map_buffer(&self, buffer: BufferHandle) -> Option<Bytes>;

    fn unmap_buffer(&self, buffer: BufferHandle);

    /// Synchronous read of `framebuffer` straight into host memory.
    fn read_pixels(&self, framebuffer: &Self::Framebuffer, layout: &ReadLayout, dst: &mut [u8]);
}
