//! In-memory stand-in for a GPU context.
//!
//! Pixel-buffer objects are plain byte vectors, read-backs are copies out of
//! the framebuffer's pixel store. Used for headless runs and tests, including
//! fault injection on the mapping step.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{BufferHandle, Framebuffer, GpuBackend, ReadLayout};
use crate::error::{OutputError, Result};

/// Framebuffer whose pixels live in host memory.
pub struct SoftwareFramebuffer {
    id: u64,
    pixels: Mutex<Vec<u8>>,
    in_readback: Mutex<bool>,
    released: Condvar,
    binds: AtomicU64,
}

impl SoftwareFramebuffer {
    pub fn new(id: u64, pixels: Vec<u8>) -> Self {
        Self {
            id,
            pixels: Mutex::new(pixels),
            in_readback: Mutex::new(false),
            released: Condvar::new(),
            binds: AtomicU64::new(0),
        }
    }

    /// Framebuffer filled with a single byte value.
    pub fn filled(id: u64, len: usize, value: u8) -> Self {
        Self::new(id, vec![value; len])
    }

    /// Replace the rendered contents.
    pub fn render(&self, pixels: &[u8]) {
        let mut store = self.pixels.lock();
        store.clear();
        store.extend_from_slice(pixels);
    }

    pub fn in_readback(&self) -> bool {
        *self.in_readback.lock()
    }

    /// Block until the pipeline ended its external read-back, or `timeout` passes.
    ///
    /// Returns `true` if the framebuffer is free for rendering.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let mut busy = self.in_readback.lock();
        if *busy {
            self.released.wait_while_for(&mut busy, |busy| *busy, timeout);
        }
        !*busy
    }

    pub fn bind_count(&self) -> u64 {
        self.binds.load(Ordering::Relaxed)
    }
}

impl Framebuffer for SoftwareFramebuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn bind(&self) {
        self.binds.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_external_readback(&self) {
        *self.in_readback.lock() = true;
    }

    fn end_external_readback(&self) {
        *self.in_readback.lock() = false;
        self.released.notify_all();
    }
}

struct SoftBuffer {
    data: Vec<u8>,
    mapped: bool,
}

/// Software GPU context.
#[derive(Default)]
pub struct SoftwareGpu {
    buffers: Mutex<HashMap<BufferHandle, SoftBuffer>>,
    next_handle: AtomicU64,
    map_calls: AtomicU64,
    read_calls: AtomicU64,
    failing_maps: Mutex<HashSet<u64>>,
    fail_allocation: AtomicBool,
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th call (1-based) to `map_buffer` fail.
    pub fn fail_map_call(&self, n: u64) {
        self.failing_maps.lock().insert(n);
    }

    /// Make every subsequent pixel-buffer allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocation.store(fail, Ordering::Relaxed);
    }

    pub fn map_calls(&self) -> u64 {
        self.map_calls.load(Ordering::Relaxed)
    }

    /// Number of read-back commands issued, asynchronous and direct.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn mapped_buffers(&self) -> usize {
        self.buffers.lock().values().filter(|b| b.mapped).count()
    }
}

fn copy_pixels(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

impl GpuBackend for SoftwareGpu {
    type Framebuffer = SoftwareFramebuffer;

    fn create_pixel_buffer(&self, len: usize) -> Result<BufferHandle> {
        if self.fail_allocation.load(Ordering::Relaxed) {
            return Err(OutputError::Gpu(format!(
                "failed to allocate {len} byte pixel buffer"
            )));
        }
        let handle = BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.buffers.lock().insert(
            handle,
            SoftBuffer {
                data: vec![0; len],
                mapped: false,
            },
        );
        debug!(?handle, len, "created pixel buffer");
        Ok(handle)
    }

    fn delete_pixel_buffer(&self, buffer: BufferHandle) {
        if self.buffers.lock().remove(&buffer).is_none() {
            warn!(?buffer, "delete of unknown pixel buffer");
        }
    }

    fn read_into_buffer(
        &self,
        framebuffer: &SoftwareFramebuffer,
        buffer: BufferHandle,
        layout: &ReadLayout,
    ) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let pixels = framebuffer.pixels.lock();
        let mut buffers = self.buffers.lock();
        match buffers.get_mut(&buffer) {
            Some(target) => {
                let len = layout.len().min(target.data.len());
                copy_pixels(&pixels, &mut target.data[..len]);
            }
            None => warn!(?buffer, "read-back into unknown pixel buffer"),
        }
    }

    fn map_buffer(&self, buffer: BufferHandle) -> Option<Bytes> {
        let call = self.map_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.failing_maps.lock().contains(&call) {
            return None;
        }
        let mut buffers = self.buffers.lock();
        let target = buffers.get_mut(&buffer)?;
        target.mapped = true;
        Some(Bytes::copy_from_slice(&target.data))
    }

    fn unmap_buffer(&self, buffer: BufferHandle) {
        if let Some(target) = self.buffers.lock().get_mut(&buffer) {
            target.mapped = false;
        }
    }

    fn read_pixels(&self, framebuffer: &SoftwareFramebuffer, layout: &ReadLayout, dst: &mut [u8]) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let pixels = framebuffer.pixels.lock();
        let len = layout.len().min(dst.len());
        copy_pixels(&pixels, &mut dst[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;

    fn layout() -> ReadLayout {
        ReadLayout {
            width: 2,
            height: 2,
            format: DataFormat::Rgb8,
        }
    }

    #[test]
    fn pixel_buffer_read_then_map() {
        let gpu = SoftwareGpu::new();
        let fb = SoftwareFramebuffer::filled(1, 12, 9);
        let pbo = gpu.create_pixel_buffer(12).unwrap();

        gpu.read_into_buffer(&fb, pbo, &layout());
        let mapped = gpu.map_buffer(pbo).unwrap();
        assert_eq!(&mapped[..], &[9; 12]);
        assert_eq!(gpu.mapped_buffers(), 1);

        gpu.unmap_buffer(pbo);
        assert_eq!(gpu.mapped_buffers(), 0);
        // Views handed out before unmap stay readable.
        assert_eq!(mapped[0], 9);

        gpu.delete_pixel_buffer(pbo);
        assert_eq!(gpu.live_buffers(), 0);
    }

    #[test]
    fn injected_map_failure_hits_only_that_call() {
        let gpu = SoftwareGpu::new();
        let pbo = gpu.create_pixel_buffer(12).unwrap();
        gpu.fail_map_call(2);

        assert!(gpu.map_buffer(pbo).is_some());
        assert!(gpu.map_buffer(pbo).is_none());
        assert!(gpu.map_buffer(pbo).is_some());
        assert_eq!(gpu.map_calls(), 3);
    }

    #[test]
    fn external_readback_release_wakes_waiter() {
        let fb = std::sync::Arc::new(SoftwareFramebuffer::filled(3, 4, 0));
        fb.begin_external_readback();
        assert!(!fb.wait_released(Duration::from_millis(5)));

        let releaser = {
            let fb = fb.clone();
            std::thread::spawn(move || fb.end_external_readback())
        };
        assert!(fb.wait_released(Duration::from_secs(5)));
        releaser.join().unwrap();
    }
}
