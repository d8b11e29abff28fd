//! Render-thread side of the read-back: issuing GPU reads into ring slots and
//! finalizing them into host-visible pixels.
//!
//! On the pixel-buffer path every read is asynchronous and is finalized one
//! cycle later, right before the next read is issued. The slot's image lock
//! is held by the render thread from issue to finalize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::channel::Channel;
use super::slot::{FrameSlot, SlotPayload, SlotState};
use crate::error::{OutputError, Result};
use crate::frame::HostImage;
use crate::gpu::{BufferHandle, Framebuffer, GpuBackend, ReadLayout};
use crate::profile::Profiler;
use crate::TransferMethod;

const READER: &str = "READER";

/// Read-back strategy bound to one GPU context.
pub struct Readback<G: GpuBackend> {
    gpu: Arc<G>,
    layout: ReadLayout,
    method: TransferMethod,
    stall_timeout: Duration,
    profiler: Arc<Mutex<Profiler>>,
    dropped: AtomicU64,
}

impl<G: GpuBackend> Readback<G> {
    pub fn new(
        gpu: Arc<G>,
        layout: ReadLayout,
        method: TransferMethod,
        stall_timeout: Duration,
        profiler: Arc<Mutex<Profiler>>,
    ) -> Self {
        Self {
            gpu,
            layout,
            method,
            stall_timeout,
            profiler,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn layout(&self) -> &ReadLayout {
        &self.layout
    }

    pub fn method(&self) -> TransferMethod {
        self.method
    }

    /// Frames whose read-back failed since this strategy was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Give every slot of `channel` its GPU resources and mark it ready.
    pub fn allocate(&self, channel: &Channel) -> Result<()> {
        for slot in channel.slots() {
            slot.lock_image("BIND");
            let result = self.allocate_slot(slot, channel.buffer_len());
            slot.unlock_image();
            result?;
        }
        Ok(())
    }

    fn allocate_slot(&self, slot: &FrameSlot, len: usize) -> Result<()> {
        let mut payload = slot.payload();
        *payload = SlotPayload::default();
        if self.method.uses_pbos() {
            payload.buffer = Some(self.gpu.create_pixel_buffer(len)?);
        }
        drop(payload);
        slot.set_state("BIND", SlotState::Ready);
        Ok(())
    }

    /// Free GPU resources and host payloads of every slot and reset them to `NotReady`.
    pub fn release(&self, channel: &Channel) {
        for slot in channel.slots() {
            if !slot.try_lock_image_for("UNBIND", self.stall_timeout) {
                warn!(
                    channel = channel.index(),
                    slot = slot.index(),
                    holder = ?slot.image_holder(),
                    "slot still locked at unbind, leaving its resources"
                );
                continue;
            }
            let mut payload = slot.payload();
            if let Some(buffer) = payload.buffer.take() {
                if payload.buffer_mapped {
                    self.gpu.unmap_buffer(buffer);
                }
                self.gpu.delete_pixel_buffer(buffer);
            }
            let framebuffer = payload.framebuffer.take();
            *payload = SlotPayload::default();
            drop(payload);

            if let Some(fb) = framebuffer {
                fb.end_external_readback();
            }
            slot.set_state("UNBIND", SlotState::NotReady);
            slot.unlock_image();
        }
    }

    /// Finalize the previous cycle, claim slot `read_index` and issue the
    /// read-back of `framebuffer` into it.
    ///
    /// `read_count` doubles as the frame's sequence number.
    pub fn read(
        &self,
        channel: &Channel,
        read_count: u64,
        read_index: usize,
        framebuffer: &Arc<G::Framebuffer>,
    ) -> Result<()> {
        self.finalize_outstanding(channel, read_count, read_index);
        self.claim(channel, read_index)?;
        self.issue(channel, read_count, read_index, framebuffer)
    }

    /// Take slot `read_index` for the render thread.
    ///
    /// Waits while the slot still holds a frame the transfer engine has not
    /// queued, giving up with [`OutputError::Stall`] after the stall timeout.
    pub fn claim(&self, channel: &Channel, read_index: usize) -> Result<()> {
        self.claim_for_read(channel.slot(read_index)).map(|_| ())
    }

    /// Undo a [`Readback::claim`] that will not be followed by [`Readback::issue`].
    pub fn abandon(&self, channel: &Channel, read_index: usize) {
        channel.slot(read_index).unlock_image_from_read();
    }

    /// Issue the read-back into a slot claimed by [`Readback::claim`].
    pub fn issue(
        &self,
        channel: &Channel,
        read_count: u64,
        read_index: usize,
        framebuffer: &Arc<G::Framebuffer>,
    ) -> Result<()> {
        if self.method.uses_pbos() {
            self.issue_async(channel, read_count, read_index, framebuffer)
        } else {
            self.issue_direct(channel, read_count, read_index, framebuffer)
        }
    }

    /// Map the read-back issued on the previous cycle and make it available to
    /// the transfer engine. Returns whether a mapping was attempted.
    pub fn finalize_outstanding(&self, channel: &Channel, read_count: u64, read_index: usize) -> bool {
        if !self.method.uses_pbos() || read_count == 0 {
            return false;
        }
        let slot = channel.previous(read_index);
        if slot.state(READER) != SlotState::Reading || !slot.reader_holds_image() {
            debug!(
                channel = channel.index(),
                slot = slot.index(),
                "no outstanding read-back to finalize"
            );
            return false;
        }

        let mut payload = slot.payload();
        let sequence = payload.sequence;
        let buffer = payload.buffer;
        let landed = match buffer {
            Some(buffer) => self.map_into(&mut payload, buffer, channel.buffer_len()),
            None => false,
        };
        if !landed {
            payload.host_image = None;
            payload.mapped = None;
            payload.buffer_mapped = false;
        }
        drop(payload);

        if landed {
            slot.set_state(READER, SlotState::Mapped);
        } else {
            self.record_drop(slot, sequence);
            slot.set_state(READER, SlotState::Failed);
        }
        self.profiler.lock().end_gpu();
        slot.unlock_image_from_read();
        true
    }

    fn map_into(&self, payload: &mut SlotPayload, buffer: BufferHandle, len: usize) -> bool {
        let Some(view) = self.gpu.map_buffer(buffer) else {
            self.gpu.unmap_buffer(buffer);
            return false;
        };
        if !self.method.immediate_copy() {
            payload.mapped = Some(view);
            payload.buffer_mapped = true;
            return true;
        }

        let copied = HostImage::zeroed(len).map(|mut host| {
            let n = host.len().min(view.len());
            host[..n].copy_from_slice(&view[..n]);
            host
        });
        self.gpu.unmap_buffer(buffer);
        match copied {
            Ok(host) => {
                payload.host_image = Some(host);
                true
            }
            Err(e) => {
                error!(error = %e, len, "host image allocation failed");
                false
            }
        }
    }

    fn record_drop(&self, slot: &FrameSlot, sequence: u64) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ovd_frames_dropped").increment(1);
        error!(
            channel = slot.channel(),
            slot = slot.index(),
            sequence,
            "GPU read-back could not be mapped, dropping frame"
        );
    }

    /// Take the slot for reading, waiting while it still holds a frame the
    /// transfer engine has not queued. Returns the slot's state at that point.
    fn claim_for_read(&self, slot: &FrameSlot) -> Result<SlotState> {
        slot.lock_image_for_read(READER);
        let mut state = slot.state(READER);
        let start = Instant::now();
        let backoff = Backoff::new();
        while state.awaiting_transfer() {
            slot.unlock_image_from_read();
            let waited = start.elapsed();
            if waited >= self.stall_timeout {
                warn!(
                    channel = slot.channel(),
                    slot = slot.index(),
                    ?waited,
                    "ring slot still holds an unqueued frame"
                );
                return Err(OutputError::Stall {
                    what: "ring slot awaiting transfer",
                    waited,
                });
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
            slot.lock_image_for_read(READER);
            state = slot.state(READER);
        }
        Ok(state)
    }

    fn issue_async(
        &self,
        channel: &Channel,
        read_count: u64,
        read_index: usize,
        framebuffer: &Arc<G::Framebuffer>,
    ) -> Result<()> {
        let slot = channel.slot(read_index);
        let Some(buffer) = slot.payload().buffer else {
            slot.unlock_image_from_read();
            return Err(OutputError::NotBound);
        };

        slot.set_state(READER, SlotState::Reading);
        let mut payload = slot.payload();
        if payload.buffer_mapped {
            self.gpu.unmap_buffer(buffer);
            payload.buffer_mapped = false;
        }
        payload.mapped = None;
        payload.framebuffer = Some(framebuffer.clone() as Arc<dyn Framebuffer>);
        payload.sequence = read_count;
        payload.issued_at = Some(Instant::now());
        drop(payload);

        self.profiler.lock().start_gpu();
        self.gpu.read_into_buffer(framebuffer, buffer, &self.layout);
        Ok(())
    }

    fn issue_direct(
        &self,
        channel: &Channel,
        read_count: u64,
        read_index: usize,
        framebuffer: &Arc<G::Framebuffer>,
    ) -> Result<()> {
        let slot = channel.slot(read_index);
        slot.set_state(READER, SlotState::Reading);

        let mut payload = slot.payload();
        payload.framebuffer = Some(framebuffer.clone() as Arc<dyn Framebuffer>);
        payload.sequence = read_count;
        payload.issued_at = Some(Instant::now());

        let landed = match HostImage::zeroed(channel.buffer_len()) {
            Ok(mut host) => {
                self.profiler.lock().start_gpu();
                self.gpu.read_pixels(framebuffer, &self.layout, &mut host);
                self.profiler.lock().end_gpu();
                payload.host_image = Some(host);
                true
            }
            Err(e) => {
                error!(error = %e, "host image allocation failed");
                false
            }
        };
        drop(payload);

        if landed {
            slot.set_state(READER, SlotState::Mapped);
        } else {
            self.record_drop(slot, read_count);
            slot.set_state(READER, SlotState::Failed);
        }
        slot.unlock_image_from_read();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use crate::gpu::{SoftwareFramebuffer, SoftwareGpu};

    const LAYOUT: ReadLayout = ReadLayout {
        width: 2,
        height: 2,
        format: DataFormat::Rgb8,
    };

    fn readback(gpu: &Arc<SoftwareGpu>, method: TransferMethod) -> Readback<SoftwareGpu> {
        Readback::new(
            gpu.clone(),
            LAYOUT,
            method,
            Duration::from_millis(50),
            Arc::new(Mutex::new(Profiler::new(false, 5))),
        )
    }

    fn fb(value: u8) -> Arc<SoftwareFramebuffer> {
        Arc::new(SoftwareFramebuffer::filled(value as u64, 12, value))
    }

    #[test]
    fn first_cycle_maps_nothing_then_lags_by_one() {
        let gpu = Arc::new(SoftwareGpu::new());
        let rb = readback(&gpu, TransferMethod::Ipbo);
        let channel = Channel::new(0, 3, 12, false);
        rb.allocate(&channel).unwrap();

        rb.read(&channel, 0, 0, &fb(1)).unwrap();
        assert_eq!(gpu.map_calls(), 0);
        assert_eq!(channel.slot(0).state("TEST"), SlotState::Reading);
        assert_eq!(channel.slot(0).image_holder(), Some(READER));

        rb.read(&channel, 1, 1, &fb(2)).unwrap();
        assert_eq!(gpu.map_calls(), 1);
        assert_eq!(channel.slot(0).state("TEST"), SlotState::Mapped);
        assert!(channel.slot(0).image_holder().is_none());
        assert_eq!(gpu.mapped_buffers(), 0);

        channel.slot(0).lock_image("TEST");
        let payload = channel.slot(0).payload();
        assert_eq!(&payload.host_image.as_deref().unwrap()[..], &[1; 12]);
    }

    #[test]
    fn deferred_mode_keeps_buffer_mapped_until_reuse() {
        let gpu = Arc::new(SoftwareGpu::new());
        let rb = readback(&gpu, TransferMethod::Ppbo);
        let channel = Channel::new(0, 2, 12, false);
        rb.allocate(&channel).unwrap();

        rb.read(&channel, 0, 0, &fb(1)).unwrap();
        rb.read(&channel, 1, 1, &fb(2)).unwrap();
        assert_eq!(gpu.mapped_buffers(), 1);

        // Stand in for the transfer engine queueing slot 0.
        let slot = channel.slot(0);
        slot.lock_image("TEST");
        assert_eq!(&slot.payload().mapped.take().unwrap()[..], &[1; 12]);
        slot.set_state("TEST", SlotState::Transferring);
        slot.set_state("TEST", SlotState::NeedsUnmap);
        slot.unlock_image();

        rb.read(&channel, 2, 0, &fb(3)).unwrap();
        // Slot 0 unmapped for reuse, slot 1 mapped by its finalize.
        assert_eq!(gpu.mapped_buffers(), 1);
        assert_eq!(channel.slot(0).state("TEST"), SlotState::Reading);
    }

    #[test]
    fn failed_map_marks_slot_and_counts_drop() {
        let gpu = Arc::new(SoftwareGpu::new());
        gpu.fail_map_call(1);
        let rb = readback(&gpu, TransferMethod::Ipbo);
        let channel = Channel::new(0, 3, 12, false);
        rb.allocate(&channel).unwrap();

        rb.read(&channel, 0, 0, &fb(1)).unwrap();
        rb.read(&channel, 1, 1, &fb(2)).unwrap();
        assert_eq!(channel.slot(0).state("TEST"), SlotState::Failed);
        assert_eq!(rb.dropped(), 1);
        assert!(!channel.slot(0).reader_holds_image());
    }

    #[test]
    fn unqueued_slot_stalls_the_reader() {
        let gpu = Arc::new(SoftwareGpu::new());
        let rb = readback(&gpu, TransferMethod::Basic);
        let channel = Channel::new(0, 1, 12, false);
        rb.allocate(&channel).unwrap();

        rb.read(&channel, 0, 0, &fb(1)).unwrap();
        assert_eq!(channel.slot(0).state("TEST"), SlotState::Mapped);
        assert!(matches!(
            rb.read(&channel, 1, 0, &fb(2)),
            Err(OutputError::Stall { .. })
        ));
        assert!(channel.slot(0).image_holder().is_none());
    }

    #[test]
    fn release_frees_buffers_and_framebuffers() {
        let gpu = Arc::new(SoftwareGpu::new());
        let rb = readback(&gpu, TransferMethod::Ipbo);
        let channel = Channel::new(0, 3, 12, false);
        rb.allocate(&channel).unwrap();
        assert_eq!(gpu.live_buffers(), 3);

        let source = fb(1);
        source.begin_external_readback();
        rb.read(&channel, 0, 0, &source).unwrap();
        assert!(channel.slot(0).release_stuck_reader("TEST"));

        rb.release(&channel);
        assert_eq!(gpu.live_buffers(), 0);
        assert!(!source.in_readback());
        assert_eq!(channel.count_in(SlotState::NotReady), 3);
    }
}
