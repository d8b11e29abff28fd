//! "OVD Transfer" thread: moves finished read-backs from the ring into the
//! hand-off queue in render order.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::channel::Channel;
use super::slot::{FrameSlot, SlotState};
use crate::device::state::DeviceLock;
use crate::gpu::ReadLayout;
use crate::pipeline::{Handoff, HandoffPixels, HandoffQueue};
use crate::utils::{report_wait, spawn_named};
use crate::writer::PixelTransform;

const ROLE: &str = "TRANSFER";

/// Granularity of image-lock waits, bounding how late a stop request is noticed.
const LOCK_SLICE: Duration = Duration::from_millis(20);

pub struct TransferEngine {
    channels: Arc<Vec<Channel>>,
    device: Arc<DeviceLock>,
    queue: Arc<HandoffQueue>,
    layout: ReadLayout,
    transform: Option<Arc<dyn PixelTransform>>,
    stall_timeout: Duration,
    idle_wait: Duration,
    verbose: bool,
}

impl TransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: Arc<Vec<Channel>>,
        device: Arc<DeviceLock>,
        queue: Arc<HandoffQueue>,
        layout: ReadLayout,
        transform: Option<Arc<dyn PixelTransform>>,
        stall_timeout: Duration,
        idle_wait: Duration,
        verbose: bool,
    ) -> Self {
        Self {
            channels,
            device,
            queue,
            layout,
            transform,
            stall_timeout,
            idle_wait,
            verbose,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        spawn_named("OVD Transfer", move || self.run())
    }

    #[instrument(name = "transfer", skip_all)]
    fn run(self) {
        info!(channels = self.channels.len(), "transfer thread started");
        let last = self.channels.len().saturating_sub(1);
        let mut view = 0;
        let mut stop = self.device.lock(ROLE).thread_stop;

        while !stop {
            let write_index = self.device.lock(ROLE).write_index;
            let channel = &self.channels[view];
            let wrote = self.service(channel, channel.slot(write_index), &mut stop);

            let mut state = self.device.lock(ROLE);
            if wrote && view == last {
                state.advance_write();
                drop(state);
                self.device.notify();
                state = self.device.lock(ROLE);
            }
            if wrote {
                view = if view == last { 0 } else { view + 1 };
            }
            stop = stop || state.thread_stop;
            if !wrote && !stop {
                self.device.wait_for(&mut state, self.idle_wait);
                stop = state.thread_stop;
            }
        }

        self.device.lock(ROLE).transfer_done = true;
        self.device.notify();
        info!("transfer thread finished");
    }

    /// Queue the frame in `slot` if it has one. Returns whether anything was queued.
    fn service(&self, channel: &Channel, slot: &FrameSlot, stop: &mut bool) -> bool {
        if !matches!(
            slot.state(ROLE),
            SlotState::Mapped | SlotState::Failed | SlotState::Reading
        ) {
            return false;
        }

        // A Reading slot stays locked by the render thread until its next transfer().
        let start = Instant::now();
        let mut warned = false;
        while !slot.try_lock_image_for(ROLE, LOCK_SLICE) {
            if self.device.lock(ROLE).thread_stop {
                *stop = true;
                return false;
            }
            let waited = start.elapsed();
            if !warned && waited >= self.stall_timeout {
                warn!(
                    channel = channel.index(),
                    slot = slot.index(),
                    holder = ?slot.image_holder(),
                    ?waited,
                    "stalled waiting for a ring slot"
                );
                warned = true;
            }
        }
        if self.verbose {
            report_wait(start.elapsed(), ROLE, "lockImage");
        }

        let (thread_stop, writer_done) = {
            let state = self.device.lock(ROLE);
            (state.thread_stop, state.writer_done)
        };
        if thread_stop {
            *stop = true;
            slot.unlock_image();
            return false;
        }

        let wrote = match slot.state(ROLE) {
            SlotState::Mapped | SlotState::Failed => {
                self.hand_off(channel, slot, writer_done);
                true
            }
            _ => false,
        };
        slot.unlock_image();
        wrote
    }

    /// Move the slot's pixels into a queue entry. Caller holds the image lock.
    fn hand_off(&self, channel: &Channel, slot: &FrameSlot, writer_done: bool) {
        slot.set_state(ROLE, SlotState::Transferring);

        let mut payload = slot.payload();
        let mut pixels = payload
            .host_image
            .take()
            .map(HandoffPixels::Host)
            .or_else(|| payload.mapped.take().map(HandoffPixels::Mapped));
        let mut entry = Handoff {
            sequence: payload.sequence,
            channel: channel.index(),
            slot: slot.index(),
            pixels: None,
            framebuffer: payload.framebuffer.take(),
            queued_at: Instant::now(),
        };
        drop(payload);

        if let (Some(transform), Some(HandoffPixels::Host(image))) = (&self.transform, pixels.as_mut()) {
            transform.apply(self.layout.format, self.layout.width, self.layout.height, image);
        }
        entry.pixels = pixels;

        if writer_done {
            debug!(sequence = entry.sequence, "writer finished, discarding frame");
            entry.release_framebuffer();
        } else {
            let dropped = entry.is_dropped();
            match self.queue.push(entry) {
                Ok(()) if !dropped => metrics::counter!("ovd_frames_transferred").increment(1),
                Ok(()) => {}
                Err(mut entry) => {
                    warn!(sequence = entry.sequence, "hand-off queue closed, discarding frame");
                    entry.release_framebuffer();
                }
            }
        }

        slot.set_state(ROLE, SlotState::NeedsUnmap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use crate::frame::HostImage;
    use crate::gpu::{Framebuffer, SoftwareFramebuffer};

    const LAYOUT: ReadLayout = ReadLayout {
        width: 2,
        height: 1,
        format: DataFormat::Rgb8,
    };

    struct Invert;

    impl PixelTransform for Invert {
        fn apply(&self, _format: DataFormat, _w: usize, _h: usize, pixels: &mut [u8]) {
            pixels.iter_mut().for_each(|p| *p = !*p);
        }
    }

    fn engine(channels: usize, transform: Option<Arc<dyn PixelTransform>>) -> TransferEngine {
        let channels = (0..channels).map(|c| Channel::new(c, 2, 6, false)).collect();
        TransferEngine::new(
            Arc::new(channels),
            Arc::new(DeviceLock::new(2, false)),
            Arc::new(HandoffQueue::new()),
            LAYOUT,
            transform,
            Duration::from_secs(1),
            Duration::from_millis(1),
            false,
        )
    }

    /// Put a finished frame into slot `index` the way the render thread would.
    fn stage(channel: &Channel, index: usize, sequence: u64, value: u8) -> Arc<SoftwareFramebuffer> {
        let fb = Arc::new(SoftwareFramebuffer::filled(sequence, 6, value));
        fb.begin_external_readback();
        let slot = channel.slot(index);
        slot.lock_image("TEST");
        if slot.state("TEST") == SlotState::NotReady {
            slot.set_state("TEST", SlotState::Ready);
        }
        slot.set_state("TEST", SlotState::Reading);
        let mut host = HostImage::zeroed(6).unwrap();
        host.fill(value);
        let mut payload = slot.payload();
        payload.host_image = Some(host);
        payload.sequence = sequence;
        payload.framebuffer = Some(fb.clone() as Arc<dyn Framebuffer>);
        drop(payload);
        slot.set_state("TEST", SlotState::Mapped);
        slot.unlock_image();
        fb
    }

    #[test]
    fn mapped_slot_moves_into_queue() {
        let engine = engine(1, Some(Arc::new(Invert)));
        let channel = &engine.channels[0];
        stage(channel, 0, 0, 0x0f);

        let mut stop = false;
        assert!(engine.service(channel, channel.slot(0), &mut stop));
        assert_eq!(channel.slot(0).state("TEST"), SlotState::NeedsUnmap);

        channel.slot(0).lock_image("TEST");
        assert!(!channel.slot(0).payload().has_pixels());
        channel.slot(0).unlock_image();

        let entry = engine.queue.pop().unwrap();
        assert_eq!(entry.pixels.unwrap().as_slice(), &[0xf0; 6]);
    }

    #[test]
    fn idle_slot_is_skipped() {
        let engine = engine(1, None);
        let channel = &engine.channels[0];
        let mut stop = false;
        assert!(!engine.service(channel, channel.slot(0), &mut stop));
        assert!(engine.queue.is_empty());
    }

    #[test]
    fn failed_slot_forwards_a_drop_notice() {
        let engine = engine(1, None);
        let channel = &engine.channels[0];
        stage(channel, 0, 7, 1);
        let slot = channel.slot(0);
        slot.lock_image("TEST");
        slot.payload().host_image = None;
        slot.set_state("TEST", SlotState::Reading);
        slot.set_state("TEST", SlotState::Failed);
        slot.unlock_image();

        let mut stop = false;
        assert!(engine.service(channel, slot, &mut stop));
        let entry = engine.queue.pop().unwrap();
        assert!(entry.is_dropped());
        assert_eq!(entry.sequence, 7);
        assert_eq!(engine.queue.stats().dropped, 1);
    }

    #[test]
    fn stop_interrupts_a_locked_slot() {
        let engine = engine(1, None);
        let channel = &engine.channels[0];
        stage(channel, 0, 0, 1);
        channel.slot(0).lock_image("READER");
        engine.device.lock("TEST").thread_stop = true;

        let mut stop = false;
        assert!(!engine.service(channel, channel.slot(0), &mut stop));
        assert!(stop);
        assert_eq!(channel.slot(0).state("TEST"), SlotState::Mapped);
    }

    #[test]
    fn stereo_round_robin_advances_after_last_view() {
        let engine = engine(2, None);
        let device = engine.device.clone();
        let queue = engine.queue.clone();
        let channels = engine.channels.clone();
        for seq in 0..2u64 {
            for channel in channels.iter() {
                stage(channel, seq as usize, seq, seq as u8);
            }
        }
        let handle = engine.spawn().unwrap();

        let order: Vec<_> = (0..4)
            .map(|_| {
                let e = queue.pop_timeout(Duration::from_secs(5)).unwrap();
                (e.sequence, e.channel)
            })
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert!(device.wait_until("TEST", Duration::from_secs(5), |s| s.write_count == 2));

        device.lock("TEST").thread_stop = true;
        device.notify();
        handle.join().unwrap();
        assert!(device.lock("TEST").transfer_done);
    }
}
