//! Ring-buffer cell: GPU resource, host payload and the per-slot state machine.
//!
//! Each slot carries two independent locks. The state lock is only ever held
//! long enough to read or write [`SlotState`]. The image lock is held for the
//! whole duration of any GPU access or payload mutation, and can be released
//! by a different call (or thread) than the one that took it: the render
//! thread takes it when it issues a read-back and only gives it up one cycle
//! later when the read-back is finalized.
//!
//! Lock order is image lock first, then state lock. A thread holding the state
//! lock never waits for the image lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::frame::HostImage;
use crate::gpu::{BufferHandle, Framebuffer};
use crate::utils::{lock_timed, report_wait};

/// Lifecycle of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// No GPU resource yet (before bind, after unbind).
    NotReady,
    /// Resource allocated, free for the next read-back.
    Ready,
    /// A read-back into this slot has been issued; only the issuer may touch it.
    Reading,
    /// Picked up by the transfer engine, being queued for the writer.
    Transferring,
    /// Queued; the GPU mapping must be released before the next read-back.
    NeedsUnmap,
    /// Host-visible pixels are ready for the transfer engine.
    Mapped,
    /// The read-back could not be mapped; the frame is dropped.
    Failed,
}

impl SlotState {
    /// Whether the state machine allows `self -> to`.
    pub fn can_transition(self, to: SlotState) -> bool {
        use SlotState::*;
        match (self, to) {
            (_, NotReady) => true,
            (NotReady, Ready) => true,
            (Ready | NeedsUnmap | Transferring | Mapped, Reading) => true,
            (Reading, Mapped | Failed | Transferring) => true,
            (Mapped | Failed, Transferring) => true,
            (Transferring, NeedsUnmap) => true,
            (NeedsUnmap | Transferring, Mapped) => true,
            (from, to) => from == to,
        }
    }

    /// States in which a previous frame still waits for the transfer engine.
    pub fn awaiting_transfer(self) -> bool {
        matches!(self, SlotState::Mapped | SlotState::Failed)
    }
}

/// Lock whose ownership is not tied to a stack frame.
///
/// Acquired by one call and released by a later one, possibly from another
/// thread, which a scoped mutex guard cannot express.
#[derive(Default)]
pub struct ImageLock {
    holder: Mutex<Option<&'static str>>,
    freed: Condvar,
}

impl ImageLock {
    /// Block until the lock is free, then take it on behalf of `role`.
    pub fn acquire(&self, role: &'static str) {
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.freed.wait(&mut holder);
        }
        *holder = Some(role);
    }

    /// Like [`ImageLock::acquire`] but gives up after `timeout`.
    pub fn try_acquire_for(&self, role: &'static str, timeout: Duration) -> bool {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            self.freed
                .wait_while_for(&mut holder, |holder| holder.is_some(), timeout);
        }
        if holder.is_some() {
            return false;
        }
        *holder = Some(role);
        true
    }

    /// Release the lock. Returns `false` if it was not held.
    pub fn release(&self) -> bool {
        let was_held = self.holder.lock().take().is_some();
        self.freed.notify_all();
        was_held
    }

    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.lock()
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }
}

/// Data guarded by the image lock.
#[derive(Default)]
pub struct SlotPayload {
    /// Pixel-buffer object, present between bind and unbind on the PBO path.
    pub buffer: Option<BufferHandle>,
    /// Reserved for GPU fence synchronization.
    pub fence: Option<u64>,
    /// Page-aligned copy of the pixels (immediate-copy mode).
    pub host_image: Option<HostImage>,
    /// View of the mapped pixel buffer (deferred mode).
    pub mapped: Option<Bytes>,
    /// The pixel buffer is still mapped on the GPU side.
    pub buffer_mapped: bool,
    /// Framebuffer whose external read-back this slot holds open.
    pub framebuffer: Option<Arc<dyn Framebuffer>>,
    /// Render-call sequence number of the frame in this slot.
    pub sequence: u64,
    /// When the GPU read-back for this frame was issued.
    pub issued_at: Option<Instant>,
}

impl SlotPayload {
    pub fn has_pixels(&self) -> bool {
        self.host_image.is_some() || self.mapped.is_some()
    }
}

impl fmt::Debug for SlotPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPayload")
            .field("buffer", &self.buffer)
            .field("host_image", &self.host_image)
            .field("mapped", &self.mapped.as_ref().map(Bytes::len))
            .field("buffer_mapped", &self.buffer_mapped)
            .field("framebuffer", &self.framebuffer.as_ref().map(|fb| fb.id()))
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// One cell of a channel's ring buffer.
pub struct FrameSlot {
    index: usize,
    channel: usize,
    verbose: bool,
    state: Mutex<SlotState>,
    image: ImageLock,
    payload: Mutex<SlotPayload>,
    reader_holds_image: AtomicBool,
}

impl FrameSlot {
    pub fn new(channel: usize, index: usize, verbose: bool) -> Self {
        Self {
            index,
            channel,
            verbose,
            state: Mutex::new(SlotState::NotReady),
            image: ImageLock::default(),
            payload: Mutex::new(SlotPayload::default()),
            reader_holds_image: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    fn state_guard(&self, role: &str) -> MutexGuard<'_, SlotState> {
        lock_timed(&self.state, self.verbose, role, "lockState")
    }

    pub fn state(&self, role: &str) -> SlotState {
        *self.state_guard(role)
    }

    /// Move to `to`, returning the previous state.
    pub fn set_state(&self, role: &str, to: SlotState) -> SlotState {
        let mut state = self.state_guard(role);
        let from = *state;
        debug_assert!(
            from.can_transition(to),
            "slot {}/{}: illegal transition {from:?} -> {to:?}",
            self.channel,
            self.index
        );
        *state = to;
        trace!(channel = self.channel, slot = self.index, ?from, ?to, role, "slot state");
        from
    }

    /// Read the state and, unless it is `keep`, replace it with `to`.
    pub fn set_state_unless(&self, role: &str, keep: SlotState, to: SlotState) -> SlotState {
        let mut state = self.state_guard(role);
        let from = *state;
        if from != keep {
            *state = to;
            trace!(channel = self.channel, slot = self.index, ?from, ?to, role, "slot state");
        }
        from
    }

    pub fn lock_image(&self, role: &'static str) {
        if !self.verbose {
            self.image.acquire(role);
            return;
        }
        let start = Instant::now();
        self.image.acquire(role);
        report_wait(start.elapsed(), role, "lockImage");
    }

    pub fn try_lock_image_for(&self, role: &'static str, timeout: Duration) -> bool {
        self.image.try_acquire_for(role, timeout)
    }

    pub fn unlock_image(&self) -> bool {
        self.image.release()
    }

    pub fn image_holder(&self) -> Option<&'static str> {
        self.image.holder()
    }

    /// Take the image lock as the render-thread reader and record that it is held.
    pub fn lock_image_for_read(&self, role: &'static str) {
        self.lock_image(role);
        self.reader_holds_image.store(true, Ordering::Release);
    }

    /// Release a lock taken by [`FrameSlot::lock_image_for_read`].
    pub fn unlock_image_from_read(&self) {
        self.reader_holds_image.store(false, Ordering::Release);
        self.unlock_image();
    }

    pub fn reader_holds_image(&self) -> bool {
        self.reader_holds_image.load(Ordering::Acquire)
    }

    /// Payload access. Callers must hold the image lock.
    pub fn payload(&self) -> MutexGuard<'_, SlotPayload> {
        self.payload.lock()
    }

    /// Shutdown helper: if a read-back is in flight and the reader still holds
    /// the image lock, release it so no other thread stays blocked on it.
    pub fn release_stuck_reader(&self, role: &str) -> bool {
        let state = self.state_guard(role);
        if *state == SlotState::Reading && self.reader_holds_image() {
            self.reader_holds_image.store(false, Ordering::Release);
            self.image.release();
            return true;
        }
        false
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSlot")
            .field("channel", &self.channel)
            .field("index", &self.index)
            .field("state", &*self.state.lock())
            .field("image_holder", &self.image.holder())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn pipeline_transitions_are_legal() {
        use SlotState::*;
        let cycle = [
            (NotReady, Ready),
            (Ready, Reading),
            (Reading, Mapped),
            (Mapped, Transferring),
            (Transferring, NeedsUnmap),
            (NeedsUnmap, Reading),
            (Reading, Failed),
            (Failed, Transferring),
            (Mapped, Reading),
        ];
        for (from, to) in cycle {
            assert!(from.can_transition(to), "{from:?} -> {to:?}");
        }
        assert!(!Ready.can_transition(Mapped));
        assert!(!NotReady.can_transition(Reading));
        assert!(!NeedsUnmap.can_transition(Transferring));
    }

    #[test]
    fn image_lock_survives_the_acquiring_call() {
        let slot = FrameSlot::new(0, 0, false);
        slot.lock_image_for_read("READER");
        assert_eq!(slot.image_holder(), Some("READER"));
        assert!(!slot.try_lock_image_for("TRANSFER", Duration::from_millis(5)));

        slot.unlock_image_from_read();
        assert!(slot.try_lock_image_for("TRANSFER", Duration::from_millis(5)));
        assert_eq!(slot.image_holder(), Some("TRANSFER"));
    }

    #[test]
    fn release_from_another_thread_unblocks_waiter() {
        let slot = Arc::new(FrameSlot::new(0, 1, false));
        slot.lock_image_for_read("READER");
        slot.set_state("READER", SlotState::Ready);
        slot.set_state("READER", SlotState::Reading);

        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || {
                slot.lock_image("TRANSFER");
                slot.unlock_image();
            })
        };

        thread::sleep(Duration::from_millis(10));
        assert!(slot.release_stuck_reader("UNBIND"));
        waiter.join().unwrap();
        assert!(!slot.reader_holds_image());
        assert!(!slot.release_stuck_reader("UNBIND"));
    }

    #[test]
    fn image_lock_is_exclusive_under_contention() {
        let slot = Arc::new(FrameSlot::new(0, 0, false));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (slot, inside, overlaps) = (slot.clone(), inside.clone(), overlaps.clone());
                thread::spawn(move || {
                    for _ in 0..200 {
                        slot.lock_image("WORKER");
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        slot.unlock_image();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_state_unless_keeps_guarded_state() {
        let slot = FrameSlot::new(0, 0, false);
        slot.set_state("BIND", SlotState::Ready);
        slot.set_state("READER", SlotState::Reading);
        slot.set_state("READER", SlotState::Mapped);
        assert_eq!(
            slot.set_state_unless("READER", SlotState::Mapped, SlotState::Reading),
            SlotState::Mapped
        );
        assert_eq!(slot.state("TEST"), SlotState::Mapped);
    }
}
