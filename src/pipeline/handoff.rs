//! Hand-off queue between the transfer engine and the writer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{OutputError, Result};
use crate::frame::HostImage;
use crate::gpu::Framebuffer;

/// Pixels moved out of a slot when it is queued.
pub enum HandoffPixels {
    /// Host copy; ownership passes to the writer untouched.
    Host(HostImage),
    /// Mapped pixel-buffer view; the writer copies it out.
    Mapped(Bytes),
}

impl HandoffPixels {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            HandoffPixels::Host(image) => image,
            HandoffPixels::Mapped(bytes) => bytes,
        }
    }
}

/// One completed frame (or drop notice) in render order.
pub struct Handoff {
    pub sequence: u64,
    pub channel: usize,
    pub slot: usize,
    /// `None` when the read-back failed and the frame was dropped.
    pub pixels: Option<HandoffPixels>,
    /// Framebuffer to release from external read-back once consumed.
    pub framebuffer: Option<Arc<dyn Framebuffer>>,
    pub queued_at: Instant,
}

impl Handoff {
    pub fn is_dropped(&self) -> bool {
        self.pixels.is_none()
    }

    /// End the external read-back on the source framebuffer, if still held.
    pub fn release_framebuffer(&mut self) {
        if let Some(fb) = self.framebuffer.take() {
            fb.end_external_readback();
        }
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("sequence", &self.sequence)
            .field("channel", &self.channel)
            .field("slot", &self.slot)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    /// Drop notices pushed.
    pub dropped: u64,
    pub queued: usize,
}

/// FIFO of completed frames.
///
/// Unbounded by itself; the finite number of ring slots limits how far the
/// producer can run ahead. Closing drops the sender, after which `pop` drains
/// what is left and then reports [`OutputError::Closed`].
pub struct HandoffQueue {
    tx: Mutex<Option<Sender<Handoff>>>,
    rx: Receiver<Handoff>,
    stats: CachePadded<Stats>,
}

impl Default for HandoffQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: append and wake every waiting consumer.
    ///
    /// Returns the entry back if the queue is already closed.
    pub fn push(&self, item: Handoff) -> std::result::Result<(), Handoff> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(item);
        };
        let dropped = item.is_dropped();
        tx.send(item).map_err(|e| e.into_inner())?;
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Consumer: block until an entry is available or the queue is closed and empty.
    pub fn pop(&self) -> Result<Handoff> {
        let item = self.rx.recv().map_err(|_| OutputError::Closed)?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    /// Like [`HandoffQueue::pop`], reporting a stall after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Handoff> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Ok(item)
            }
            Err(RecvTimeoutError::Timeout) => Err(OutputError::Stall {
                what: "frame hand-off queue",
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(OutputError::Closed),
        }
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            queued: self.len(),
        }
    }
}
