//! Ring-buffered GPU read-back: slots, channels, the render-thread read path
//! and the "OVD Transfer" thread that queues finished frames.

pub mod channel;
pub mod engine;
pub mod readback;
pub mod slot;

pub use channel::Channel;
pub use engine::TransferEngine;
pub use readback::Readback;
pub use slot::{FrameSlot, ImageLock, SlotPayload, SlotState};
