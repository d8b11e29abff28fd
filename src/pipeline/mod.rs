pub mod handoff;

pub use handoff::{Handoff, HandoffPixels, HandoffQueue, QueueStats};
