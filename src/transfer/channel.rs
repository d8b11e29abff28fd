use super::slot::{FrameSlot, SlotState};

/// The ring of slots feeding one output view (one eye in stereo).
#[derive(Debug)]
pub struct Channel {
    index: usize,
    buffer_len: usize,
    slots: Vec<FrameSlot>,
}

impl Channel {
    pub fn new(index: usize, ring_size: usize, buffer_len: usize, verbose: bool) -> Self {
        let slots = (0..ring_size)
            .map(|i| FrameSlot::new(index, i, verbose))
            .collect();
        Self {
            index,
            buffer_len,
            slots,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Size in bytes of one frame of this channel.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index % self.slots.len()]
    }

    /// The slot read one cycle before `index`.
    pub fn previous(&self, index: usize) -> &FrameSlot {
        let n = self.slots.len();
        self.slot((index + n - 1) % n)
    }

    pub fn slots(&self) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter()
    }

    pub fn count_in(&self, state: SlotState) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state("STATS") == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_wraps_around_the_ring() {
        let channel = Channel::new(0, 3, 12, false);
        assert_eq!(channel.previous(0).index(), 2);
        assert_eq!(channel.previous(1).index(), 0);
        assert_eq!(channel.slot(4).index(), 1);
        assert_eq!(channel.count_in(SlotState::NotReady), 3);
    }
}
