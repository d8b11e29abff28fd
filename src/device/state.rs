//! Cursors and lifecycle flags shared by the render thread and both pipeline threads.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::utils::lock_timed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub ring_size: usize,
    /// Slot the next `transfer()` reads into.
    pub read_index: usize,
    /// Completed `transfer()` cycles since bind.
    pub read_count: u64,
    /// Slot the transfer engine services next.
    pub write_index: usize,
    /// Cycles the transfer engine has queued since bind.
    pub write_count: u64,
    pub bound: bool,
    pub thread_stop: bool,
    pub transfer_done: bool,
    pub writer_done: bool,
    pub writer_error: Option<String>,
}

impl DeviceState {
    fn new(ring_size: usize) -> Self {
        Self {
            ring_size: ring_size.max(1),
            read_index: 0,
            read_count: 0,
            write_index: 0,
            write_count: 0,
            bound: false,
            thread_stop: false,
            transfer_done: false,
            writer_done: false,
            writer_error: None,
        }
    }

    /// Back to the post-open state, ready for a new bind.
    pub fn reset(&mut self) {
        *self = Self::new(self.ring_size);
    }

    pub fn advance_read(&mut self) {
        self.read_count += 1;
        self.read_index = (self.read_count % self.ring_size as u64) as usize;
    }

    pub fn advance_write(&mut self) {
        self.write_count += 1;
        self.write_index = (self.write_count % self.ring_size as u64) as usize;
    }

    /// Frames issued by the renderer that the transfer engine has not queued yet.
    pub fn in_flight(&self) -> u64 {
        self.read_count.saturating_sub(self.write_count)
    }
}

/// The device lock plus the condition variable signalled on every cursor or flag change.
#[derive(Debug)]
pub struct DeviceLock {
    state: Mutex<DeviceState>,
    changed: Condvar,
    verbose: bool,
}

impl DeviceLock {
    pub fn new(ring_size: usize, verbose: bool) -> Self {
        Self {
            state: Mutex::new(DeviceState::new(ring_size)),
            changed: Condvar::new(),
            verbose,
        }
    }

    pub fn lock(&self, role: &str) -> MutexGuard<'_, DeviceState> {
        lock_timed(&self.state, self.verbose, role, "lockDevice")
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Sleep on the condition variable for at most `timeout`.
    ///
    /// Returns `true` if woken by a notification.
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, DeviceState>, timeout: Duration) -> bool {
        !self.changed.wait_for(guard, timeout).timed_out()
    }

    /// Block until `ready` holds or `timeout` passes. Returns whether `ready` held.
    pub fn wait_until<F>(&self, role: &str, timeout: Duration, mut ready: F) -> bool
    where
        F: FnMut(&DeviceState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock(role);
        while !ready(&state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return ready(&state);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn cursors_wrap_at_ring_size() {
        let lock = DeviceLock::new(3, false);
        let mut state = lock.lock("TEST");
        for _ in 0..7 {
            state.advance_read();
        }
        assert_eq!((state.read_count, state.read_index), (7, 1));
        state.advance_write();
        assert_eq!(state.in_flight(), 6);

        state.reset();
        assert_eq!(state.read_count, 0);
        assert_eq!(state.ring_size, 3);
    }

    #[test]
    fn wait_until_wakes_on_notify() {
        let lock = Arc::new(DeviceLock::new(3, false));
        let setter = {
            let lock = lock.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lock.lock("SETTER").transfer_done = true;
                lock.notify();
            })
        };
        assert!(lock.wait_until("WAITER", Duration::from_secs(5), |s| s.transfer_done));
        setter.join().unwrap();
    }

    #[test]
    fn wait_until_gives_up() {
        let lock = DeviceLock::new(3, false);
        assert!(!lock.wait_until("WAITER", Duration::from_millis(5), |s| s.writer_done));
    }
}
