use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::info;

/// Lock waits longer than this are reported when verbose.
pub const SLOW_LOCK: Duration = Duration::from_millis(1);

/// Spawn an OS thread carrying `name` (visible in debuggers and profilers).
pub fn spawn_named<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Lock `mutex`, reporting slow acquisitions when `verbose` is set.
pub fn lock_timed<'a, T>(
    mutex: &'a Mutex<T>,
    verbose: bool,
    role: &str,
    what: &str,
) -> MutexGuard<'a, T> {
    if !verbose {
        return mutex.lock();
    }
    let start = Instant::now();
    let guard = mutex.lock();
    report_wait(start.elapsed(), role, what);
    guard
}

pub(crate) fn report_wait(waited: Duration, role: &str, what: &str) {
    if waited > SLOW_LOCK {
        info!(role, waited_us = waited.as_micros() as u64, "{what} for {waited:?}");
    }
}

/// Expand a frame-numbered output path.
///
/// `#` becomes the 4-digit zero padded frame number, `@` the unpadded one.
/// Paths without either marker are returned unchanged.
pub fn expand_frame_pattern(pattern: &str, frame: i64) -> String {
    pattern
        .replace('#', &format!("{frame:04}"))
        .replace('@', &frame.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_patterns() {
        assert_eq!(expand_frame_pattern("out.#.png", 7), "out.0007.png");
        assert_eq!(expand_frame_pattern("out.@.png", 7), "out.7.png");
        assert_eq!(expand_frame_pattern("movie.png", 7), "movie.png");
    }

    #[test]
    fn named_threads_carry_their_name() {
        let handle = spawn_named("OVD Test", || thread::current().name().map(str::to_string)).unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("OVD Test"));
    }
}
