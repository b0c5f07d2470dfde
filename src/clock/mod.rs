//! Local time sources.
//!
//! The sync core never formats or converts calendar dates. It only consumes
//! "now" as a signed count of microseconds since the Unix epoch and produces
//! values in the same representation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use self::unix::process_cpu_time;
#[cfg(windows)]
pub use self::windows::process_cpu_time;

/// Wall-clock reading in microseconds since 1970-01-01 UTC.
pub trait LocalClock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// The operating system realtime clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_us(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_micros() as i64,
            // Clock set before 1970
            Err(e) => -(e.duration().as_micros() as i64),
        }
    }
}

/// A shared, manually driven clock.
///
/// Clones observe the same value, so a simulated transport can advance the
/// clock that the client under test reads.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        ManualClock {
            now_us: Arc::new(AtomicI64::new(start_us)),
        }
    }

    pub fn set_us(&self, value: i64) {
        self.now_us.store(value, Ordering::SeqCst);
    }

    pub fn advance_us(&self, delta: i64) {
        self.now_us.fetch_add(delta, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

impl<C: LocalClock + ?Sized> LocalClock for Arc<C> {
    fn now_us(&self) -> i64 {
        (**self).now_us()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_us() > 1_577_836_800_000_000);
    }

    #[test]
    fn test_manual_clock_clones_share_state() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        other.advance_us(250);
        assert_eq!(clock.now_us(), 1_250);
        clock.set_us(-5);
        assert_eq!(other.now_us(), -5);
    }

    #[test]
    fn test_process_cpu_time_is_monotonic() {
        let a = process_cpu_time();
        let mut x = 0u64;
        for i in 0..200_000u64 {
            x = x.wrapping_mul(31).wrapping_add(i);
        }
        assert!(x != 1);
        let b = process_cpu_time();
        assert!(a >= 0.0);
        assert!(b >= a);
    }
}
