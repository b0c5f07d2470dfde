use std::time::{Duration, Instant};

/// Measures monotonic time since `start()`.
///
/// An invalidated (or never started) timer reports zero elapsed time and never
/// expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElapsedTimer {
    start: Option<Instant>,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        ElapsedTimer { start: None }
    }

    pub fn started() -> Self {
        ElapsedTimer {
            start: Some(Instant::now()),
        }
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn start_at(&mut self, at: Instant) {
        self.start = Some(at);
    }

    /// Restarts the timer and returns the time elapsed before the restart.
    #[must_use]
    pub fn restart(&mut self) -> Duration {
        let now = Instant::now();
        let delta = self.elapsed_at(now);
        self.start = Some(now);
        delta
    }

    pub fn invalidate(&mut self) {
        self.start = None;
    }

    pub fn is_running(&self) -> bool {
        self.start.is_some()
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match self.start {
            Some(start) => now.saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed().as_secs()
    }

    /// A zero timeout expires immediately once running.
    pub fn has_expired(&self, timeout: Duration) -> bool {
        self.has_expired_at(timeout, Instant::now())
    }

    pub fn has_expired_at(&self, timeout: Duration, now: Instant) -> bool {
        if !self.is_running() {
            return false;
        }
        self.elapsed_at(now) >= timeout
    }
}
