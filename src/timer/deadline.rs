use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    At(Instant),
    Forever,
}

/// A point in monotonic time after which something is considered late.
///
/// Timeouts too large to represent saturate to "forever" rather than wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlineTimer {
    deadline: Option<Deadline>,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        DeadlineTimer { deadline: None }
    }

    pub fn from_timeout(timeout: Duration) -> Self {
        let mut timer = DeadlineTimer::new();
        timer.start(timeout);
        timer
    }

    pub fn from_timeout_ms(timeout_ms: u64) -> Self {
        Self::from_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn at(deadline: Instant) -> Self {
        DeadlineTimer {
            deadline: Some(Deadline::At(deadline)),
        }
    }

    pub fn start(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.deadline = Some(match now.checked_add(timeout) {
            Some(at) => Deadline::At(at),
            None => Deadline::Forever,
        });
    }

    pub fn start_at(&mut self, deadline: Instant) {
        self.deadline = Some(Deadline::At(deadline));
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn set_forever(&mut self) {
        self.deadline = Some(Deadline::Forever);
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_forever(&self) -> bool {
        self.deadline == Some(Deadline::Forever)
    }

    /// The deadline instant; `None` when stopped or forever.
    pub fn deadline(&self) -> Option<Instant> {
        match self.deadline {
            Some(Deadline::At(at)) => Some(at),
            _ => None,
        }
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        match self.deadline {
            Some(Deadline::At(at)) => now >= at,
            _ => false,
        }
    }

    /// Time left; zero once expired or when stopped, `Duration::MAX` when forever.
    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.deadline {
            Some(Deadline::At(at)) => at.saturating_duration_since(now),
            Some(Deadline::Forever) => Duration::MAX,
            None => Duration::ZERO,
        }
    }

    /// Pushes the deadline out by `by`, measured from the later of now and the
    /// current deadline. No-op when stopped.
    pub fn extend(&mut self, by: Duration) {
        if let Some(Deadline::At(at)) = self.deadline {
            let base = at.max(Instant::now());
            self.deadline = Some(match base.checked_add(by) {
                Some(next) => Deadline::At(next),
                None => Deadline::Forever,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_expires_immediately() {
        let timer = DeadlineTimer::from_timeout(Duration::ZERO);
        assert!(timer.is_running());
        assert!(timer.has_expired());
        assert_eq!(timer.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_counts_down() {
        let now = Instant::now();
        let timer = DeadlineTimer::at(now + Duration::from_millis(300));
        assert_eq!(timer.remaining_at(now), Duration::from_millis(300));
        assert!(!timer.has_expired_at(now));
        assert!(timer.has_expired_at(now + Duration::from_millis(300)));
    }

    #[test]
    fn test_huge_timeout_saturates_to_forever() {
        let timer = DeadlineTimer::from_timeout(Duration::MAX);
        assert!(timer.is_forever());
        assert!(!timer.has_expired());
        assert_eq!(timer.remaining(), Duration::MAX);
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_stop_and_forever() {
        let mut timer = DeadlineTimer::from_timeout_ms(10);
        timer.stop();
        assert!(!timer.is_running());
        assert!(!timer.has_expired());
        assert_eq!(timer.remaining(), Duration::ZERO);

        timer.set_forever();
        assert!(timer.is_running());
        assert!(timer.is_forever());
    }

    #[test]
    fn test_extend_from_expired_deadline_counts_from_now() {
        let mut timer = DeadlineTimer::from_timeout(Duration::ZERO);
        timer.extend(Duration::from_secs(5));
        assert!(!timer.has_expired());
        assert!(timer.remaining() > Duration::from_secs(4));

        let mut stopped = DeadlineTimer::new();
        stopped.extend(Duration::from_secs(1));
        assert!(!stopped.is_running());
    }
}
