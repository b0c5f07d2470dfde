use crate::clock::process_cpu_time;

/// Process CPU time stopwatch with sampling.
///
/// Samples are accumulated with compensated summation so long-running
/// averages do not lose precision.
#[derive(Debug, Clone, Default)]
pub struct CpuTickTimer {
    start: f64,
    end: f64,
    running: bool,
    total: f64,
    compensation: f64,
    last_sample: f64,
    samples: usize,
}

impl CpuTickTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started() -> Self {
        let mut timer = Self::default();
        timer.start();
        timer
    }

    pub fn start(&mut self) {
        self.start = process_cpu_time();
        self.end = self.start;
        self.running = true;
    }

    pub fn restart(&mut self) {
        self.reset_samples();
        self.start();
    }

    pub fn stop(&mut self) {
        if self.running {
            self.end = process_cpu_time();
            self.running = false;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// CPU seconds since start (up to `stop()` if stopped).
    pub fn elapsed(&self) -> f64 {
        let end = if self.running { process_cpu_time() } else { self.end };
        end - self.start
    }

    /// Closes the current sample window and opens the next one.
    /// The first call on a stopped timer only starts it.
    pub fn record_sample(&mut self) -> f64 {
        if !self.running {
            self.start();
            self.last_sample = 0.0;
            return 0.0;
        }
        let now = process_cpu_time();
        self.add_sample(now - self.start);
        self.start = now;
        self.last_sample
    }

    fn add_sample(&mut self, sample: f64) {
        self.last_sample = sample;
        let y = sample - self.compensation;
        let t = self.total + y;
        self.compensation = (t - self.total) - y;
        self.total = t;
        self.samples += 1;
    }

    pub fn reset_samples(&mut self) {
        self.total = 0.0;
        self.compensation = 0.0;
        self.last_sample = 0.0;
        self.samples = 0;
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// NaN when no samples were recorded.
    pub fn average(&self) -> f64 {
        if self.samples == 0 {
            return f64::NAN;
        }
        self.total / self.samples as f64
    }

    pub fn last_sample(&self) -> f64 {
        self.last_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burn() -> u64 {
        let mut x = 1u64;
        for i in 0..300_000u64 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
        x
    }

    #[test]
    fn test_empty_average_is_nan() {
        let timer = CpuTickTimer::new();
        assert_eq!(timer.sample_count(), 0);
        assert!(timer.average().is_nan());
    }

    #[test]
    fn test_first_sample_starts_timer() {
        let mut timer = CpuTickTimer::new();
        assert_eq!(timer.record_sample(), 0.0);
        assert!(timer.is_running());
        assert_eq!(timer.sample_count(), 0);

        assert!(burn() != 0);
        let s = timer.record_sample();
        assert!(s >= 0.0);
        assert_eq!(timer.sample_count(), 1);
        assert_eq!(timer.last_sample(), s);
        assert!((timer.average() - s).abs() < 1e-12);
    }

    #[test]
    fn test_compensated_sum_of_small_samples() {
        let mut timer = CpuTickTimer::new();
        for _ in 0..10_000 {
            timer.add_sample(0.1);
        }
        assert_eq!(timer.sample_count(), 10_000);
        assert!((timer.total() - 1000.0).abs() < 1e-9);
        assert!((timer.average() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_stop_freezes_elapsed() {
        let mut timer = CpuTickTimer::started();
        assert!(burn() != 0);
        timer.stop();
        let frozen = timer.elapsed();
        assert!(burn() != 0);
        assert_eq!(timer.elapsed(), frozen);

        timer.restart();
        assert!(timer.is_running());
        assert_eq!(timer.sample_count(), 0);
    }
}
