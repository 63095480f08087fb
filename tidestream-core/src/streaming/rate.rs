//! Smoothed read throughput of a stream.

use tokio::time::Instant;

/// Exponential moving average of bytes delivered per second.
///
/// One sample is taken per read call that returned data. The elapsed time of
/// a sample runs from the previous sample (or creation) to the current call.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    smoothing: f64,
    average: f64,
    last_sample: Instant,
}

impl RateEstimator {
    /// Creates an estimator with a zero rate, timed from `started`.
    pub fn new(smoothing: f64, started: Instant) -> Self {
        Self {
            smoothing,
            average: 0.0,
            last_sample: started,
        }
    }

    /// Current smoothed rate in bytes per second.
    pub fn average(&self) -> f64 {
        self.average
    }

    /// Folds a read of `bytes` completed at `now` into the average.
    ///
    /// Empty reads and samples with no elapsed time are ignored.
    pub fn record(&mut self, bytes: usize, now: Instant) {
        if bytes == 0 {
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let observed = bytes as f64 / elapsed;
        self.average = self.average * (1.0 - self.smoothing) + observed * self.smoothing;
        self.last_sample = now;
    }

    #[cfg(test)]
    pub(crate) fn set_average(&mut self, average: f64) {
        self.average = average;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_first_sample_is_weighted_by_smoothing() {
        let start = Instant::now();
        let mut estimator = RateEstimator::new(0.3, start);

        estimator.record(1000, start + Duration::from_secs(1));

        assert!((estimator.average() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_converges_toward_steady_rate() {
        let start = Instant::now();
        let mut estimator = RateEstimator::new(0.3, start);

        for second in 1..=40 {
            estimator.record(2048, start + Duration::from_secs(second));
        }

        assert!((estimator.average() - 2048.0).abs() < 1.0);
    }

    #[test]
    fn test_zero_elapsed_sample_is_skipped() {
        let start = Instant::now();
        let mut estimator = RateEstimator::new(0.3, start);

        estimator.record(4096, start);

        assert_eq!(estimator.average(), 0.0);
    }

    #[test]
    fn test_empty_read_keeps_previous_sample_time() {
        let start = Instant::now();
        let mut estimator = RateEstimator::new(0.5, start);

        estimator.record(0, start + Duration::from_secs(1));
        estimator.record(1000, start + Duration::from_secs(2));

        // Elapsed is measured from creation, not from the empty read.
        assert!((estimator.average() - 250.0).abs() < 1e-9);
    }
}
