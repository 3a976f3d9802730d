//! Derived stream metrics
//!
//! Frame rate is estimated from `(timestamp, sequence)` samples in a sliding
//! window, so skipped display frames do not distort it: the sequence delta
//! counts every captured frame.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time view of a running stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub acquired: u64,
    /// `None` when the device has no frame counter of its own
    pub dropped: Option<i64>,
    pub occupancy: usize,
    pub inter_frame_interval: Option<Duration>,
    pub fps: f64,
}

/// Sliding-window frame rate.
#[derive(Debug)]
pub struct FpsEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl FpsEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record that frame `sequence` was captured at `timestamp`. Repeated or
    /// older sequences are ignored.
    pub fn record(&mut self, timestamp: Instant, sequence: u64) {
        if self
            .samples
            .back()
            .is_some_and(|&(_, last)| sequence <= last)
        {
            return;
        }
        self.samples.push_back((timestamp, sequence));
        self.prune(timestamp);
    }

    /// Frames per second over the window; 0.0 until two samples at least
    /// 50 ms apart exist.
    pub fn fps(&self) -> f64 {
        let (Some(&(t_old, s_old)), Some(&(t_new, s_new))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = t_new.saturating_duration_since(t_old);
        if elapsed < Duration::from_millis(50) {
            return 0.0;
        }
        (s_new - s_old) as f64 / elapsed.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for FpsEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_reads_zero() {
        assert_eq!(FpsEstimator::default().fps(), 0.0);
    }

    #[test]
    fn counts_skipped_frames() {
        let mut fps = FpsEstimator::default();
        let t0 = Instant::now();
        fps.record(t0, 1);
        // Only every fifth frame was looked at, but ten were captured.
        fps.record(t0 + Duration::from_millis(500), 6);
        fps.record(t0 + Duration::from_secs(1), 11);

        assert!((fps.fps() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ignores_repeated_sequences() {
        let mut fps = FpsEstimator::default();
        let t0 = Instant::now();
        fps.record(t0, 1);
        fps.record(t0 + Duration::from_millis(100), 1);
        assert_eq!(fps.samples.len(), 1);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let mut fps = FpsEstimator::new(Duration::from_secs(1));
        let t0 = Instant::now();
        for i in 0..5 {
            fps.record(t0 + Duration::from_secs(i), i * 30 + 1);
        }
        // 30 frames per second throughout
        assert!((fps.fps() - 30.0).abs() < 1e-9);
        assert!(fps.samples.len() <= 3);
    }
}
