//! Request processing statistics

use crate::pipeline::callback::FailureReason;
use std::collections::VecDeque;
use std::time::Duration;

/// Size of the rolling window for recent capture times
const RECENT_WINDOW_SIZE: usize = 100;

/// Counters and capture timing for one processor
///
/// Every accepted request ends up counted exactly once, in `completed` or in
/// `failed`; `flushed`, `shutdown_failures`, `buffer_errors`, `sensor_errors`
/// and `settings_errors` break `failed` down by reason.
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    /// Requests accepted by `process_pipeline_requests`
    pub submitted: u64,
    /// Requests delivered on the success path
    pub completed: u64,
    /// Requests delivered on the failure path
    pub failed: u64,
    pub flushed: u64,
    pub shutdown_failures: u64,
    pub buffer_errors: u64,
    pub sensor_errors: u64,
    pub settings_errors: u64,
    /// Buffers delivered with `BufferStatus::Ok`
    pub buffers_ok: u64,
    /// Buffers delivered with `BufferStatus::Error`, on either path
    pub buffers_failed: u64,
    /// Requests waiting in the queue when the snapshot was taken
    pub queue_depth: usize,

    /// Total capture time in microseconds
    pub total_capture_time_us: u64,
    /// Minimum capture time observed (microseconds)
    pub min_capture_time_us: u64,
    /// Maximum capture time observed (microseconds)
    pub max_capture_time_us: u64,
    /// Rolling window of recent capture times
    pub recent_capture_times: VecDeque<u64>,
}

impl Default for ProcessorStats {
    fn default() -> Self {
        Self {
            submitted: 0,
            completed: 0,
            failed: 0,
            flushed: 0,
            shutdown_failures: 0,
            buffer_errors: 0,
            sensor_errors: 0,
            settings_errors: 0,
            buffers_ok: 0,
            buffers_failed: 0,
            queue_depth: 0,
            total_capture_time_us: 0,
            min_capture_time_us: u64::MAX,
            max_capture_time_us: 0,
            recent_capture_times: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl ProcessorStats {
    /// Record a request delivered on the success path
    pub fn record_capture(&mut self, elapsed: Duration, buffers_ok: usize, buffers_failed: usize) {
        let time_us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.completed += 1;
        self.buffers_ok += buffers_ok as u64;
        self.buffers_failed += buffers_failed as u64;
        self.total_capture_time_us += time_us;
        self.min_capture_time_us = self.min_capture_time_us.min(time_us);
        self.max_capture_time_us = self.max_capture_time_us.max(time_us);

        self.recent_capture_times.push_back(time_us);
        if self.recent_capture_times.len() > RECENT_WINDOW_SIZE {
            self.recent_capture_times.pop_front();
        }
    }

    /// Record a request delivered on the failure path
    pub fn record_failure(&mut self, reason: FailureReason, buffers: usize) {
        self.failed += 1;
        self.buffers_failed += buffers as u64;
        match reason {
            FailureReason::Flushed => self.flushed += 1,
            FailureReason::Shutdown => self.shutdown_failures += 1,
            FailureReason::BufferError => self.buffer_errors += 1,
            FailureReason::SensorError => self.sensor_errors += 1,
            FailureReason::InvalidSettings => self.settings_errors += 1,
        }
    }

    /// Requests accepted but not yet delivered either way
    pub fn outstanding(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }

    /// Average capture time in microseconds
    pub fn avg_capture_time_us(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_capture_time_us as f64 / self.completed as f64
        }
    }

    /// Success rate over delivered requests as a percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            100.0
        } else {
            (self.completed as f64 / total as f64) * 100.0
        }
    }

    /// Jitter (max - min) over the recent window in microseconds
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_capture_times.iter().min().copied().unwrap_or(0);
        let max = self.recent_capture_times.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = ProcessorStats::default();
        assert_eq!(stats.avg_capture_time_us(), 0.0);
        assert_eq!(stats.success_rate(), 100.0);
        assert_eq!(stats.jitter_us(), 0);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn test_record_capture() {
        let mut stats = ProcessorStats::default();
        stats.submitted = 3;
        stats.record_capture(Duration::from_micros(100), 2, 0);
        stats.record_capture(Duration::from_micros(300), 1, 1);

        assert_eq!(stats.completed, 2);
        assert_eq!(stats.buffers_ok, 3);
        assert_eq!(stats.buffers_failed, 1);
        assert_eq!(stats.min_capture_time_us, 100);
        assert_eq!(stats.max_capture_time_us, 300);
        assert_eq!(stats.avg_capture_time_us(), 200.0);
        assert_eq!(stats.jitter_us(), 200);
        assert_eq!(stats.outstanding(), 1);
    }

    #[test]
    fn test_record_failure_by_reason() {
        let mut stats = ProcessorStats::default();
        stats.record_capture(Duration::from_micros(10), 1, 0);
        stats.record_failure(FailureReason::Flushed, 2);
        stats.record_failure(FailureReason::SensorError, 1);
        stats.record_failure(FailureReason::BufferError, 3);

        assert_eq!(stats.failed, 3);
        assert_eq!(stats.flushed, 1);
        assert_eq!(stats.sensor_errors, 1);
        assert_eq!(stats.buffer_errors, 1);
        assert_eq!(stats.buffers_failed, 6);
        assert_eq!(stats.success_rate(), 25.0);

        stats.reset();
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let mut stats = ProcessorStats::default();
        for i in 0..(RECENT_WINDOW_SIZE as u64 + 20) {
            stats.record_capture(Duration::from_micros(i), 1, 0);
        }
        assert_eq!(stats.recent_capture_times.len(), RECENT_WINDOW_SIZE);
    }
}
