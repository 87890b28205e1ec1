//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod gated_sensor;
pub mod slow_mapper;

use crossbeam_channel::Receiver;
use emucam::CaptureEvent;
use std::time::Duration;

/// Upper bound on how long a test waits for one notification
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Receive exactly `count` events, panicking if any fails to arrive in time
pub fn collect(events: &Receiver<CaptureEvent>, count: usize) -> Vec<CaptureEvent> {
    (0..count)
        .map(|i| {
            events
                .recv_timeout(test_timeout())
                .unwrap_or_else(|e| panic!("event {} of {} never arrived: {}", i + 1, count, e))
        })
        .collect()
}

/// Assert nothing further is waiting on the channel
pub fn assert_quiet(events: &Receiver<CaptureEvent>) {
    std::thread::sleep(Duration::from_millis(20));
    if let Ok(event) = events.try_recv() {
        panic!("unexpected event {:?}", event);
    }
}
