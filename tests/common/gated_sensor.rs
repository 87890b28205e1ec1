//! A sensor whose captures block until the test lets them through

use crossbeam_channel::{unbounded, Receiver, Sender};
use emucam::backend::{CaptureOutcome, SensorBuffer};
use emucam::{BufferStatus, FrameNumber, SensorCapture, Settings};
use std::time::Duration;

/// Announces each capture on `started`, then waits for a token on the gate
///
/// Once the gate sender is dropped every capture proceeds immediately.
pub struct GatedSensor {
    started: Sender<FrameNumber>,
    gate: Receiver<()>,
}

/// Test-side handles for a [`GatedSensor`]
pub struct Gate {
    pub started: Receiver<FrameNumber>,
    pub release: Sender<()>,
}

impl Gate {
    /// Wait for the sensor to begin capturing a frame
    pub fn wait_started(&self) -> FrameNumber {
        self.started
            .recv_timeout(super::test_timeout())
            .expect("capture never started")
    }

    /// Let one capture finish
    pub fn open_once(&self) {
        self.release.send(()).expect("sensor gone");
    }
}

pub fn gated_sensor() -> (GatedSensor, Gate) {
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    (
        GatedSensor {
            started: started_tx,
            gate: release_rx,
        },
        Gate {
            started: started_rx,
            release: release_tx,
        },
    )
}

impl SensorCapture for GatedSensor {
    fn capture(
        &mut self,
        frame: FrameNumber,
        _settings: &Settings,
        _inputs: &mut [SensorBuffer],
        outputs: &mut [SensorBuffer],
    ) -> emucam::Result<CaptureOutcome> {
        let _ = self.started.send(frame);
        // Err means the test dropped the gate: run free
        let _ = self.gate.recv();

        for buffer in outputs.iter_mut() {
            buffer.data_mut().fill(0x80);
            buffer.complete(BufferStatus::Ok);
        }
        Ok(CaptureOutcome {
            timestamp: Duration::from_micros(frame.0 as u64 * 33_333),
        })
    }
}
