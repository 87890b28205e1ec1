//! Simulated sensor
//!
//! [`SimulatedSensor`] is the default [`SensorCapture`]: it renders a test
//! pattern into every output buffer in the buffer's own pixel format and,
//! when configured, sleeps for the frame duration so timing behaves like a
//! real device.
//!
//! # Output per format
//!
//! - `YCBCR_420_888`: planar Y, Cb, Cr converted from the pattern's RGB
//! - `Y8`: luma only
//! - `RAW16`: RGGB Bayer mosaic, little-endian 16-bit samples
//! - `RGBA_8888`: packed RGBA, opaque alpha
//! - `BLOB`: a JPEG-like envelope (`FF D8` ... `FF D9`)
//!
//! Reprocess requests copy the input into outputs of the same format and
//! size; other outputs get the pattern.

use crate::backend::sensor_trait::{CaptureOutcome, SensorBuffer, SensorCapture};
use crate::config::SensorConfig;
use crate::error::{EmuCamError, Result};
use crate::pipeline::id::FrameNumber;
use crate::types::{keys, BufferStatus, PixelFormat, Settings, TestPattern};
use std::collections::HashSet;
use std::time::{Duration, Instant};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Pattern colour of pixel (x, y) of a `width`x`height` frame
fn pattern_rgb(pattern: TestPattern, x: usize, y: usize, width: usize, height: usize, frame: u32) -> [u8; 3] {
    match pattern {
        TestPattern::Solid => [128, 128, 128],
        TestPattern::Gradient => {
            let r = x * 255 / width.saturating_sub(1).max(1);
            let g = y * 255 / height.saturating_sub(1).max(1);
            [r as u8, g as u8, (frame.wrapping_mul(8) % 256) as u8]
        }
        TestPattern::ColorBars => {
            const BARS: [[u8; 3]; 8] = [
                [235, 235, 235],
                [235, 235, 16],
                [16, 235, 235],
                [16, 235, 16],
                [235, 16, 235],
                [235, 16, 16],
                [16, 16, 235],
                [16, 16, 16],
            ];
            BARS[(x * 8 / width.max(1)).min(7)]
        }
        TestPattern::Checkerboard => {
            let shifted = x + (frame as usize % 32) * 4;
            if (shifted / 32 + y / 32) % 2 == 0 {
                [235, 235, 235]
            } else {
                [16, 16, 16]
            }
        }
    }
}

fn rgb_to_ycbcr([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = (77 * r + 150 * g + 29 * b) >> 8;
    let cb = ((-43 * r - 85 * g + 128 * b) >> 8) + 128;
    let cr = ((128 * r - 107 * g - 21 * b) >> 8) + 128;
    [y.clamp(0, 255) as u8, cb.clamp(0, 255) as u8, cr.clamp(0, 255) as u8]
}

/// Render `pattern` into one buffer in its pixel format
///
/// Returns false if the buffer cannot hold an image of its format.
fn render(buffer: &mut SensorBuffer, pattern: TestPattern, frame: u32) -> bool {
    let width = buffer.width() as usize;
    let height = buffer.height() as usize;
    let format = buffer.format();
    let planes = buffer.layout().planes.clone();
    let data = buffer.data_mut();
    let rgb = |x, y| pattern_rgb(pattern, x, y, width, height, frame);

    match format {
        PixelFormat::Ycbcr420 => {
            let [luma, cb, cr] = match planes.as_slice() {
                [a, b, c] => [*a, *b, *c],
                _ => return false,
            };
            for y in 0..height {
                let row = &mut data[luma.offset + y * luma.stride..][..width];
                for (x, px) in row.iter_mut().enumerate() {
                    *px = rgb_to_ycbcr(rgb(x, y))[0];
                }
            }
            for y in 0..cb.rows {
                for x in 0..width.div_ceil(2) {
                    let [_, u, v] = rgb_to_ycbcr(rgb(x * 2, y * 2));
                    data[cb.offset + y * cb.stride + x] = u;
                    data[cr.offset + y * cr.stride + x] = v;
                }
            }
        }
        PixelFormat::Y8 => {
            let stride = planes[0].stride;
            for y in 0..height {
                for x in 0..width {
                    data[y * stride + x] = rgb_to_ycbcr(rgb(x, y))[0];
                }
            }
        }
        PixelFormat::Raw16 => {
            let stride = planes[0].stride;
            for y in 0..height {
                for x in 0..width {
                    let [r, g, b] = rgb(x, y);
                    // RGGB
                    let sample = match (y % 2, x % 2) {
                        (0, 0) => r,
                        (1, 1) => b,
                        _ => g,
                    };
                    let value = (sample as u16) << 8;
                    let offset = y * stride + x * 2;
                    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
        PixelFormat::Rgba8888 => {
            let stride = planes[0].stride;
            for y in 0..height {
                for x in 0..width {
                    let [r, g, b] = rgb(x, y);
                    let offset = y * stride + x * 4;
                    data[offset..offset + 4].copy_from_slice(&[r, g, b, 255]);
                }
            }
        }
        PixelFormat::Blob => {
            let len = data.len();
            if len < JPEG_SOI.len() + JPEG_EOI.len() {
                return false;
            }
            data[..2].copy_from_slice(&JPEG_SOI);
            for (i, byte) in data[2..len - 2].iter_mut().enumerate() {
                *byte = (i as u32).wrapping_add(frame) as u8;
            }
            data[len - 2..].copy_from_slice(&JPEG_EOI);
        }
        PixelFormat::Private => return false,
    }
    true
}

/// Test-pattern sensor
pub struct SimulatedSensor {
    config: SensorConfig,
    fail_frames: HashSet<u32>,
    epoch: Instant,
    frames_captured: u64,
}

impl SimulatedSensor {
    pub fn new(config: SensorConfig) -> Self {
        let fail_frames = config.fail_frames.iter().copied().collect();
        Self {
            config,
            fail_frames,
            epoch: Instant::now(),
            frames_captured: 0,
        }
    }

    /// Make captures of `frame` fail
    pub fn fail_frame(&mut self, frame: FrameNumber) {
        self.fail_frames.insert(frame.0);
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    fn frame_duration(&self, settings: &Settings) -> Duration {
        settings
            .get_int(keys::FRAME_DURATION_US)
            .and_then(|us| u64::try_from(us).ok())
            .map(Duration::from_micros)
            .unwrap_or_else(|| self.config.default_frame_duration())
    }

    fn pattern(&self, settings: &Settings) -> TestPattern {
        settings
            .get_text(keys::TEST_PATTERN)
            .and_then(TestPattern::from_name)
            .unwrap_or(self.config.test_pattern)
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(SensorConfig::default())
    }
}

impl SensorCapture for SimulatedSensor {
    fn capture(
        &mut self,
        frame: FrameNumber,
        settings: &Settings,
        inputs: &mut [SensorBuffer],
        outputs: &mut [SensorBuffer],
    ) -> Result<CaptureOutcome> {
        let started = Instant::now();
        let timestamp = started.duration_since(self.epoch);

        if self.fail_frames.contains(&frame.0) {
            return Err(EmuCamError::sensor(frame, "simulated capture failure"));
        }

        let pattern = self.pattern(settings);
        let source = inputs.first();

        for output in outputs.iter_mut() {
            let reprocessed = source.is_some_and(|input| {
                input.format() == output.format() && input.data().len() == output.data().len()
            });

            let ok = match source {
                Some(input) if reprocessed => {
                    output.data_mut().copy_from_slice(input.data());
                    true
                }
                _ => render(output, pattern, frame.0),
            };

            if ok {
                output.complete(BufferStatus::Ok);
            } else {
                tracing::warn!(
                    "Cannot render {} into {} on frame {}",
                    output.format(),
                    output.stream_id(),
                    frame
                );
                output.complete(BufferStatus::Error);
            }
        }

        for input in inputs.iter_mut() {
            input.complete(BufferStatus::Ok);
        }

        self.frames_captured += 1;

        if self.config.simulate_exposure {
            let remaining = self.frame_duration(settings).saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }

        tracing::trace!(
            "Captured frame {} ({} outputs, {} inputs) with {:?}",
            frame,
            outputs.len(),
            inputs.len(),
            pattern
        );

        Ok(CaptureOutcome { timestamp })
    }
}
