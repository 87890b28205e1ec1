//! Settings resolution for the request worker
//!
//! Each request either carries a settings snapshot or repeats the previous
//! one. [`RequestState`] merges the requested snapshot over the last
//! resolved one, fills in and clamps the frame duration, and remembers the
//! result for the next request.

use crate::error::{EmuCamError, Result};
use crate::types::{keys, Settings};
use std::time::Duration;

/// Last-known settings of one processor
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    last: Option<Settings>,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_settings(&self) -> bool {
        self.last.is_some()
    }

    pub fn last(&self) -> Option<&Settings> {
        self.last.as_ref()
    }

    /// Resolve the settings for one request
    ///
    /// `min_frame_duration` is the longest minimum frame duration of the
    /// request's output streams; `default_frame_duration` applies when no
    /// snapshot ever set one. Fails with `InvalidArgument` when there is
    /// nothing to resolve from or a timing value is negative. A failed
    /// resolution leaves the last-known snapshot untouched.
    pub fn resolve(
        &mut self,
        requested: Option<&Settings>,
        min_frame_duration: Duration,
        default_frame_duration: Duration,
    ) -> Result<Settings> {
        let mut resolved = match (requested, &self.last) {
            (None, None) => {
                return Err(EmuCamError::InvalidArgument(
                    "request has no settings and none were set before".to_string(),
                ))
            }
            (None, Some(last)) => last.clone(),
            (Some(requested), None) => requested.clone(),
            (Some(requested), Some(last)) => {
                let mut merged = last.clone();
                merged.merge(requested);
                merged
            }
        };

        let frame_duration = match resolved.get_int(keys::FRAME_DURATION_US) {
            Some(us) if us < 0 => {
                return Err(EmuCamError::InvalidArgument(format!(
                    "negative frame duration {}us",
                    us
                )))
            }
            Some(us) => Duration::from_micros(us as u64),
            None => default_frame_duration,
        };
        let frame_duration = frame_duration.max(min_frame_duration);
        let frame_duration_us = frame_duration.as_micros().min(i64::MAX as u128) as i64;
        resolved.set(keys::FRAME_DURATION_US, frame_duration_us);

        if let Some(exposure) = resolved.get_int(keys::EXPOSURE_TIME_US) {
            if exposure < 0 {
                return Err(EmuCamError::InvalidArgument(format!(
                    "negative exposure time {}us",
                    exposure
                )));
            }
            if exposure > frame_duration_us {
                tracing::debug!(
                    "Clamping exposure {}us to frame duration {}us",
                    exposure,
                    frame_duration_us
                );
                resolved.set(keys::EXPOSURE_TIME_US, frame_duration_us);
            }
        }

        self.last = Some(resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_micros(10_000);
    const DEFAULT: Duration = Duration::from_micros(33_333);

    #[test]
    fn test_first_request_needs_settings() {
        let mut state = RequestState::new();
        assert!(matches!(
            state.resolve(None, MIN, DEFAULT),
            Err(EmuCamError::InvalidArgument(_))
        ));
        assert!(!state.has_settings());
    }

    #[test]
    fn test_repeats_last_settings() {
        let mut state = RequestState::new();
        let first = Settings::new().with(keys::SENSITIVITY, 400i64);
        state.resolve(Some(&first), MIN, DEFAULT).unwrap();

        let repeated = state.resolve(None, MIN, DEFAULT).unwrap();
        assert_eq!(repeated.get_int(keys::SENSITIVITY), Some(400));
        assert_eq!(repeated.get_int(keys::FRAME_DURATION_US), Some(33_333));
    }

    #[test]
    fn test_merges_over_last() {
        let mut state = RequestState::new();
        state
            .resolve(
                Some(&Settings::new().with(keys::SENSITIVITY, 100i64).with(keys::EXPOSURE_TIME_US, 5_000i64)),
                MIN,
                DEFAULT,
            )
            .unwrap();

        let resolved = state
            .resolve(Some(&Settings::new().with(keys::SENSITIVITY, 800i64)), MIN, DEFAULT)
            .unwrap();
        assert_eq!(resolved.get_int(keys::SENSITIVITY), Some(800));
        assert_eq!(resolved.get_int(keys::EXPOSURE_TIME_US), Some(5_000));
        assert_eq!(state.last(), Some(&resolved));
    }

    #[test]
    fn test_clamps_frame_duration_and_exposure() {
        let mut state = RequestState::new();
        let settings = Settings::new()
            .with(keys::FRAME_DURATION_US, 1_000i64)
            .with(keys::EXPOSURE_TIME_US, 50_000i64);

        let resolved = state.resolve(Some(&settings), MIN, DEFAULT).unwrap();
        assert_eq!(resolved.get_int(keys::FRAME_DURATION_US), Some(10_000));
        assert_eq!(resolved.get_int(keys::EXPOSURE_TIME_US), Some(10_000));
    }

    #[test]
    fn test_rejects_negative_values_without_side_effects() {
        let mut state = RequestState::new();
        let good = Settings::new().with(keys::SENSITIVITY, 100i64);
        state.resolve(Some(&good), MIN, DEFAULT).unwrap();
        let before = state.last().cloned();

        let bad = Settings::new().with(keys::FRAME_DURATION_US, -5i64);
        assert!(state.resolve(Some(&bad), MIN, DEFAULT).is_err());
        assert_eq!(state.last().cloned(), before);
    }
}
