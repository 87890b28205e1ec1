//! Identity types for pipelines, streams and frames.
//!
//! All IDs are plain newtypes so a stream id can never be passed where a
//! pipeline id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one registered pipeline (a capture configuration).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PipelineId(pub u32);

impl fmt::Debug for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineId({})", self.0)
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline {}", self.0)
    }
}

/// Identifies a stream within a pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StreamId(pub i32);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

/// Caller-assigned frame number correlating a request with its notifications.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FrameNumber(pub u32);

impl FrameNumber {
    /// The frame number following this one, wrapping at `u32::MAX`
    #[inline]
    pub fn next(self) -> FrameNumber {
        FrameNumber(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_number_next_wraps() {
        assert_eq!(FrameNumber(7).next(), FrameNumber(8));
        assert_eq!(FrameNumber(u32::MAX).next(), FrameNumber(0));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(PipelineId(2).to_string(), "pipeline 2");
        assert_eq!(StreamId(-1).to_string(), "stream -1");
        assert_eq!(format!("{:?}", FrameNumber(9)), "FrameNumber(9)");
    }
}
