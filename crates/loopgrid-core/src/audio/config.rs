//! Output device configuration

use serde::{Deserialize, Serialize};

/// Largest callback buffer the renderer preallocates for (frames)
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Buffer size used when none is requested (frames)
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

pub use crate::types::DEFAULT_SAMPLE_RATE;

/// Preferred callback buffer size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferSize {
    /// Let the host choose
    #[default]
    Default,
    /// Request a specific size in frames (clamped to 64..=MAX_BUFFER_SIZE)
    Fixed(u32),
}

impl BufferSize {
    /// Requested size in frames, or `None` for the host default
    pub fn as_frames(&self) -> Option<u32> {
        match self {
            BufferSize::Default => None,
            BufferSize::Fixed(frames) => Some((*frames).clamp(64, MAX_BUFFER_SIZE as u32)),
        }
    }

    /// Latency of one buffer in milliseconds
    pub fn latency_ms(&self, sample_rate: u32) -> f32 {
        let frames = self.as_frames().unwrap_or(DEFAULT_BUFFER_SIZE);
        frames as f32 / sample_rate.max(1) as f32 * 1000.0
    }
}

/// Output device settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Device name; `None` picks the host default
    pub device: Option<String>,
    /// Preferred sample rate; `None` uses [`DEFAULT_SAMPLE_RATE`]
    pub sample_rate: Option<u32>,
    pub buffer_size: BufferSize,
}

impl AudioConfig {
    pub fn target_sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_clamped() {
        assert_eq!(BufferSize::Fixed(16).as_frames(), Some(64));
        assert_eq!(BufferSize::Fixed(100_000).as_frames(), Some(MAX_BUFFER_SIZE as u32));
        assert_eq!(BufferSize::Default.as_frames(), None);
    }

    #[test]
    fn test_latency() {
        let latency = BufferSize::Fixed(480).latency_ms(48000);
        assert!((latency - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_default_rate() {
        assert_eq!(AudioConfig::default().target_sample_rate(), DEFAULT_SAMPLE_RATE);
    }
}
