//! Interfaces to the external analysis collaborators
//!
//! Beat tracking and source separation are not implemented here. The session
//! runs whatever [`BpmDetector`] and [`StemSeparator`] it is given on the
//! worker pool and consumes their outputs.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{AudioClip, StemKind, NUM_STEMS};

/// Stem separation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeparationError {
    #[error("Stem separation failed: {0}")]
    Failed(String),

    #[error("Separated {stem} stem is at {got} Hz, expected {expected} Hz")]
    SampleRateMismatch { stem: StemKind, got: u32, expected: u32 },

    #[error("Separation task panicked: {0}")]
    Panicked(String),
}

pub type SeparationResult<T> = Result<T, SeparationError>;

/// Output of a separator. `instrumental` may be omitted; it is then derived
/// as drums + bass + melody.
#[derive(Debug, Clone)]
pub struct SeparatedStems {
    pub vocals: AudioClip,
    pub melody: AudioClip,
    pub bass: AudioClip,
    pub drums: AudioClip,
    pub instrumental: Option<AudioClip>,
}

impl SeparatedStems {
    /// All five stems in [`StemKind::ALL`] order
    ///
    /// Every stem must share `sample_rate` with the audio it was separated from.
    pub fn complete(self, sample_rate: u32) -> SeparationResult<[Arc<AudioClip>; NUM_STEMS]> {
        let instrumental = match self.instrumental {
            Some(clip) => clip,
            None => AudioClip::mix(&[&self.drums, &self.bass, &self.melody])
                .ok_or_else(|| SeparationError::Failed("no stems to mix".to_string()))?,
        };

        let stems = [self.vocals, self.melody, self.bass, self.drums, instrumental];
        for (kind, clip) in StemKind::ALL.iter().zip(stems.iter()) {
            if clip.sample_rate() != sample_rate {
                return Err(SeparationError::SampleRateMismatch {
                    stem: *kind,
                    got: clip.sample_rate(),
                    expected: sample_rate,
                });
            }
        }
        Ok(stems.map(Arc::new))
    }
}

/// Source separation model
pub trait StemSeparator: Send + Sync {
    fn name(&self) -> &str;

    /// Split `clip` into stems. Blocking; always called on a worker thread.
    fn separate(&self, clip: &AudioClip) -> SeparationResult<SeparatedStems>;
}

/// Beat tracker
pub trait BpmDetector: Send + Sync {
    /// Tempo of the file, or `None` if detection failed
    fn detect(&self, path: &Path) -> Option<f64>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::types::{StereoBuffer, StereoSample};

    /// Splits a clip into scaled copies of itself. With `four_stems` the
    /// instrumental is left for the caller to derive.
    #[derive(Default)]
    pub struct FakeSeparator {
        pub calls: Arc<AtomicUsize>,
        pub four_stems: bool,
        pub fail: bool,
        pub delay: Option<Duration>,
    }

    /// Gain applied to the source for each stem, in [`StemKind::ALL`] order
    pub const STEM_GAINS: [f32; NUM_STEMS] = [0.1, 0.2, 0.3, 0.4, 0.9];

    fn scaled(clip: &AudioClip, gain: f32) -> AudioClip {
        let frames: Vec<StereoSample> = clip.frames().iter().map(|&s| s * gain).collect();
        AudioClip::new(StereoBuffer::from_vec(frames), clip.sample_rate(), clip.channels())
    }

    impl StemSeparator for FakeSeparator {
        fn name(&self) -> &str {
            "fake"
        }

        fn separate(&self, clip: &AudioClip) -> SeparationResult<SeparatedStems> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                return Err(SeparationError::Failed("model not found".to_string()));
            }
            Ok(SeparatedStems {
                vocals: scaled(clip, STEM_GAINS[0]),
                melody: scaled(clip, STEM_GAINS[1]),
                bass: scaled(clip, STEM_GAINS[2]),
                drums: scaled(clip, STEM_GAINS[3]),
                instrumental: (!self.four_stems).then(|| scaled(clip, STEM_GAINS[4])),
            })
        }
    }

    /// Reports a fixed tempo
    pub struct FixedBpm(pub Option<f64>);

    impl BpmDetector for FixedBpm {
        fn detect(&self, _path: &Path) -> Option<f64> {
            self.0
        }
    }
}
