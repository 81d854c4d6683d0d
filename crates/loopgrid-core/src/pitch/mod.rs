//! Key-lock pitch correction
//!
//! Playing a loop faster raises its pitch. Key-lock compensates by
//! transposing the source audio by [`speed_to_semitones`] ahead of time, so
//! that the realtime reader can keep resampling at `speed` while the
//! listener hears the original key.
//!
//! Shifting is offline and whole-buffer: it runs on the worker pool, never on
//! the audio thread, and its result is cached per owner in a [`PitchCache`].

mod cache;

pub use cache::PitchCache;

use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use signalsmith_stretch::Stretch;

use crate::dsp::speed_to_semitones;
use crate::error::{PitchError, PitchResult};
use crate::types::{AudioClip, Sample, StereoBuffer};

/// Frames handed to the shifter per call
const CHUNK_FRAMES: usize = 256;

/// A pitch shifting backend
///
/// Implementations must preserve length, sample rate and channel layout.
pub trait PitchShift: Send + Sync {
    /// Human-readable backend name for logs
    fn name(&self) -> &str;

    /// Return a copy of `clip` transposed by `semitones`
    fn shift(&self, clip: &AudioClip, semitones: f64) -> PitchResult<AudioClip>;
}

/// Transpose `clip` so that playing it back at `speed` sounds at the original pitch
pub fn shift_for_speed(shifter: &dyn PitchShift, clip: &AudioClip, speed: f64) -> PitchResult<AudioClip> {
    shifter.shift(clip, speed_to_semitones(speed))
}

/// Quality preset for [`SignalsmithShifter`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PitchQuality {
    #[default]
    Default,
    /// Roughly twice as fast, slightly grainier
    Cheaper,
}

/// Pitch shifter backed by signalsmith-stretch
///
/// A fresh stretcher is created per call, so one shifter can serve every
/// worker thread at once.
#[derive(Debug, Clone, Default)]
pub struct SignalsmithShifter {
    quality: PitchQuality,
}

impl SignalsmithShifter {
    pub fn new(quality: PitchQuality) -> Self {
        Self { quality }
    }

    fn stretcher(&self, channels: u32, sample_rate: u32) -> Stretch {
        match self.quality {
            PitchQuality::Default => Stretch::preset_default(channels, sample_rate),
            PitchQuality::Cheaper => Stretch::preset_cheaper(channels, sample_rate),
        }
    }

    /// Run `input` (interleaved, `channels` wide) through the stretcher at a
    /// 1:1 time ratio and return the latency-aligned output
    fn transpose(&self, input: &[Sample], channels: usize, sample_rate: u32, semitones: f32) -> Vec<Sample> {
        let mut stretch = self.stretcher(channels as u32, sample_rate);
        stretch.set_transpose_factor_semitones(semitones, None);
        let latency = stretch.input_latency() + stretch.output_latency();

        let frames = input.len() / channels;
        let total = frames + latency;
        let mut padded = Vec::with_capacity(total * channels);
        padded.extend_from_slice(input);
        padded.resize(total * channels, 0.0);
        let mut output = vec![0.0; total * channels];

        let mut pos = 0;
        while pos < total {
            let end = (pos + CHUNK_FRAMES).min(total);
            stretch.process(
                &padded[pos * channels..end * channels],
                &mut output[pos * channels..end * channels],
            );
            pos = end;
        }

        output.drain(..latency * channels);
        output.truncate(frames * channels);
        output
    }
}

impl PitchShift for SignalsmithShifter {
    fn name(&self) -> &str {
        "signalsmith-stretch"
    }

    fn shift(&self, clip: &AudioClip, semitones: f64) -> PitchResult<AudioClip> {
        if clip.is_empty() || semitones == 0.0 {
            return Ok(AudioClip::new(clip.frames().clone(), clip.sample_rate(), clip.channels()));
        }
        let semitones = semitones.clamp(-24.0, 24.0) as f32;
        let sample_rate = clip.sample_rate();

        // The stretcher is C++ underneath; a panic here must not take the worker down
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if clip.is_mono() {
                let (mono, _) = clip.frames().to_channels();
                StereoBuffer::from_mono(&self.transpose(&mono, 1, sample_rate, semitones))
            } else {
                let out = self.transpose(clip.frames().as_interleaved(), 2, sample_rate, semitones);
                let mut frames = StereoBuffer::silence(out.len() / 2);
                frames.as_interleaved_mut().copy_from_slice(&out);
                frames
            }
        }));

        let frames = result.map_err(|_| PitchError::PitchShiftUnavailable("stretcher panicked".to_string()))?;
        if frames.iter().any(|s| !s.left.is_finite() || !s.right.is_finite()) {
            return Err(PitchError::PitchShiftUnavailable("stretcher produced non-finite samples".to_string()));
        }
        Ok(AudioClip::new(frames, sample_rate, clip.channels()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic shifters for engine tests

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::types::StereoSample;

    /// Scales every sample by `1 / (1 + |semitones|)` so results for
    /// different speeds are distinguishable. Counts calls.
    #[derive(Default)]
    pub struct ScalingShifter {
        pub calls: Arc<AtomicUsize>,
        pub delay: Option<Duration>,
    }

    impl ScalingShifter {
        pub fn factor(semitones: f64) -> f32 {
            (1.0 / (1.0 + semitones.abs())) as f32
        }

        pub fn expected(clip: &AudioClip, speed: f64) -> StereoBuffer {
            let f = Self::factor(speed_to_semitones(speed));
            StereoBuffer::from_vec(clip.frames().iter().map(|&s| s * f).collect::<Vec<StereoSample>>())
        }
    }

    impl PitchShift for ScalingShifter {
        fn name(&self) -> &str {
            "scaling"
        }

        fn shift(&self, clip: &AudioClip, semitones: f64) -> PitchResult<AudioClip> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let f = Self::factor(semitones);
            let frames = clip.frames().iter().map(|&s| s * f).collect();
            Ok(AudioClip::new(StereoBuffer::from_vec(frames), clip.sample_rate(), clip.channels()))
        }
    }

    /// Always unavailable
    pub struct BrokenShifter;

    impl PitchShift for BrokenShifter {
        fn name(&self) -> &str {
            "broken"
        }

        fn shift(&self, _clip: &AudioClip, _semitones: f64) -> PitchResult<AudioClip> {
            Err(PitchError::PitchShiftUnavailable("backend missing".to_string()))
        }
    }
}
