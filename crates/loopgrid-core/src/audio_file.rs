//! Audio file loading
//!
//! Decodes any format symphonia understands into an [`AudioClip`] at the
//! output device's sample rate. Resampling happens once here, at load time,
//! so that every reader in the render graph can treat "rate" and "speed" as
//! the same number.
//!
//! Loading is blocking and must never run on the audio thread. The session
//! offers it both synchronously and through the worker pool.

use std::fs::File;
use std::path::{Path, PathBuf};

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::types::{AudioClip, Sample, StereoBuffer};

/// Errors that can occur while loading an audio file
#[derive(Error, Debug)]
pub enum FileLoadError {
    #[error("Audio file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read audio file: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported or corrupt audio file {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("Audio file contains no samples: {0}")]
    Empty(PathBuf),

    #[error("Resampling failed: {0}")]
    Resample(String),
}

pub type FileLoadResult<T> = Result<T, FileLoadError>;

/// Raw decoder output before channel mapping
struct Decoded {
    interleaved: Vec<Sample>,
    sample_rate: u32,
    channels: u16,
}

/// Load `path` and convert it to stereo frames at `target_rate`
pub fn load_clip(path: &Path, target_rate: u32) -> FileLoadResult<AudioClip> {
    if !path.exists() {
        return Err(FileLoadError::NotFound(path.to_path_buf()));
    }

    let decoded = decode(path)?;
    let channels = decoded.channels.max(1) as usize;
    if decoded.interleaved.len() < channels {
        return Err(FileLoadError::Empty(path.to_path_buf()));
    }

    // Keep at most two channels; mono is carried in both
    let mut left = Vec::with_capacity(decoded.interleaved.len() / channels);
    let mut right = Vec::with_capacity(decoded.interleaved.len() / channels);
    for frame in decoded.interleaved.chunks_exact(channels) {
        left.push(frame[0]);
        right.push(if channels > 1 { frame[1] } else { frame[0] });
    }

    let (left, right) = if decoded.sample_rate != target_rate {
        log::debug!(
            "Resampling {} from {} Hz to {} Hz",
            path.display(),
            decoded.sample_rate,
            target_rate
        );
        resample(left, right, decoded.sample_rate, target_rate)?
    } else {
        (left, right)
    };

    let frames = StereoBuffer::from_channels(&left, &right);
    if frames.is_empty() {
        return Err(FileLoadError::Empty(path.to_path_buf()));
    }

    let clip = AudioClip::new(frames, target_rate, decoded.channels.min(2));
    log::info!(
        "Loaded {} ({:.2}s, {} ch, {} Hz)",
        path.display(),
        clip.duration_secs(),
        clip.channels(),
        target_rate
    );
    Ok(clip)
}

fn decode(path: &Path) -> FileLoadResult<Decoded> {
    let unsupported = |reason: String| FileLoadError::Unsupported {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|source| FileLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unsupported("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| unsupported("unknown sample rate".to_string()))?;
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;

    let mut interleaved: Vec<Sample> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<Sample>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                log::warn!("Error reading packet from {}: {}", path.display(), e);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("Skipping corrupt packet in {}: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(unsupported(e.to_string())),
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels.get_or_insert(spec.channels.count() as u16);
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(buf.samples());
        }
    }

    Ok(Decoded {
        interleaved,
        sample_rate,
        channels: channels.unwrap_or(2),
    })
}

/// Whole-buffer sinc resampling, compensated for the resampler's delay so the
/// output lines up sample-for-sample with the input timeline
fn resample(
    left: Vec<Sample>,
    right: Vec<Sample>,
    source_rate: u32,
    target_rate: u32,
) -> FileLoadResult<(Vec<Sample>, Vec<Sample>)> {
    let ratio = target_rate as f64 / source_rate as f64;
    let expected = (left.len() as f64 * ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<Sample>::new(ratio, 2.0, params, left.len(), 2)
        .map_err(|e| FileLoadError::Resample(e.to_string()))?;

    let waves_in = vec![left, right];
    let mut waves_out = resampler
        .process(&waves_in, None)
        .map_err(|e| FileLoadError::Resample(e.to_string()))?;
    let tail = resampler
        .process_partial(None::<&[Vec<Sample>]>, None)
        .map_err(|e| FileLoadError::Resample(e.to_string()))?;
    for (out, rest) in waves_out.iter_mut().zip(tail) {
        out.extend(rest);
    }

    let delay = resampler.output_delay();
    let mut channels = waves_out.into_iter().map(|mut ch| {
        let start = delay.min(ch.len());
        ch.drain(..start);
        ch.resize(expected, 0.0);
        ch
    });
    let left = channels.next().unwrap_or_default();
    let right = channels.next().unwrap_or_default();
    Ok((left, right))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a sine to a 16-bit WAV file
    pub(crate) fn write_sine_wav(path: &Path, secs: f64, sample_rate: u32, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (secs * sample_rate as f64).round() as usize;
        for i in 0..frames {
            let v = (std::f64::consts::TAU * 220.0 * i as f64 / sample_rate as f64).sin() * 0.5;
            for _ in 0..channels {
                writer.write_sample((v * i16::MAX as f64) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_mono_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 1.0, 44100, 1);

        let clip = load_clip(&path, 44100).unwrap();
        assert_eq!(clip.len(), 44100);
        assert_eq!(clip.channels(), 1);
        assert_eq!(clip.sample_rate(), 44100);
        let f = clip.frames()[100];
        assert_eq!(f.left, f.right);
    }

    #[test]
    fn test_load_resamples_to_target_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine_wav(&path, 1.0, 44100, 2);

        let clip = load_clip(&path, 48000).unwrap();
        assert_eq!(clip.sample_rate(), 48000);
        assert_eq!(clip.len(), 48000);
        assert!((clip.duration_secs() - 1.0).abs() < 1e-6);
        assert!(clip.frames().peak() > 0.3);
    }

    #[test]
    fn test_missing_file() {
        let err = load_clip(Path::new("/definitely/not/here.wav"), 48000).unwrap_err();
        assert!(matches!(err, FileLoadError::NotFound(_)));
    }

    #[test]
    fn test_garbage_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"this is not audio").unwrap();
        assert!(load_clip(&path, 48000).is_err());
    }

    #[test]
    fn test_zero_length_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_sine_wav(&path, 0.0, 44100, 1);
        assert!(load_clip(&path, 44100).is_err());
    }
}
