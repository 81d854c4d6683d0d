//! CPAL output stream
//!
//! Opens one output stream on the chosen device. The callback locks the
//! shared [`CallbackState`] (uncontended: only the callback ever locks it
//! while a cpal stream exists), renders, and copies the stereo result into
//! the device's channel layout. One-channel devices get the mono sum.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use super::config::AudioConfig;
use super::device::CallbackState;
use super::error::{AudioError, AudioResult};

/// Negotiated output format
pub(super) struct OutputConfig {
    pub stream: StreamConfig,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A built cpal stream
pub(super) struct CpalStream {
    stream: Stream,
}

impl CpalStream {
    pub fn play(&self) -> AudioResult<()> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))
    }

    pub fn pause(&self) -> AudioResult<()> {
        self.stream
            .pause()
            .map_err(|e| AudioError::StreamPauseError(e.to_string()))
    }
}

/// Names of all output devices on the default host
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            log::debug!("Could not enumerate output devices: {}", e);
            Vec::new()
        }
    }
}

/// Find an output device by name, or the host default
pub(super) fn find_device(name: Option<&str>) -> AudioResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        None => host.default_output_device().ok_or(AudioError::NoDevices),
    }
}

/// Pick the best f32 output config for the requested rate
pub(super) fn output_config(device: &cpal::Device, config: &AudioConfig) -> AudioResult<OutputConfig> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();

    let target = config.target_sample_rate();
    let in_range = |c: &cpal::SupportedStreamConfigRange| {
        target >= c.min_sample_rate().0 && target <= c.max_sample_rate().0
    };

    let best = supported
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .find(|c| c.channels() >= 2 && in_range(c))
        .or_else(|| {
            supported
                .iter()
                .filter(|c| c.sample_format() == SampleFormat::F32)
                .find(|c| in_range(c))
        })
        .or_else(|| supported.iter().find(|c| c.sample_format() == SampleFormat::F32))
        .ok_or_else(|| AudioError::ConfigError("No f32 output configuration".to_string()))?;

    let sample_rate = if in_range(best) {
        target
    } else {
        let fallback = best.max_sample_rate().0;
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz (files will be resampled)",
            target,
            fallback
        );
        fallback
    };

    let mut stream: StreamConfig = best.clone().with_sample_rate(cpal::SampleRate(sample_rate)).into();
    stream.buffer_size = match config.buffer_size.as_frames() {
        Some(frames) => cpal::BufferSize::Fixed(frames),
        None => cpal::BufferSize::Default,
    };

    Ok(OutputConfig {
        channels: stream.channels,
        stream,
        sample_rate,
    })
}

pub(super) fn build_stream(
    device: &cpal::Device,
    output: &OutputConfig,
    state: Arc<Mutex<CallbackState>>,
) -> AudioResult<CpalStream> {
    let channels = output.channels as usize;

    let stream = device
        .build_output_stream(
            &output.stream,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut state) = state.lock() else {
                    data.fill(0.0);
                    return;
                };
                let n_frames = data.len() / channels;
                let samples = state.process(n_frames);

                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    let Some(sample) = samples.get(i) else {
                        frame.fill(0.0);
                        continue;
                    };
                    if channels == 1 {
                        frame[0] = sample.to_mono();
                        continue;
                    }
                    frame[0] = sample.left;
                    frame[1] = sample.right;
                    for ch in frame.iter_mut().skip(2) {
                        *ch = 0.0;
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    // Some hosts start streams on build; keep it silent until start()
    let _ = stream.pause();

    Ok(CpalStream { stream })
}
