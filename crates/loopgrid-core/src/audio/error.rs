//! Audio device error types

use thiserror::Error;

/// Errors that can occur while opening or driving the output device
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio output devices found")]
    NoDevices,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to pause audio stream: {0}")]
    StreamPauseError(String),

    #[error("Audio device has been shut down")]
    ShutDown,
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
