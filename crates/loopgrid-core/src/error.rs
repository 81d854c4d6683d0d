//! Control-plane error taxonomy
//!
//! Errors raised synchronously by [`Session`](crate::session::Session) calls.
//! Background failures (load, pitch shift, separation) travel through the
//! completion queue and reach the observer instead; they wrap the same
//! per-area error types collected here.

use thiserror::Error;

use crate::audio::AudioError;
use crate::audio_file::FileLoadError;
use crate::separation::SeparationError;
use crate::types::SlotId;

/// Pitch shifting failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PitchError {
    /// The shifting backend is missing or failed. Callers fall back to dry audio.
    #[error("Pitch shift unavailable: {0}")]
    PitchShiftUnavailable(String),
}

pub type PitchResult<T> = Result<T, PitchError>;

/// Why a stem separation request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparationRefusal {
    NotLoaded,
    LoopActive,
    BpmUnset,
    AlreadyGenerating,
    StemsAvailable,
    NoSeparator,
}

impl std::fmt::Display for SeparationRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SeparationRefusal::NotLoaded => "no audio file is loaded",
            SeparationRefusal::LoopActive => "stop the loop before generating stems",
            SeparationRefusal::BpmUnset => "set or detect the BPM before generating stems",
            SeparationRefusal::AlreadyGenerating => "stems are already being generated",
            SeparationRefusal::StemsAvailable => "stems already exist, delete or regenerate them",
            SeparationRefusal::NoSeparator => "no stem separator is configured",
        };
        f.write_str(reason)
    }
}

/// Errors surfaced to the caller of a control operation
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    FileLoad(#[from] FileLoadError),

    #[error(transparent)]
    Pitch(#[from] PitchError),

    /// Bounds were rejected; the previous bounds are still in effect
    #[error("Invalid loop bounds {start:.3}s..{end:.3}s (file is {duration:.3}s)")]
    InvalidLoopBounds { start: f64, end: f64, duration: f64 },

    /// Separation was refused before anything was mutated
    #[error("Cannot separate stems for {slot}: {reason}")]
    SeparationPreconditionViolation { slot: SlotId, reason: SeparationRefusal },

    #[error(transparent)]
    Separation(#[from] SeparationError),

    /// The audio device could not be opened or started
    #[error("Audio device failed to boot: {0}")]
    DeviceBootFailure(#[from] AudioError),

    #[error("No slot with index {0}")]
    UnknownSlot(usize),

    #[error("Nothing is loaded in {0}")]
    NotLoaded(SlotId),

    #[error("Stems are not available for {0}")]
    StemsUnavailable(SlotId),

    /// Triggering is refused until separation finishes
    #[error("Stems are being generated for {0}")]
    StemsGenerating(SlotId),

    #[error("Intro start {start:.3}s must lie before the loop start {loop_start:.3}s")]
    InvalidIntroStart { start: f64, loop_start: f64 },

    #[error("Invalid BPM: {0}")]
    InvalidBpm(f64),

    #[error("No {0} is configured")]
    MissingCollaborator(&'static str),

    #[error("Unknown stem name: {0}")]
    UnknownStem(String),

    /// The render command queue is full; the audio thread is not draining it
    #[error("Audio command queue is full")]
    CommandQueueFull,

    #[error("Worker pool error: {0}")]
    Worker(String),
}

/// Result type for control operations
pub type EngineResult<T> = Result<T, EngineError>;
