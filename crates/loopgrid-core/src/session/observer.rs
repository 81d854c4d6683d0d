//! Notifications for whoever drives the session (usually a UI)

use std::path::Path;

use crate::audio_file::FileLoadError;
use crate::error::PitchError;
use crate::separation::SeparationError;
use crate::types::SlotId;

/// Receives the outcome of background work, on the thread that calls
/// [`Session::poll`](super::Session::poll)
///
/// Every method has a no-op default so implementors pick what they need.
pub trait SessionObserver {
    fn on_load_complete(&mut self, _slot: SlotId, _result: Result<&Path, &FileLoadError>) {}

    /// `None` means detection failed
    fn on_bpm_detected(&mut self, _slot: SlotId, _bpm: Option<f64>) {}

    fn on_stems_ready(&mut self, _slot: SlotId, _result: Result<(), &SeparationError>) {}

    /// Key-lock audio for `speed` is in place, or could not be made and
    /// uncorrected audio keeps playing
    fn on_pitch_ready(&mut self, _slot: SlotId, _speed: f64, _result: Result<(), &PitchError>) {}
}

/// Ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}
