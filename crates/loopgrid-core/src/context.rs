//! Shared services handed to per-slot components

use std::sync::Arc;

use basedrop::Handle;

use crate::audio::AudioDevice;
use crate::pitch::PitchShift;
use crate::worker::WorkerPool;

/// What a player or stem engine needs from the session for one call
///
/// Built fresh by the session for each operation, so components never hold
/// on to the device or the pool themselves.
pub struct SlotContext<'a> {
    pub device: &'a mut AudioDevice,
    /// Collector handle for tables shared with the audio thread
    pub gc: &'a Handle,
    pub pool: &'a WorkerPool,
    pub shifter: &'a Arc<dyn PitchShift>,
}
