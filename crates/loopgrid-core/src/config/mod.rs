//! Engine configuration
//!
//! One YAML file (see [`default_config_path`]) sizes the engine: output
//! device, worker threads, slot count and the realtime ramp/queue settings.
//!
//! ```yaml
//! audio:
//!   device: null
//!   sample_rate: 48000
//!   buffer_size: default
//! worker_threads: 4
//! max_slots: 16
//! multi_loop: false
//! stem_ramp_ms: 15.0
//! pitch_quality: default
//! master_gain_db: 0.0
//! command_queue_capacity: 1024
//! ```

mod io;

pub use io::{default_config_path, load_config, save_config};

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::dsp::DEFAULT_RAMP_MS;
use crate::engine::COMMAND_QUEUE_CAPACITY;
use crate::pitch::PitchQuality;

/// Grid size when none is configured
pub const DEFAULT_MAX_SLOTS: usize = 16;

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    /// Background threads for decoding, pitch shifting and separation
    pub worker_threads: usize,
    pub max_slots: usize,
    /// Allow several slots to play at once; otherwise a trigger stops the others
    pub multi_loop: bool,
    /// Gain ramp length for stem toggles and mutes
    pub stem_ramp_ms: f32,
    pub pitch_quality: PitchQuality,
    pub master_gain_db: f64,
    pub command_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            worker_threads: default_worker_threads(),
            max_slots: DEFAULT_MAX_SLOTS,
            multi_loop: false,
            stem_ramp_ms: DEFAULT_RAMP_MS,
            pitch_quality: PitchQuality::default(),
            master_gain_db: 0.0,
            command_queue_capacity: COMMAND_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Copy with out-of-range values pulled back into range
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();
        config.worker_threads = config.worker_threads.clamp(1, 32);
        config.max_slots = config.max_slots.clamp(1, 256);
        if !config.stem_ramp_ms.is_finite() || config.stem_ramp_ms < 0.0 {
            config.stem_ramp_ms = DEFAULT_RAMP_MS;
        }
        if !config.master_gain_db.is_finite() {
            config.master_gain_db = 0.0;
        }
        config.command_queue_capacity = config.command_queue_capacity.max(64);
        config
    }
}

/// Half the available cores, at least two
fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(2))
        .unwrap_or(2)
}
