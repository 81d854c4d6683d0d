//! Lock-free per-slot state published by the audio thread
//!
//! The renderer writes these once per buffer; the control thread reads them
//! without locking (level meters, hot-init phase, playback position).
//! Relaxed ordering is enough: each value is independent and only needs to be
//! eventually visible.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::dsp::LEVEL_FLOOR_DB;
use crate::types::StereoSample;

/// Atomic state for one slot
#[derive(Debug)]
pub struct SlotAtomics {
    /// Dry reader is running
    pub playing: AtomicBool,
    /// Stem readers are running
    pub stems_live: AtomicBool,
    /// Dry reader position in frames (f64 bits)
    position: AtomicU64,
    /// Frame in the dry table where the loop proper starts
    pub loop_offset: AtomicU64,
    /// Dry table length in frames
    pub table_len: AtomicU64,
    /// Completed passes of the dry reader
    pub loops_completed: AtomicU64,
    /// `start_id` of the dry reader the position belongs to
    pub loop_start_id: AtomicU64,
    /// Master clock phase of the stem readers (f64 bits)
    phase: AtomicU64,
    /// Meter level in dBFS (f32 bits)
    level_db: AtomicU32,
}

impl SlotAtomics {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            stems_live: AtomicBool::new(false),
            position: AtomicU64::new(0f64.to_bits()),
            loop_offset: AtomicU64::new(0),
            table_len: AtomicU64::new(0),
            loops_completed: AtomicU64::new(0),
            loop_start_id: AtomicU64::new(0),
            phase: AtomicU64::new(0f64.to_bits()),
            level_db: AtomicU32::new(LEVEL_FLOOR_DB.to_bits()),
        }
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stems_live(&self) -> bool {
        self.stems_live.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn position(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_position(&self, frames: f64) {
        self.position.store(frames.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn phase(&self) -> f64 {
        f64::from_bits(self.phase.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_phase(&self, phase: f64) {
        self.phase.store(phase.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn level_db(&self) -> f32 {
        f32::from_bits(self.level_db.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_level_db(&self, db: f32) {
        self.level_db.store(db.to_bits(), Ordering::Relaxed);
    }

    /// Exact loop phase of the dry reader started as `start_id`
    ///
    /// `None` while stopped, still playing the intro, or when the published
    /// position belongs to an earlier start that the renderer has not yet
    /// replaced. Stems can only lock to the loop proper.
    pub fn dry_loop_phase(&self, start_id: u64) -> Option<f64> {
        if !self.is_playing() || self.loop_start_id.load(Ordering::Relaxed) != start_id {
            return None;
        }
        let offset = self.loop_offset.load(Ordering::Relaxed) as f64;
        let len = self.table_len.load(Ordering::Relaxed) as f64;
        let pos = self.position();
        let loop_len = len - offset;
        if loop_len <= 0.0 || pos < offset {
            return None;
        }
        Some(((pos - offset) / loop_len).clamp(0.0, 1.0 - f64::EPSILON))
    }

    /// Reset to the stopped state
    pub fn clear(&self) {
        self.playing.store(false, Ordering::Relaxed);
        self.stems_live.store(false, Ordering::Relaxed);
        self.set_position(0.0);
        self.loops_completed.store(0, Ordering::Relaxed);
        self.set_level_db(LEVEL_FLOOR_DB);
    }
}

impl Default for SlotAtomics {
    fn default() -> Self {
        Self::new()
    }
}

/// Peak follower with instant attack and exponential release
#[derive(Debug, Clone)]
pub struct LevelMeter {
    envelope: f32,
    release: f32,
}

/// Time for the meter to fall by ~63%
const METER_RELEASE_MS: f32 = 300.0;

impl LevelMeter {
    pub fn new(sample_rate: u32) -> Self {
        let samples = METER_RELEASE_MS / 1000.0 * sample_rate.max(1) as f32;
        Self {
            envelope: 0.0,
            release: (-1.0 / samples).exp(),
        }
    }

    #[inline]
    pub fn feed(&mut self, sample: StereoSample) {
        let peak = sample.peak();
        self.envelope = if peak > self.envelope {
            peak
        } else {
            self.envelope * self.release
        };
    }

    /// Current level in dBFS, floored at [`LEVEL_FLOOR_DB`]
    pub fn level_db(&self) -> f32 {
        if self.envelope <= 0.0 {
            return LEVEL_FLOOR_DB;
        }
        (20.0 * self.envelope.log10()).max(LEVEL_FLOOR_DB)
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}
