//! Stems of one slot
//!
//! [`StemSet`] holds the separated audio and the user's stem selection.
//! It is plain data; [`StemEngine`] turns it into sound.
//!
//! Selection rules:
//!
//! - `instrumental` excludes the other four: turning it on clears them,
//!   turning any of them on clears it.
//! - "Stop all" snapshots the selection, silences every stem (the full mix
//!   plays), and restores the snapshot when toggled again.
//! - A momentary activation applies like a toggle-on and is undone on release.

mod engine;

pub use engine::StemEngine;

use std::sync::Arc;

use crate::engine::{stem_reader, MAIN_READER, NUM_READERS};
use crate::slot::LoopWindow;
use crate::types::{AudioClip, StemKind, NUM_STEMS};

/// On/off per stem, indexed by [`StemKind::index`]
pub type StemStates = [bool; NUM_STEMS];

/// Separated audio, pitch cache and selection state for one slot
#[derive(Debug, Default)]
pub struct StemSet {
    available: bool,
    generating: bool,
    /// Bumped whenever `dry` changes so derived tables can tell they are stale
    generation: u64,
    dry: [Option<Arc<AudioClip>>; NUM_STEMS],
    /// Loop-window slices of `dry`, pitch shifted for `cached_speed`
    pitched: [Option<Arc<AudioClip>>; NUM_STEMS],
    cached_speed: Option<f64>,
    cached_window: Option<LoopWindow>,
    states: StemStates,
    saved_states: StemStates,
    stop_active: bool,
    momentary: Option<StemStates>,
    /// Stems currently held down
    held: StemStates,
    initialized: bool,
}

impl StemSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.available
    }

    #[inline]
    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn set_generating(&mut self, generating: bool) {
        self.generating = generating;
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Install separated stems in [`StemKind::ALL`] order
    pub fn populate(&mut self, stems: [Arc<AudioClip>; NUM_STEMS]) {
        self.dry = stems.map(Some);
        self.invalidate_pitched();
        self.available = true;
        self.generating = false;
        self.generation += 1;
        self.reset_selection();
    }

    /// Release all audio and selection state
    pub fn clear(&mut self) {
        self.dry = Default::default();
        self.invalidate_pitched();
        self.available = false;
        self.generating = false;
        self.initialized = false;
        self.generation += 1;
        self.reset_selection();
    }

    fn reset_selection(&mut self) {
        self.states = [false; NUM_STEMS];
        self.saved_states = [false; NUM_STEMS];
        self.stop_active = false;
        self.momentary = None;
        self.held = [false; NUM_STEMS];
    }

    pub fn dry(&self, kind: StemKind) -> Option<&Arc<AudioClip>> {
        self.dry[kind.index()].as_ref()
    }

    /// All five dry stems, if separated
    pub fn dry_all(&self) -> Option<[Arc<AudioClip>; NUM_STEMS]> {
        if !self.available {
            return None;
        }
        all_present(&self.dry)
    }

    // ─────────────────────────────────────────────────────────────
    // Pitch cache
    // ─────────────────────────────────────────────────────────────

    /// Pitched stems, only if they were made for exactly this speed and window
    pub fn pitched_for(&self, speed: f64, window: LoopWindow) -> Option<[Arc<AudioClip>; NUM_STEMS]> {
        if self.cached_speed != Some(speed) || self.cached_window != Some(window) {
            return None;
        }
        all_present(&self.pitched)
    }

    pub fn store_pitched(&mut self, speed: f64, window: LoopWindow, clips: [Arc<AudioClip>; NUM_STEMS]) {
        self.pitched = clips.map(Some);
        self.cached_speed = Some(speed);
        self.cached_window = Some(window);
    }

    pub fn invalidate_pitched(&mut self) {
        self.pitched = Default::default();
        self.cached_speed = None;
        self.cached_window = None;
    }

    /// Speed the pitched stems were made for
    pub fn cached_speed(&self) -> Option<f64> {
        self.cached_speed
    }

    // ─────────────────────────────────────────────────────────────
    // Selection
    // ─────────────────────────────────────────────────────────────

    pub fn states(&self) -> StemStates {
        self.states
    }

    pub fn is_on(&self, kind: StemKind) -> bool {
        self.states[kind.index()]
    }

    pub fn any_on(&self) -> bool {
        self.states.iter().any(|&on| on)
    }

    pub fn is_stop_active(&self) -> bool {
        self.stop_active
    }

    /// Flip one stem, honouring instrumental exclusivity. Returns the new state.
    pub fn toggle(&mut self, kind: StemKind) -> bool {
        self.leave_stop_all();
        let on = !self.states[kind.index()];
        if on {
            self.switch_on(kind);
        } else {
            self.states[kind.index()] = false;
        }
        on
    }

    fn switch_on(&mut self, kind: StemKind) {
        if kind.is_instrumental() {
            for part in StemKind::PARTS {
                self.states[part.index()] = false;
            }
        } else {
            self.states[StemKind::Instrumental.index()] = false;
        }
        self.states[kind.index()] = true;
    }

    /// A manual selection while "stop all" is engaged ends it
    fn leave_stop_all(&mut self) {
        if self.stop_active {
            self.stop_active = false;
            self.saved_states = [false; NUM_STEMS];
        }
    }

    /// Turn a stem on while held
    pub fn momentary_activate(&mut self, kind: StemKind) {
        self.leave_stop_all();
        if self.momentary.is_none() {
            self.momentary = Some(self.states);
        }
        self.held[kind.index()] = true;
        self.switch_on(kind);
    }

    /// Let go of a held stem
    ///
    /// Releasing the last held stem restores the selection from before the
    /// first hold. While others are still held only `kind` goes off.
    pub fn momentary_release(&mut self, kind: StemKind) {
        let Some(previous) = self.momentary else {
            self.states[kind.index()] = false;
            return;
        };
        self.held[kind.index()] = false;
        if !self.held.contains(&true) {
            self.states = previous;
            self.momentary = None;
            return;
        }
        self.states[kind.index()] = false;
        // An exclusive release may have cleared a stem that is still held
        for other in StemKind::ALL {
            if self.held[other.index()] {
                self.switch_on(other);
            }
        }
    }

    /// Engage or release "stop all". Returns whether it is now engaged.
    pub fn stop_all_toggle(&mut self) -> bool {
        if self.stop_active {
            self.states = self.saved_states;
            self.saved_states = [false; NUM_STEMS];
            self.stop_active = false;
        } else {
            self.saved_states = self.states;
            self.states = [false; NUM_STEMS];
            self.stop_active = true;
        }
        self.momentary = None;
        self.held = [false; NUM_STEMS];
        self.stop_active
    }

    /// Reader gains derived from the whole selection
    ///
    /// The full mix plays when no stem is on.
    pub fn reader_gains(&self) -> [f32; NUM_READERS] {
        let mut gains = [0.0; NUM_READERS];
        gains[MAIN_READER] = if self.any_on() { 0.0 } else { 1.0 };
        for kind in StemKind::ALL {
            if self.is_on(kind) {
                gains[stem_reader(kind)] = 1.0;
            }
        }
        gains
    }

    // ─────────────────────────────────────────────────────────────
    // Playback objects
    // ─────────────────────────────────────────────────────────────

    /// Live stem readers exist for this slot
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }
}

fn all_present(clips: &[Option<Arc<AudioClip>>; NUM_STEMS]) -> Option<[Arc<AudioClip>; NUM_STEMS]> {
    let [vocals, melody, bass, drums, instrumental] = clips;
    Some([
        Arc::clone(vocals.as_ref()?),
        Arc::clone(melody.as_ref()?),
        Arc::clone(bass.as_ref()?),
        Arc::clone(drums.as_ref()?),
        Arc::clone(instrumental.as_ref()?),
    ])
}
