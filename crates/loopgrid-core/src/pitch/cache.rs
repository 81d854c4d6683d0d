//! Single-entry pitch cache
//!
//! Holds at most one shifted clip, keyed by (source clip identity, speed).
//! Asking for any other key evicts the entry. Speeds compare with exact
//! floating-point equality: a knob at 1.25 hits, 1.2500001 does not.
//!
//! Keeping a single entry is what guarantees stale audio is never played: a
//! buffer shifted for an old speed or old loop bounds cannot be looked up
//! once anything about the key has changed.

use std::sync::Arc;

use super::{shift_for_speed, PitchShift};
use crate::error::PitchResult;
use crate::types::{AudioClip, ClipId};

#[derive(Debug, Clone)]
struct Entry {
    source: ClipId,
    speed: f64,
    clip: Arc<AudioClip>,
}

/// Memoized pitch-corrected audio for one owner
#[derive(Debug, Clone, Default)]
pub struct PitchCache {
    entry: Option<Entry>,
}

impl PitchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached clip for exactly this source and speed
    pub fn get(&self, source: ClipId, speed: f64) -> Option<Arc<AudioClip>> {
        self.entry
            .as_ref()
            .filter(|e| e.source == source && e.speed == speed)
            .map(|e| Arc::clone(&e.clip))
    }

    pub fn contains(&self, source: ClipId, speed: f64) -> bool {
        self.get(source, speed).is_some()
    }

    /// Return the cached clip for `(source, speed)`, shifting and caching it first
    /// if needed
    ///
    /// Blocking. Fine on a worker thread; on the control thread only call it
    /// when the entry is known to exist. A miss evicts the old entry before
    /// shifting, so a failure leaves the cache empty.
    pub fn get_or_create(
        &mut self,
        shifter: &dyn PitchShift,
        source: &Arc<AudioClip>,
        speed: f64,
    ) -> PitchResult<Arc<AudioClip>> {
        if let Some(hit) = self.get(source.id(), speed) {
            return Ok(hit);
        }
        self.entry = None;
        let shifted = Arc::new(shift_for_speed(shifter, source, speed)?);
        self.insert(source.id(), speed, Arc::clone(&shifted));
        Ok(shifted)
    }

    /// Store a clip computed elsewhere, evicting whatever was cached
    pub fn insert(&mut self, source: ClipId, speed: f64, clip: Arc<AudioClip>) {
        self.entry = Some(Entry { source, speed, clip });
    }

    /// Drop the cached clip
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Speed the cached clip was shifted for
    pub fn cached_speed(&self) -> Option<f64> {
        self.entry.as_ref().map(|e| e.speed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}
