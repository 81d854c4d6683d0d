//! Per-slot record
//!
//! A [`LoopSlot`] is the control thread's view of one grid button: what file
//! is loaded, its tempo and loop window, the mix settings and the stems.
//! Players and stem engines read and write it through the session; nothing
//! else holds it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::eq::EqSettings;
use crate::error::{EngineError, EngineResult};
use crate::stems::StemSet;
use crate::types::{AudioClip, SlotId};

/// Playback window within a file, in seconds
///
/// Always satisfies `0 <= start < end`; construct it with [`LoopWindow::new`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopWindow {
    start: f64,
    end: f64,
}

impl LoopWindow {
    /// Validate bounds against a file of `duration` seconds
    pub fn new(start: f64, end: f64, duration: f64) -> EngineResult<Self> {
        let valid = start.is_finite() && end.is_finite() && start >= 0.0 && end > start && end <= duration;
        if !valid {
            return Err(EngineError::InvalidLoopBounds { start, end, duration });
        }
        Ok(Self { start, end })
    }

    /// The whole clip
    pub fn full(clip: &AudioClip) -> Self {
        Self {
            start: 0.0,
            end: clip.duration_secs(),
        }
    }

    #[inline]
    pub fn start(&self) -> f64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Everything known about one grid slot
#[derive(Debug)]
pub struct LoopSlot {
    id: SlotId,
    file_path: Option<PathBuf>,
    clip: Option<Arc<AudioClip>>,
    window: Option<LoopWindow>,
    /// Tempo of the original file
    pub bpm: Option<f64>,
    /// Persisted intro start; armed on trigger when `intro_enabled`
    pub intro_start: Option<f64>,
    pub intro_enabled: bool,
    pub gain_db: f64,
    pub eq: EqSettings,
    pub key_lock: bool,
    /// Current playback speed (1.0 = original tempo)
    pub speed: f64,
    /// Producing audio (or about to)
    pub active: bool,
    pub stems: StemSet,
}

impl LoopSlot {
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            file_path: None,
            clip: None,
            window: None,
            bpm: None,
            intro_start: None,
            intro_enabled: false,
            gain_db: 0.0,
            eq: EqSettings::default(),
            key_lock: false,
            speed: 1.0,
            active: false,
            stems: StemSet::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn clip(&self) -> Option<&Arc<AudioClip>> {
        self.clip.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.clip.is_some()
    }

    /// Current loop window; `None` when nothing is loaded
    pub fn window(&self) -> Option<LoopWindow> {
        self.window
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.clip.as_ref().map(|c| c.duration_secs())
    }

    /// Install freshly loaded audio. The loop window covers the whole file and
    /// the intro, tempo and stems from any previous file are dropped.
    pub fn set_loaded(&mut self, path: PathBuf, clip: Arc<AudioClip>) {
        self.window = Some(LoopWindow::full(&clip));
        self.file_path = Some(path);
        self.clip = Some(clip);
        self.bpm = None;
        self.intro_start = None;
        self.intro_enabled = false;
        self.active = false;
        self.stems.clear();
    }

    /// Forget the file. Mix settings survive.
    pub fn clear(&mut self) {
        self.file_path = None;
        self.clip = None;
        self.window = None;
        self.bpm = None;
        self.intro_start = None;
        self.intro_enabled = false;
        self.active = false;
        self.stems.clear();
    }

    /// Replace the loop window; invalid bounds leave the old one in place
    pub fn set_window(&mut self, start: f64, end: f64) -> EngineResult<LoopWindow> {
        let duration = self.duration_secs().ok_or(EngineError::NotLoaded(self.id))?;
        let window = LoopWindow::new(start, end, duration)?;
        self.window = Some(window);
        Ok(window)
    }

    /// Intro start to arm on trigger: enabled, set, and before the loop
    pub fn armed_intro(&self) -> Option<f64> {
        let window = self.window?;
        self.intro_start
            .filter(|_| self.intro_enabled)
            .filter(|&start| start >= 0.0 && start < window.start())
    }

    /// Persisted settings, without stems
    pub fn config(&self) -> Option<SlotConfig> {
        let window = self.window?;
        Some(SlotConfig {
            slot: self.id.0,
            file_path: self.file_path.clone()?,
            bpm: self.bpm,
            gain_db: self.gain_db,
            loop_start: window.start(),
            loop_end: window.end(),
            intro_start: self.intro_start,
            intro_enabled: self.intro_enabled,
            eq: self.eq,
            key_lock: self.key_lock,
        })
    }
}

/// Persistable settings of one loaded slot
///
/// Stems are never part of it; they are regenerated each session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot: usize,
    pub file_path: PathBuf,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub gain_db: f64,
    pub loop_start: f64,
    pub loop_end: f64,
    #[serde(default)]
    pub intro_start: Option<f64>,
    #[serde(default)]
    pub intro_enabled: bool,
    #[serde(default)]
    pub eq: EqSettings,
    #[serde(default)]
    pub key_lock: bool,
}
