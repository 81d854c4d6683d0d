//! Dry loop playback for one slot
//!
//! ```text
//!  Unloaded ──load──► Stopped ──play──► Playing(PlainLoop | IntroThenLoop)
//!                        ▲                     │
//!                        └────────stop─────────┘
//! ```
//!
//! The player cuts the span `[intro or loop_start, loop_end)` out of the
//! loaded clip and hands it to the render graph as one table. The reader
//! plays from the start of the span and, on reaching its end, wraps to the
//! loop start, so an intro plays exactly once. The sub-mode is derived from
//! the armed intro each time playback starts.
//!
//! Under key-lock at a speed other than 1.0 the table holds pitch-corrected
//! audio. Correction runs on the worker pool; until it lands the reader plays
//! whatever it had (dry audio on a fresh start), then the table is swapped
//! without moving the play position.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::audio_file::{load_clip, FileLoadError};
use crate::context::SlotContext;
use crate::dsp::{clamp_speed, db_to_amp, LEVEL_FLOOR_DB};
use crate::engine::{GraphCommand, LoopStart, SampleTable};
use crate::eq::EqSettings;
use crate::error::{EngineError, EngineResult, PitchError};
use crate::pitch::{shift_for_speed, PitchCache};
use crate::slot::{LoopSlot, LoopWindow};
use crate::types::{AudioClip, ClipId, SlotId};
use crate::worker::Completion;

/// How a playing loop treats its start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    PlainLoop,
    /// Intro once, then the loop window forever
    IntroThenLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Unloaded,
    Stopped,
    Playing(PlayMode),
}

/// The audio the reader plays, cut from the loaded clip
#[derive(Debug, Clone)]
struct Span {
    source: ClipId,
    window: LoopWindow,
    start: f64,
    clip: Arc<AudioClip>,
    /// Frame in `clip` where the loop window begins
    loop_offset: usize,
}

impl Span {
    fn mode(&self) -> PlayMode {
        if self.loop_offset > 0 {
            PlayMode::IntroThenLoop
        } else {
            PlayMode::PlainLoop
        }
    }

    fn loop_frames(&self) -> usize {
        self.clip.len().saturating_sub(self.loop_offset)
    }
}

/// Plays one slot's file as a loop
pub struct LoopPlayer {
    slot: SlotId,
    state: PlayerState,
    /// Transient intro start; cleared by `stop`
    intro_start: Option<f64>,
    span: Option<Span>,
    cache: PitchCache,
    pending_pitch: Option<(ClipId, f64)>,
    pending_load: Option<PathBuf>,
    /// Clip in the reader right now
    current: Option<Arc<AudioClip>>,
    started_at: Option<Instant>,
    /// Bumped on every reader start
    start_id: u64,
}

impl LoopPlayer {
    pub fn new(slot: SlotId) -> Self {
        Self {
            slot,
            state: PlayerState::Unloaded,
            intro_start: None,
            span: None,
            cache: PitchCache::new(),
            pending_pitch: None,
            pending_load: None,
            current: None,
            started_at: None,
            start_id: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> PlayerState {
        self.state
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        matches!(self.state, PlayerState::Playing(_))
    }

    pub fn mode(&self) -> Option<PlayMode> {
        match self.state {
            PlayerState::Playing(mode) => Some(mode),
            _ => None,
        }
    }

    /// Arm (or clear) an intro for the next start
    pub fn set_intro_start(&mut self, start: Option<f64>) {
        self.intro_start = start;
    }

    pub fn intro_start(&self) -> Option<f64> {
        self.intro_start
    }

    /// The pitch cache, for inspection
    pub fn cache(&self) -> &PitchCache {
        &self.cache
    }

    /// Clip the reader is playing
    pub fn current_clip(&self) -> Option<&Arc<AudioClip>> {
        self.current.as_ref()
    }

    /// A pitch job for the current span is running
    pub fn pitch_pending(&self) -> bool {
        self.pending_pitch.is_some()
    }

    /// Loop length as heard, in seconds: the window divided by speed
    pub fn active_loop_duration(&self, slot: &LoopSlot) -> Option<f64> {
        if !self.is_playing() {
            return None;
        }
        let span = self.span.as_ref()?;
        let secs = span.loop_frames() as f64 / span.clip.sample_rate() as f64;
        Some(secs / slot.speed)
    }

    // ─────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────

    /// Decode `path` on the worker pool; the result arrives as
    /// [`Completion::FileLoaded`]
    pub fn load_async(&mut self, ctx: &mut SlotContext<'_>, path: &Path) -> EngineResult<()> {
        let slot = self.slot;
        let sample_rate = ctx.device.sample_rate();
        let job_path = path.to_path_buf();
        let panic_path = path.to_path_buf();

        ctx.pool.spawn(
            move || {
                let result = load_clip(&job_path, sample_rate);
                Completion::FileLoaded {
                    slot,
                    path: job_path,
                    result,
                }
            },
            move |message| Completion::FileLoaded {
                slot,
                result: Err(FileLoadError::Unsupported {
                    path: panic_path.clone(),
                    reason: format!("decoder panicked: {}", message),
                }),
                path: panic_path,
            },
        )?;
        self.pending_load = Some(path.to_path_buf());
        log::info!("{}: loading {:?} in background", self.slot, path);
        Ok(())
    }

    /// Apply a finished background load
    ///
    /// Returns `None` if a later load for this slot superseded it.
    pub fn finish_load(
        &mut self,
        ctx: &mut SlotContext<'_>,
        slot: &mut LoopSlot,
        path: PathBuf,
        result: Result<AudioClip, FileLoadError>,
    ) -> Option<Result<(), FileLoadError>> {
        if !self.expects_load(&path) {
            log::debug!("{}: dropping superseded load of {:?}", self.slot, path);
            return None;
        }
        match result {
            Ok(clip) => {
                self.install(ctx, slot, path, clip);
                Some(Ok(()))
            }
            Err(e) => {
                self.pending_load = None;
                log::error!("{}: failed to load {:?}: {}", self.slot, path, e);
                Some(Err(e))
            }
        }
    }

    /// A background load of `path` is outstanding
    pub fn expects_load(&self, path: &Path) -> bool {
        self.pending_load.as_deref() == Some(path)
    }

    /// Install a decoded clip, replacing whatever was loaded
    pub fn install(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot, path: PathBuf, clip: AudioClip) {
        self.pending_load = None;
        self.stop(ctx);
        self.reset_audio();
        log::info!(
            "{}: loaded {:?} ({:.2}s, {} ch)",
            self.slot,
            path,
            clip.duration_secs(),
            clip.channels()
        );
        slot.set_loaded(path, Arc::new(clip));
        self.state = PlayerState::Stopped;
    }

    /// Stop and forget the file
    pub fn unload(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) {
        self.stop(ctx);
        self.reset_audio();
        self.pending_load = None;
        slot.clear();
        self.state = PlayerState::Unloaded;
    }

    fn reset_audio(&mut self) {
        self.cache.invalidate();
        self.span = None;
        self.pending_pitch = None;
        self.current = None;
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    /// Start (or restart) from the top of the span
    ///
    /// `muted` starts the reader under the stem mute, for when stems are
    /// already live on this slot.
    pub fn play(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot, muted: bool) -> EngineResult<()> {
        let span = self.span(slot)?;
        let clip = self.select_clip(ctx, slot, &span)?;

        let start_id = self.start_id + 1;
        ctx.device.send(GraphCommand::StartLoop(Box::new(LoopStart {
            slot: self.slot.0,
            table: SampleTable::shared(ctx.gc, Arc::clone(&clip)),
            loop_offset: span.loop_offset,
            rate: slot.speed,
            gain: db_to_amp(slot.gain_db) as f32,
            eq: slot.eq,
            muted,
            start_id,
        })))?;

        self.start_id = start_id;
        self.current = Some(clip);
        self.state = PlayerState::Playing(span.mode());
        self.started_at = Some(Instant::now());
        log::info!(
            "{}: playing {:?} {:.3}s..{:.3}s at speed {:.3}",
            self.slot,
            span.mode(),
            span.start,
            span.window.end(),
            slot.speed
        );
        Ok(())
    }

    /// Tear down the reader. Safe to call in any state.
    pub fn stop(&mut self, ctx: &mut SlotContext<'_>) {
        if self.is_playing() {
            // Best effort; a full queue is already logged
            let _ = ctx.device.send(GraphCommand::StopLoop { slot: self.slot.0 });
            log::info!("{}: stopped", self.slot);
        }
        if self.state != PlayerState::Unloaded {
            self.state = PlayerState::Stopped;
        }
        self.intro_start = None;
        self.current = None;
        self.started_at = None;
    }

    /// Cut (or reuse) the span for the current window and intro
    fn span(&mut self, slot: &LoopSlot) -> EngineResult<Span> {
        let source = slot.clip().ok_or(EngineError::NotLoaded(self.slot))?;
        let window = slot.window().ok_or(EngineError::NotLoaded(self.slot))?;
        let start = self
            .intro_start
            .filter(|&s| s >= 0.0 && s < window.start())
            .unwrap_or(window.start());

        if let Some(span) = &self.span {
            if span.source == source.id() && span.window == window && span.start == start {
                return Ok(span.clone());
            }
        }

        let clip = Arc::new(source.slice_secs(start, window.end()));
        let loop_offset = source.frame_at(window.start()) - source.frame_at(start);
        let span = Span {
            source: source.id(),
            window,
            start,
            clip,
            loop_offset,
        };
        self.span = Some(span.clone());
        Ok(span)
    }

    /// Pitched clip if key-lock needs it and it is cached, dry otherwise.
    /// A miss schedules the pitch job.
    fn select_clip(&mut self, ctx: &mut SlotContext<'_>, slot: &LoopSlot, span: &Span) -> EngineResult<Arc<AudioClip>> {
        if !slot.key_lock || slot.speed == 1.0 {
            return Ok(Arc::clone(&span.clip));
        }
        if let Some(hit) = self.cache.get(span.clip.id(), slot.speed) {
            return Ok(hit);
        }
        self.request_pitch(ctx, Arc::clone(&span.clip), slot.speed)?;
        Ok(Arc::clone(&span.clip))
    }

    fn request_pitch(&mut self, ctx: &mut SlotContext<'_>, clip: Arc<AudioClip>, speed: f64) -> EngineResult<()> {
        let source = clip.id();
        if self.pending_pitch == Some((source, speed)) {
            return Ok(());
        }
        let slot = self.slot;
        let shifter = Arc::clone(ctx.shifter);
        ctx.pool.spawn(
            move || Completion::LoopPitched {
                slot,
                source,
                speed,
                result: shift_for_speed(shifter.as_ref(), &clip, speed),
            },
            move |message| Completion::LoopPitched {
                slot,
                source,
                speed,
                result: Err(PitchError::PitchShiftUnavailable(message)),
            },
        )?;
        self.pending_pitch = Some((source, speed));
        log::debug!("{}: pitch job for speed {:.3}", self.slot, speed);
        Ok(())
    }

    /// Apply a finished pitch job
    ///
    /// Installs the clip only if it still matches the span, speed and
    /// key-lock state; anything else is stale and dropped (`None`). On
    /// failure the reader falls back to dry audio.
    pub fn finish_pitch(
        &mut self,
        ctx: &mut SlotContext<'_>,
        slot: &LoopSlot,
        source: ClipId,
        speed: f64,
        result: Result<AudioClip, PitchError>,
    ) -> Option<Result<(), PitchError>> {
        if self.pending_pitch == Some((source, speed)) {
            self.pending_pitch = None;
        }
        let span = self.span.clone()?;
        let current = span.clip.id() == source && slot.speed == speed && slot.key_lock;
        if !current {
            log::debug!("{}: dropping stale pitch result for speed {:.3}", self.slot, speed);
            return None;
        }

        match result {
            Ok(clip) => {
                let clip = Arc::new(clip);
                self.cache.insert(source, speed, Arc::clone(&clip));
                if self.is_playing() {
                    self.swap_clip(ctx, &span, clip);
                }
                log::info!("{}: key-lock audio ready for speed {:.3}", self.slot, speed);
                Some(Ok(()))
            }
            Err(e) => {
                log::warn!("{}: {}; playing uncorrected audio", self.slot, e);
                if self.is_playing() {
                    self.swap_clip(ctx, &span, Arc::clone(&span.clip));
                }
                Some(Err(e))
            }
        }
    }

    fn swap_clip(&mut self, ctx: &mut SlotContext<'_>, span: &Span, clip: Arc<AudioClip>) {
        if self.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &clip)) {
            return;
        }
        let sent = ctx.device.send(GraphCommand::SwapLoopTable {
            slot: self.slot.0,
            table: SampleTable::shared(ctx.gc, Arc::clone(&clip)),
            loop_offset: span.loop_offset,
        });
        if sent.is_ok() {
            self.current = Some(clip);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Parameters
    // ─────────────────────────────────────────────────────────────

    /// Change playback speed (clamped to the supported range)
    ///
    /// The rate changes at once. Under key-lock the pitch cache is emptied
    /// for the new speed and a corrected clip is requested; at 1.0 the dry
    /// clip goes straight back in.
    pub fn set_speed(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot, speed: f64) -> EngineResult<()> {
        let speed = clamp_speed(speed);
        if speed == slot.speed {
            return Ok(());
        }
        slot.speed = speed;
        if self.cache.cached_speed().is_some_and(|cached| cached != speed) {
            self.cache.invalidate();
        }

        if !self.is_playing() {
            return Ok(());
        }
        ctx.device.send(GraphCommand::SetLoopRate {
            slot: self.slot.0,
            rate: speed,
        })?;

        if slot.key_lock {
            let span = self.span(slot)?;
            if speed == 1.0 {
                self.swap_clip(ctx, &span, Arc::clone(&span.clip));
            } else if let Some(hit) = self.cache.get(span.clip.id(), speed) {
                self.swap_clip(ctx, &span, hit);
            } else {
                self.request_pitch(ctx, Arc::clone(&span.clip), speed)?;
            }
        }
        Ok(())
    }

    /// Switch pitch correction. A playing loop restarts on the new signal
    /// path; the cache is left alone.
    pub fn set_key_lock(
        &mut self,
        ctx: &mut SlotContext<'_>,
        slot: &mut LoopSlot,
        enabled: bool,
        muted: bool,
    ) -> EngineResult<()> {
        if slot.key_lock == enabled {
            return Ok(());
        }
        slot.key_lock = enabled;
        if self.is_playing() {
            ctx.device.send(GraphCommand::StopLoop { slot: self.slot.0 })?;
            self.play(ctx, slot, muted)?;
        }
        Ok(())
    }

    /// Move the loop window
    ///
    /// Invalid bounds are rejected and the old window stays. Valid bounds
    /// drop the pitch cache; a playing loop restarts on the new window.
    pub fn update_loop_points(
        &mut self,
        ctx: &mut SlotContext<'_>,
        slot: &mut LoopSlot,
        start: f64,
        end: f64,
        muted: bool,
    ) -> EngineResult<()> {
        let window = slot.set_window(start, end)?;
        self.reset_audio();
        log::info!("{}: loop window {:.3}s..{:.3}s", self.slot, window.start(), window.end());
        if self.is_playing() {
            self.play(ctx, slot, muted)?;
        }
        Ok(())
    }

    pub fn set_gain_db(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot, gain_db: f64) -> EngineResult<()> {
        slot.gain_db = gain_db;
        ctx.device.send(GraphCommand::SetSlotGain {
            slot: self.slot.0,
            gain: db_to_amp(gain_db) as f32,
        })
    }

    pub fn set_eq(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot, eq: EqSettings) -> EngineResult<()> {
        slot.eq = eq;
        ctx.device.send(GraphCommand::SetSlotEq { slot: self.slot.0, eq })
    }

    /// Meter reading in dBFS; the floor when not playing
    pub fn level_db(&self, ctx: &SlotContext<'_>) -> f32 {
        if !self.is_playing() {
            return LEVEL_FLOOR_DB;
        }
        ctx.device
            .slot_atomics(self.slot.0)
            .map(|atomics| atomics.level_db())
            .unwrap_or(LEVEL_FLOOR_DB)
    }

    /// Counter of the most recent reader start, matched against
    /// [`SlotAtomics::dry_loop_phase`](crate::engine::SlotAtomics::dry_loop_phase)
    pub fn start_id(&self) -> u64 {
        self.start_id
    }

    /// Loop phase estimated from the time since playback started
    ///
    /// `None` while stopped or while the intro is still playing.
    pub fn wall_clock_phase(&self, slot: &LoopSlot) -> Option<f64> {
        let started = self.started_at?;
        let span = self.span.as_ref()?;
        let loop_frames = span.loop_frames() as f64;
        if loop_frames <= 0.0 {
            return None;
        }
        let played = started.elapsed().as_secs_f64() * span.clip.sample_rate() as f64 * slot.speed;
        let into_loop = played - span.loop_offset as f64;
        if into_loop < 0.0 {
            return None;
        }
        Some((into_loop / loop_frames).fract())
    }
}
