//! Synchronized stem playback for one slot
//!
//! One phase clock drives six table readers: the full mix ("main") and the
//! five stems. Every reader maps the same phase to a frame of its own table,
//! so they cannot drift apart, and which stems are audible is purely a matter
//! of reader gains.
//!
//! ```text
//!                 ┌─► main   ─┐
//!  PhaseClock ────┼─► vocals ─┤
//!  speed / loop   ├─► ...     ├─► Σ ─► EQ ─► slot gain ─► master
//!                 └─► instr. ─┘
//! ```
//!
//! # Lifecycle
//!
//! - [`initialize`](StemEngine::initialize): cold start at phase 0.
//! - [`initialize_while_running`](StemEngine::initialize_while_running): join
//!   a dry loop that is already playing, at its current phase.
//! - [`restart_phasor`](StemEngine::restart_phasor): retrigger. Tables and
//!   readers stay; only the clock is reset (and retuned if speed moved).
//! - [`cleanup_stem_players`](StemEngine::cleanup_stem_players): stop the
//!   readers, keep the tables for the next trigger.
//! - [`stop_stem_players`](StemEngine::stop_stem_players): stop and release
//!   everything.
//!
//! Tables are rebuilt only when what they would contain changes: source,
//! loop window, stems, or (under key-lock) speed. While live, the slot's dry
//! player keeps running under a mute so its loop bookkeeping stays correct.
//!
//! # Key-lock repitch
//!
//! Pitched tables come from background jobs, one per reader. Each batch has a
//! generation number; a new speed starts a new generation and results from
//! older ones are dropped on arrival. Until a batch lands the readers play
//! dry audio.

use std::sync::Arc;
use std::time::Instant;

use crate::context::SlotContext;
use crate::dsp::db_to_amp;
use crate::engine::{
    table_versions, GraphCommand, PhaseClock, ReaderTables, SampleTable, StemStart, MAIN_READER, NUM_READERS,
};
use crate::error::{EngineError, EngineResult, PitchError};
use crate::pitch::{shift_for_speed, PitchCache};
use crate::slot::{LoopSlot, LoopWindow};
use crate::types::{AudioClip, ClipId, SlotId, StereoBuffer};
use crate::worker::Completion;

/// What a table set was built from
#[derive(Debug, Clone, Copy, PartialEq)]
struct TableKey {
    source: ClipId,
    window: LoopWindow,
    stems_generation: u64,
    /// Speed the audio was pitch corrected for; `None` for dry audio
    pitch: Option<f64>,
}

struct BuiltTables {
    key: TableKey,
    tables: ReaderTables,
}

/// Loop-window cuts of the source and stems
///
/// Kept between builds so clip identities (and with them the pitch cache
/// keys) stay stable while the window does.
struct Slices {
    source: ClipId,
    window: LoopWindow,
    stems_generation: u64,
    readers: [Arc<AudioClip>; NUM_READERS],
}

struct Repitch {
    generation: u64,
    key: TableKey,
    main_source: ClipId,
    results: [Option<Arc<AudioClip>>; NUM_READERS],
    remaining: usize,
    error: Option<PitchError>,
}

/// Per-slot stem player
pub struct StemEngine {
    slot: SlotId,
    built: Option<BuiltTables>,
    slices: Option<Slices>,
    main_cache: PitchCache,
    live: bool,
    frequency: f64,
    started_at: Option<Instant>,
    generation: u64,
    repitch: Option<Repitch>,
}

impl StemEngine {
    pub fn new(slot: SlotId) -> Self {
        Self {
            slot,
            built: None,
            slices: None,
            main_cache: PitchCache::new(),
            live: false,
            frequency: 0.0,
            started_at: None,
            generation: 0,
            repitch: None,
        }
    }

    /// Readers are running
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Current clock frequency in Hz
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Version tags of the resident tables, if any are built
    pub fn table_versions(&self) -> Option<[Option<u64>; NUM_READERS]> {
        self.built.as_ref().map(|b| table_versions(&b.tables))
    }

    /// Whether the resident tables hold pitch-corrected audio, and for which speed
    pub fn pitched_speed(&self) -> Option<f64> {
        self.built.as_ref().and_then(|b| b.key.pitch)
    }

    /// A key-lock repitch batch is outstanding
    pub fn repitch_pending(&self) -> bool {
        self.repitch.is_some()
    }

    /// Seconds since the clock was last started or reset
    pub fn elapsed_secs(&self) -> Option<f64> {
        self.started_at.map(|t| t.elapsed().as_secs_f64())
    }

    /// Clip currently loaded into one reader
    pub fn reader_clip(&self, reader: usize) -> Option<Arc<AudioClip>> {
        let built = self.built.as_ref()?;
        built.tables.get(reader)?.as_ref().map(|t| Arc::clone(t.clip()))
    }

    // ─────────────────────────────────────────────────────────────
    // Start / stop
    // ─────────────────────────────────────────────────────────────

    /// Cold start: clock at phase 0
    pub fn initialize(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) -> EngineResult<()> {
        self.start(ctx, slot, 0.0)
    }

    /// Join a dry loop that is already playing
    ///
    /// The phase comes from the dry reader's published position when it is
    /// inside the loop proper and was rendered for `dry_start_id`, the
    /// player's latest start. A retrigger that the audio thread has not
    /// picked up yet leaves the old position published, so then
    /// `wall_clock_phase` (an estimate from elapsed time) is used, and
    /// failing that phase 0.
    pub fn initialize_while_running(
        &mut self,
        ctx: &mut SlotContext<'_>,
        slot: &mut LoopSlot,
        dry_start_id: u64,
        wall_clock_phase: Option<f64>,
    ) -> EngineResult<()> {
        let exact = ctx
            .device
            .slot_atomics(self.slot.0)
            .and_then(|atomics| atomics.dry_loop_phase(dry_start_id));
        let phase = match (exact, wall_clock_phase) {
            (Some(phase), _) => phase,
            (None, Some(estimate)) => {
                log::debug!("{}: dry position unavailable, using wall-clock phase", self.slot);
                estimate
            }
            (None, None) => 0.0,
        };
        self.start(ctx, slot, phase)
    }

    fn start(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot, phase: f64) -> EngineResult<()> {
        if !slot.stems.is_available() {
            return Err(EngineError::StemsUnavailable(self.slot));
        }
        self.ensure_tables(ctx, slot)?;
        let Some(built) = self.built.as_ref() else {
            return Err(EngineError::StemsUnavailable(self.slot));
        };

        let frequency = Self::clock_frequency(&built.tables, slot.speed);
        ctx.device.send(GraphCommand::StartStems(Box::new(StemStart {
            slot: self.slot.0,
            tables: built.tables.clone(),
            phase,
            frequency,
            gains: slot.stems.reader_gains(),
            gain: db_to_amp(slot.gain_db) as f32,
            eq: slot.eq,
        })))?;
        ctx.device.send(GraphCommand::SetLoopMute {
            slot: self.slot.0,
            muted: true,
        })?;

        self.live = true;
        self.frequency = frequency;
        self.started_at = Some(Instant::now());
        slot.stems.set_initialized(true);
        log::info!("{}: stems started at phase {:.3} ({:.4} Hz)", self.slot, phase, frequency);
        Ok(())
    }

    /// Retrigger: reset the clock, keep tables and readers
    ///
    /// Falls back to a cold start when nothing is live.
    pub fn restart_phasor(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) -> EngineResult<()> {
        if !self.live {
            return self.initialize(ctx, slot);
        }
        if let Some(built) = self.built.as_ref() {
            let frequency = Self::clock_frequency(&built.tables, slot.speed);
            if frequency != self.frequency {
                ctx.device.send(GraphCommand::SetClockFrequency {
                    slot: self.slot.0,
                    frequency,
                })?;
                self.frequency = frequency;
            }
        }
        ctx.device.send(GraphCommand::ResetClock {
            slot: self.slot.0,
            phase: 0.0,
        })?;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Stop the readers, keep the tables for a fast restart
    pub fn cleanup_stem_players(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) {
        self.silence(ctx);
        slot.stems.set_initialized(false);
    }

    /// Stop the readers and release every table and cached buffer
    pub fn stop_stem_players(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) {
        self.silence(ctx);
        self.built = None;
        self.slices = None;
        self.main_cache.invalidate();
        self.repitch = None;
        self.generation += 1;
        slot.stems.set_initialized(false);
        log::debug!("{}: stem tables released", self.slot);
    }

    fn silence(&mut self, ctx: &mut SlotContext<'_>) {
        if !self.live {
            return;
        }
        // Teardown is best effort; a full queue is already logged
        let _ = ctx.device.send(GraphCommand::StopStems { slot: self.slot.0 });
        let _ = ctx.device.send(GraphCommand::SetLoopMute {
            slot: self.slot.0,
            muted: false,
        });
        self.live = false;
        self.started_at = None;
        log::info!("{}: stems stopped", self.slot);
    }

    // ─────────────────────────────────────────────────────────────
    // Live updates
    // ─────────────────────────────────────────────────────────────

    /// Push gains for the current selection (recomputed in full)
    pub fn update_gains(&mut self, ctx: &mut SlotContext<'_>, slot: &LoopSlot) -> EngineResult<()> {
        if !self.live {
            return Ok(());
        }
        ctx.device.send(GraphCommand::SetStemGains {
            slot: self.slot.0,
            gains: slot.stems.reader_gains(),
        })
    }

    /// Follow a speed change: retune the clock and, under key-lock, move to
    /// tables for the new speed
    pub fn set_speed(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) -> EngineResult<()> {
        if slot.key_lock {
            self.refresh(ctx, slot)?;
        }
        if !self.live {
            return Ok(());
        }
        let Some(built) = self.built.as_ref() else {
            return Ok(());
        };
        let frequency = Self::clock_frequency(&built.tables, slot.speed);
        if frequency != self.frequency {
            ctx.device.send(GraphCommand::SetClockFrequency {
                slot: self.slot.0,
                frequency,
            })?;
            self.frequency = frequency;
        }
        Ok(())
    }

    /// Follow a key-lock change without stopping the clock
    pub fn set_key_lock(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) -> EngineResult<()> {
        self.refresh(ctx, slot)
    }

    /// The loop window moved: cached audio is useless. Live readers restart
    /// at phase 0 on new tables, in step with the restarted dry loop.
    pub fn loop_window_changed(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) -> EngineResult<()> {
        self.main_cache.invalidate();
        slot.stems.invalidate_pitched();
        self.repitch = None;
        self.generation += 1;
        if self.live {
            self.start(ctx, slot, 0.0)?;
        }
        Ok(())
    }

    /// Rebuild tables if their content is stale and hot-swap them into live readers
    fn refresh(&mut self, ctx: &mut SlotContext<'_>, slot: &mut LoopSlot) -> EngineResult<()> {
        if self.built.is_none() && !self.live {
            return Ok(());
        }
        if !slot.stems.is_available() {
            return Ok(());
        }
        if self.ensure_tables(ctx, slot)? && self.live {
            self.swap_tables(ctx)?;
        }
        Ok(())
    }

    fn swap_tables(&mut self, ctx: &mut SlotContext<'_>) -> EngineResult<()> {
        let Some(built) = self.built.as_ref() else {
            return Ok(());
        };
        for (reader, table) in built.tables.iter().enumerate() {
            if let Some(table) = table {
                ctx.device.send(GraphCommand::SwapStemTable {
                    slot: self.slot.0,
                    reader,
                    table: table.clone(),
                })?;
            }
        }
        log::debug!("{}: swapped stem tables", self.slot);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Tables
    // ─────────────────────────────────────────────────────────────

    fn clock_frequency(tables: &ReaderTables, speed: f64) -> f64 {
        let loop_secs = tables[MAIN_READER].as_ref().map(|t| t.duration_secs()).unwrap_or(0.0);
        PhaseClock::frequency_for(speed, loop_secs)
    }

    fn wanted_key(slot: &LoopSlot) -> Option<TableKey> {
        Some(TableKey {
            source: slot.clip()?.id(),
            window: slot.window()?,
            stems_generation: slot.stems.generation(),
            pitch: (slot.key_lock && slot.speed != 1.0).then_some(slot.speed),
        })
    }

    /// Make sure the loop-window slices match the slot
    fn refresh_slices(&mut self, slot: &LoopSlot) -> EngineResult<()> {
        let source = slot.clip().ok_or(EngineError::NotLoaded(self.slot))?;
        let window = slot.window().ok_or(EngineError::NotLoaded(self.slot))?;
        let generation = slot.stems.generation();

        if let Some(slices) = &self.slices {
            if slices.source == source.id() && slices.window == window && slices.stems_generation == generation {
                return Ok(());
            }
        }

        let stems = slot.stems.dry_all().ok_or(EngineError::StemsUnavailable(self.slot))?;
        let main = Arc::new(source.slice_secs(window.start(), window.end()));
        let frames = main.len();
        let [vocals, melody, bass, drums, instrumental] =
            stems.map(|stem| Arc::new(fit_length(stem.slice_secs(window.start(), window.end()), frames)));

        self.slices = Some(Slices {
            source: source.id(),
            window,
            stems_generation: generation,
            readers: [main, vocals, melody, bass, drums, instrumental],
        });
        Ok(())
    }

    /// Build tables unless the resident ones already hold the right audio.
    /// Returns whether a new set was built.
    fn ensure_tables(&mut self, ctx: &mut SlotContext<'_>, slot: &LoopSlot) -> EngineResult<bool> {
        let wanted = Self::wanted_key(slot).ok_or(EngineError::NotLoaded(self.slot))?;
        self.refresh_slices(slot)?;
        let Some(slices) = self.slices.as_ref() else {
            return Err(EngineError::StemsUnavailable(self.slot));
        };

        let (key, clips) = match wanted.pitch {
            Some(speed) => {
                let main = self.main_cache.get(slices.readers[MAIN_READER].id(), speed);
                let stems = slot.stems.pitched_for(speed, wanted.window);
                match (main, stems) {
                    (Some(main), Some([vocals, melody, bass, drums, instrumental])) => {
                        (wanted, [main, vocals, melody, bass, drums, instrumental])
                    }
                    _ => {
                        let dry = slices.readers.clone();
                        self.schedule_repitch(ctx, wanted)?;
                        (TableKey { pitch: None, ..wanted }, dry)
                    }
                }
            }
            None => (wanted, slices.readers.clone()),
        };

        if self.built.as_ref().is_some_and(|b| b.key == key) {
            return Ok(false);
        }

        let tables: ReaderTables = clips.map(|clip| Some(SampleTable::shared(ctx.gc, clip)));
        self.built = Some(BuiltTables { key, tables });
        match key.pitch {
            Some(speed) => log::info!("{}: built pitched stem tables for speed {:.3}", self.slot, speed),
            None => log::info!("{}: built dry stem tables", self.slot),
        }
        Ok(true)
    }

    /// Start a repitch batch for `key` unless one is already running for it
    fn schedule_repitch(&mut self, ctx: &mut SlotContext<'_>, key: TableKey) -> EngineResult<()> {
        let Some(speed) = key.pitch else {
            return Ok(());
        };
        if self.repitch.as_ref().is_some_and(|r| r.key == key) {
            return Ok(());
        }
        let Some(slices) = self.slices.as_ref() else {
            return Ok(());
        };

        self.generation += 1;
        let generation = self.generation;
        self.repitch = Some(Repitch {
            generation,
            key,
            main_source: slices.readers[MAIN_READER].id(),
            results: Default::default(),
            remaining: NUM_READERS,
            error: None,
        });

        let slot = self.slot;
        for (reader, clip) in slices.readers.iter().enumerate() {
            let clip = Arc::clone(clip);
            let shifter = Arc::clone(ctx.shifter);
            ctx.pool.spawn(
                move || Completion::StemPitched {
                    slot,
                    reader,
                    generation,
                    speed,
                    result: shift_for_speed(shifter.as_ref(), &clip, speed),
                },
                move |message| Completion::StemPitched {
                    slot,
                    reader,
                    generation,
                    speed,
                    result: Err(PitchError::PitchShiftUnavailable(message)),
                },
            )?;
        }
        log::info!("{}: repitching stems for speed {:.3} (generation {})", self.slot, speed, generation);
        Ok(())
    }

    /// Collect one repitched reader
    ///
    /// Returns `Some` once the whole batch is in: `Ok` when pitched tables
    /// were installed, `Err` when shifting failed and the dry tables stay.
    /// Results from superseded batches are dropped and yield `None`.
    pub fn apply_repitch(
        &mut self,
        ctx: &mut SlotContext<'_>,
        slot: &mut LoopSlot,
        reader: usize,
        generation: u64,
        result: Result<AudioClip, PitchError>,
    ) -> Option<Result<(), PitchError>> {
        let Some(batch) = self.repitch.as_mut().filter(|r| r.generation == generation) else {
            log::debug!("{}: dropping stale stem repitch (generation {})", self.slot, generation);
            return None;
        };
        match result {
            Ok(clip) => {
                if let Some(entry) = batch.results.get_mut(reader) {
                    *entry = Some(Arc::new(clip));
                }
            }
            Err(e) => batch.error = Some(e),
        }
        batch.remaining = batch.remaining.saturating_sub(1);
        if batch.remaining > 0 {
            return None;
        }

        let batch = self.repitch.take()?;
        if let Some(e) = batch.error {
            log::warn!("{}: stem repitch failed, playing dry stems: {}", self.slot, e);
            return Some(Err(e));
        }
        if Self::wanted_key(slot) != Some(batch.key) {
            log::debug!("{}: stem repitch no longer matches the slot, dropping", self.slot);
            return None;
        }
        let Some(speed) = batch.key.pitch else {
            return None;
        };
        let [Some(main), Some(vocals), Some(melody), Some(bass), Some(drums), Some(instrumental)] = batch.results
        else {
            return None;
        };

        self.main_cache.insert(batch.main_source, speed, main);
        slot.stems
            .store_pitched(speed, batch.key.window, [vocals, melody, bass, drums, instrumental]);

        if let Err(e) = self.refresh(ctx, slot) {
            log::warn!("{}: could not install pitched stems: {}", self.slot, e);
        }
        Some(Ok(()))
    }
}

/// Pad with silence or truncate to `frames`
///
/// Stems should match the source length; if a separator is a few frames off,
/// every reader still has to cover the same phase range.
fn fit_length(clip: AudioClip, frames: usize) -> AudioClip {
    if clip.len() == frames {
        return clip;
    }
    let mut buffer = StereoBuffer::silence(frames);
    let n = frames.min(clip.len());
    buffer.as_mut_slice()[..n].copy_from_slice(&clip.frames().as_slice()[..n]);
    AudioClip::new(buffer, clip.sample_rate(), clip.channels())
}
