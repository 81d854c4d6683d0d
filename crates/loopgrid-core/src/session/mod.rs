//! Session root
//!
//! [`Session`] owns everything with a lifetime: the slot records, one
//! [`LoopPlayer`] and one [`StemEngine`] per slot, the audio device, the
//! worker pool and the table collector. All control operations go through it
//! on a single control thread; background results come back through
//! [`Session::poll`].
//!
//! ```text
//!   UI ──► Session ──┬─► LoopPlayer[i] ─┐
//!                    ├─► StemEngine[i] ─┼─► AudioDevice ──rtrb──► callback
//!                    └─► SessionStore   │
//!                                       └─► WorkerPool ──Completion──┐
//!   UI ◄── SessionObserver ◄── poll() ◄──────────────────────────────┘
//! ```
//!
//! Players and engines never hold the device or the store. For every call
//! the session lends them their slot record and a [`SlotContext`].

mod observer;
mod store;

pub use observer::{NullObserver, SessionObserver};
pub use store::{SessionSnapshot, SessionStore};

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use basedrop::Handle;

use crate::audio::{AudioDevice, GraphSettings};
use crate::audio_file::load_clip;
use crate::config::EngineConfig;
use crate::context::SlotContext;
use crate::engine::GarbageCollector;
use crate::eq::EqSettings;
use crate::error::{EngineError, EngineResult, SeparationRefusal};
use crate::pitch::{PitchShift, SignalsmithShifter};
use crate::player::LoopPlayer;
use crate::separation::{BpmDetector, SeparationError, StemSeparator};
use crate::slot::LoopSlot;
use crate::stems::{StemEngine, StemStates};
use crate::types::{SlotId, StemKind, StereoBuffer};
use crate::worker::{Completion, WorkerPool};

/// How long shutdown waits for background jobs
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polls in [`Session::wait_idle`]
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Pluggable collaborators; anything left `None` gets the built-in default
/// (or stays absent, for the separator and detector)
#[derive(Default)]
pub struct Collaborators {
    pub shifter: Option<Arc<dyn PitchShift>>,
    pub separator: Option<Arc<dyn StemSeparator>>,
    pub detector: Option<Arc<dyn BpmDetector>>,
    pub observer: Option<Box<dyn SessionObserver>>,
}

impl Collaborators {
    pub fn with_shifter(mut self, shifter: Arc<dyn PitchShift>) -> Self {
        self.shifter = Some(shifter);
        self
    }

    pub fn with_separator(mut self, separator: Arc<dyn StemSeparator>) -> Self {
        self.separator = Some(separator);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn BpmDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// One slot's record, player and engine, plus the services they need
struct Parts<'a> {
    slot: &'a mut LoopSlot,
    player: &'a mut LoopPlayer,
    engine: &'a mut StemEngine,
    ctx: SlotContext<'a>,
}

/// The loop grid
pub struct Session {
    config: EngineConfig,
    store: SessionStore,
    players: Vec<LoopPlayer>,
    engines: Vec<StemEngine>,
    device: AudioDevice,
    pool: WorkerPool,
    gc: GarbageCollector,
    gc_handle: Handle,
    shifter: Arc<dyn PitchShift>,
    separator: Option<Arc<dyn StemSeparator>>,
    detector: Option<Arc<dyn BpmDetector>>,
    observer: Box<dyn SessionObserver>,
    shut_down: bool,
}

impl Session {
    /// Open the configured output device and start it
    ///
    /// A device that cannot be opened is fatal: the error is returned as
    /// [`EngineError::DeviceBootFailure`] and nothing is retried.
    pub fn boot(config: EngineConfig, collaborators: Collaborators) -> EngineResult<Self> {
        let config = config.sanitized();
        let device = AudioDevice::boot(&config.audio, Self::graph_settings(&config))?;
        Self::with_device(config, device, collaborators)
    }

    /// Session on the offline backend; audio is pulled with
    /// [`render_offline`](Self::render_offline)
    pub fn offline(config: EngineConfig, sample_rate: u32, collaborators: Collaborators) -> EngineResult<Self> {
        let config = config.sanitized();
        let device = AudioDevice::offline(sample_rate, Self::graph_settings(&config));
        Self::with_device(config, device, collaborators)
    }

    fn graph_settings(config: &EngineConfig) -> GraphSettings {
        GraphSettings {
            max_slots: config.max_slots,
            ramp_ms: config.stem_ramp_ms,
            queue_capacity: config.command_queue_capacity,
        }
    }

    fn with_device(config: EngineConfig, mut device: AudioDevice, collaborators: Collaborators) -> EngineResult<Self> {
        let pool = WorkerPool::new(config.worker_threads)?;
        let gc = GarbageCollector::spawn().map_err(|e| EngineError::Worker(format!("audio GC: {}", e)))?;
        let gc_handle = gc.handle();

        device.start()?;
        device.set_master_gain_db(config.master_gain_db)?;

        let shifter = collaborators
            .shifter
            .unwrap_or_else(|| Arc::new(SignalsmithShifter::new(config.pitch_quality)));
        let slots = config.max_slots;
        log::info!(
            "Session ready: {} slots, {} workers, pitch shifter '{}'",
            slots,
            config.worker_threads,
            shifter.name()
        );

        Ok(Self {
            store: SessionStore::new(slots),
            players: (0..slots).map(|i| LoopPlayer::new(SlotId(i))).collect(),
            engines: (0..slots).map(|i| StemEngine::new(SlotId(i))).collect(),
            device,
            pool,
            gc,
            gc_handle,
            shifter,
            separator: collaborators.separator,
            detector: collaborators.detector,
            observer: collaborators.observer.unwrap_or_else(|| Box::new(NullObserver)),
            config,
            shut_down: false,
        })
    }

    fn parts(&mut self, id: SlotId) -> EngineResult<Parts<'_>> {
        let Session {
            store,
            players,
            engines,
            device,
            pool,
            gc_handle,
            shifter,
            ..
        } = self;
        let slot = store.get_mut(id)?;
        let player = players.get_mut(id.0).ok_or(EngineError::UnknownSlot(id.0))?;
        let engine = engines.get_mut(id.0).ok_or(EngineError::UnknownSlot(id.0))?;
        Ok(Parts {
            slot,
            player,
            engine,
            ctx: SlotContext {
                device,
                gc: gc_handle,
                pool,
                shifter,
            },
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn num_slots(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn slot(&self, id: SlotId) -> EngineResult<&LoopSlot> {
        self.store.get(id)
    }

    pub fn player(&self, id: SlotId) -> EngineResult<&LoopPlayer> {
        self.players.get(id.0).ok_or(EngineError::UnknownSlot(id.0))
    }

    pub fn stem_engine(&self, id: SlotId) -> EngineResult<&StemEngine> {
        self.engines.get(id.0).ok_or(EngineError::UnknownSlot(id.0))
    }

    pub fn is_playing(&self, id: SlotId) -> EngineResult<bool> {
        Ok(self.player(id)?.is_playing())
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    /// Pull the next `frames` of output from an offline session
    pub fn render_offline(&mut self, frames: usize) -> StereoBuffer {
        self.device.render_offline(frames)
    }

    // ─────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────

    /// Decode `path` on the calling thread and install it in `id`
    ///
    /// On failure the slot keeps whatever it had.
    pub fn load(&mut self, id: SlotId, path: &Path) -> EngineResult<()> {
        self.store.get(id)?;
        let clip = load_clip(path, self.device.sample_rate()).map_err(|e| {
            log::error!("{}: failed to load {:?}: {}", id, path, e);
            e
        })?;
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        engine.stop_stem_players(&mut ctx, slot);
        player.install(&mut ctx, slot, path.to_path_buf(), clip);
        Ok(())
    }

    /// Decode `path` in the background; the outcome reaches
    /// [`SessionObserver::on_load_complete`] from [`poll`](Self::poll)
    pub fn load_async(&mut self, id: SlotId, path: &Path) -> EngineResult<()> {
        let Parts { player, mut ctx, .. } = self.parts(id)?;
        player.load_async(&mut ctx, path)
    }

    /// Stop and empty a slot. Mix settings are kept.
    pub fn unload(&mut self, id: SlotId) -> EngineResult<()> {
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        engine.stop_stem_players(&mut ctx, slot);
        player.unload(&mut ctx, slot);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    /// Start a slot, or restart it from the top if it is already playing
    ///
    /// Unless `multi_loop` is configured every other active slot is stopped
    /// first. With stems selected the stem engine starts in step with the dry
    /// loop; a retrigger only resets its clock.
    pub fn trigger(&mut self, id: SlotId) -> EngineResult<()> {
        {
            let slot = self.store.get(id)?;
            if !slot.is_loaded() {
                return Err(EngineError::NotLoaded(id));
            }
            if slot.stems.is_generating() {
                return Err(EngineError::StemsGenerating(id));
            }
        }
        if !self.config.multi_loop {
            for other in self.store.active_slots() {
                if other != id {
                    self.stop(other)?;
                }
            }
        }

        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        let stems_wanted = slot.stems.is_available() && (slot.stems.any_on() || engine.is_live());

        if player.is_playing() {
            player.play(&mut ctx, slot, engine.is_live() || stems_wanted)?;
            if stems_wanted {
                engine.restart_phasor(&mut ctx, slot)?;
            }
        } else {
            // Stems only cover the loop window, so an intro would put them out of step
            let intro = if stems_wanted { None } else { slot.armed_intro() };
            player.set_intro_start(intro);
            player.play(&mut ctx, slot, stems_wanted)?;
            if stems_wanted {
                engine.initialize(&mut ctx, slot)?;
            }
        }
        slot.active = true;
        Ok(())
    }

    /// Stop a slot. Safe in any state; stem tables are kept for the next trigger.
    pub fn stop(&mut self, id: SlotId) -> EngineResult<()> {
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        engine.cleanup_stem_players(&mut ctx, slot);
        player.stop(&mut ctx);
        slot.active = false;
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for id in self.store.ids().collect::<Vec<_>>() {
            if let Err(e) = self.stop(id) {
                log::warn!("{}: stop failed: {}", id, e);
            }
        }
    }

    /// Change one slot's speed (clamped to 0.5..=2.0)
    pub fn set_speed(&mut self, id: SlotId, speed: f64) -> EngineResult<()> {
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        player.set_speed(&mut ctx, slot, speed)?;
        engine.set_speed(&mut ctx, slot)
    }

    /// Master tempo: the same speed on every slot. Every slot is attempted;
    /// the first error is returned.
    pub fn set_global_speed(&mut self, speed: f64) -> EngineResult<()> {
        let mut first_error = None;
        for id in self.store.ids().collect::<Vec<_>>() {
            if let Err(e) = self.set_speed(id, speed) {
                log::warn!("{}: speed change failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn set_key_lock(&mut self, id: SlotId, enabled: bool) -> EngineResult<()> {
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        let was_playing = player.is_playing();
        player.set_key_lock(&mut ctx, slot, enabled, engine.is_live())?;
        engine.set_key_lock(&mut ctx, slot)?;
        // The dry loop restarted from the top; keep the stems with it
        if was_playing && engine.is_live() {
            engine.restart_phasor(&mut ctx, slot)?;
        }
        Ok(())
    }

    /// Move the loop window. Invalid bounds are rejected and the old window stays.
    pub fn update_loop_points(&mut self, id: SlotId, start: f64, end: f64) -> EngineResult<()> {
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        player.update_loop_points(&mut ctx, slot, start, end, engine.is_live())?;
        engine.loop_window_changed(&mut ctx, slot)
    }

    /// Store the intro setting used by the next trigger
    pub fn set_intro(&mut self, id: SlotId, intro_start: Option<f64>, enabled: bool) -> EngineResult<()> {
        let slot = self.store.get_mut(id)?;
        let window = slot.window().ok_or(EngineError::NotLoaded(id))?;
        if let Some(start) = intro_start {
            if !(start >= 0.0 && start < window.start()) {
                return Err(EngineError::InvalidIntroStart {
                    start,
                    loop_start: window.start(),
                });
            }
        }
        slot.intro_start = intro_start;
        slot.intro_enabled = enabled;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Mix
    // ─────────────────────────────────────────────────────────────

    /// Knob positions in `-1.0..=1.0`, 0 flat
    pub fn set_eq(&mut self, id: SlotId, low: f32, mid: f32, high: f32) -> EngineResult<()> {
        let Parts {
            slot, player, mut ctx, ..
        } = self.parts(id)?;
        player.set_eq(&mut ctx, slot, EqSettings::new(low, mid, high))
    }

    pub fn set_gain_db(&mut self, id: SlotId, gain_db: f64) -> EngineResult<()> {
        let Parts {
            slot, player, mut ctx, ..
        } = self.parts(id)?;
        player.set_gain_db(&mut ctx, slot, gain_db)
    }

    /// Slot meter in dBFS, floored at -80
    pub fn get_level_db(&mut self, id: SlotId) -> EngineResult<f32> {
        let Parts { player, ctx, .. } = self.parts(id)?;
        Ok(player.level_db(&ctx))
    }

    pub fn set_master_gain_db(&mut self, gain_db: f64) -> EngineResult<()> {
        self.device.set_master_gain_db(gain_db)
    }

    // ─────────────────────────────────────────────────────────────
    // Tempo
    // ─────────────────────────────────────────────────────────────

    pub fn set_bpm(&mut self, id: SlotId, bpm: Option<f64>) -> EngineResult<()> {
        if let Some(value) = bpm {
            if !(value.is_finite() && value > 0.0) {
                return Err(EngineError::InvalidBpm(value));
            }
        }
        self.store.get_mut(id)?.bpm = bpm;
        Ok(())
    }

    /// Run the BPM detector in the background
    pub fn detect_bpm(&mut self, id: SlotId) -> EngineResult<()> {
        let path = self
            .store
            .get(id)?
            .file_path()
            .map(Path::to_path_buf)
            .ok_or(EngineError::NotLoaded(id))?;
        let detector = self
            .detector
            .as_ref()
            .map(Arc::clone)
            .ok_or(EngineError::MissingCollaborator("BPM detector"))?;

        let panic_path = path.clone();
        self.pool.spawn(
            move || {
                let bpm = detector.detect(&path);
                Completion::BpmDetected { slot: id, path, bpm }
            },
            move |message| {
                log::error!("{}: BPM detection panicked: {}", id, message);
                Completion::BpmDetected {
                    slot: id,
                    path: panic_path,
                    bpm: None,
                }
            },
        )
    }

    // ─────────────────────────────────────────────────────────────
    // Stem selection
    // ─────────────────────────────────────────────────────────────

    fn stem_kind(name: &str) -> EngineResult<StemKind> {
        StemKind::from_name(name).ok_or_else(|| EngineError::UnknownStem(name.to_string()))
    }

    /// Change the stem selection with `change`, then make the audio follow
    fn select_stems<T>(&mut self, id: SlotId, change: impl FnOnce(&mut LoopSlot) -> T) -> EngineResult<T> {
        let Parts {
            slot,
            player,
            engine,
            mut ctx,
        } = self.parts(id)?;
        if !slot.stems.is_available() {
            return Err(EngineError::StemsUnavailable(id));
        }
        let result = change(slot);

        if engine.is_live() {
            engine.update_gains(&mut ctx, slot)?;
        } else if player.is_playing() && slot.stems.any_on() {
            // Stems only cover the loop window; skip the intro from now on
            player.set_intro_start(None);
            let estimate = player.wall_clock_phase(slot);
            engine.initialize_while_running(&mut ctx, slot, player.start_id(), estimate)?;
        }
        Ok(result)
    }

    /// Flip one stem (`vocals`, `melody`, `bass`, `drums`, `instrumental`).
    /// Returns its new state.
    pub fn toggle_stem(&mut self, id: SlotId, name: &str) -> EngineResult<bool> {
        let kind = Self::stem_kind(name)?;
        self.select_stems(id, |slot| slot.stems.toggle(kind))
    }

    pub fn momentary_activate(&mut self, id: SlotId, name: &str) -> EngineResult<()> {
        let kind = Self::stem_kind(name)?;
        self.select_stems(id, |slot| slot.stems.momentary_activate(kind))
    }

    pub fn momentary_release(&mut self, id: SlotId, name: &str) -> EngineResult<()> {
        let kind = Self::stem_kind(name)?;
        self.select_stems(id, |slot| slot.stems.momentary_release(kind))
    }

    /// Silence every stem (full mix plays) or restore the previous selection.
    /// Returns whether "stop all" is now engaged.
    pub fn stop_all_stems_toggle(&mut self, id: SlotId) -> EngineResult<bool> {
        self.select_stems(id, |slot| slot.stems.stop_all_toggle())
    }

    pub fn stem_states(&self, id: SlotId) -> EngineResult<StemStates> {
        Ok(self.store.get(id)?.stems.states())
    }

    pub fn stems_available(&self, id: SlotId) -> EngineResult<bool> {
        Ok(self.store.get(id)?.stems.is_available())
    }

    pub fn stems_generating(&self, id: SlotId) -> EngineResult<bool> {
        Ok(self.store.get(id)?.stems.is_generating())
    }

    // ─────────────────────────────────────────────────────────────
    // Stem generation
    // ─────────────────────────────────────────────────────────────

    /// Separate the loaded file into stems in the background
    ///
    /// Refused, with nothing changed, unless the slot is loaded, stopped,
    /// has a BPM, has no stems yet and a separator is configured.
    pub fn generate_stems(&mut self, id: SlotId) -> EngineResult<()> {
        let separator = self.check_separation(id, false)?;
        self.spawn_separation(id, separator)
    }

    /// Drop the current stems and separate again
    pub fn regenerate_stems(&mut self, id: SlotId) -> EngineResult<()> {
        let separator = self.check_separation(id, true)?;
        self.delete_stems(id)?;
        self.spawn_separation(id, separator)
    }

    /// Release the stems and their playback state
    pub fn delete_stems(&mut self, id: SlotId) -> EngineResult<()> {
        let Parts {
            slot,
            engine,
            mut ctx,
            ..
        } = self.parts(id)?;
        engine.stop_stem_players(&mut ctx, slot);
        slot.stems.clear();
        log::info!("{}: stems deleted", id);
        Ok(())
    }

    fn check_separation(&self, id: SlotId, regenerate: bool) -> EngineResult<Arc<dyn StemSeparator>> {
        let slot = self.store.get(id)?;
        let player = self.player(id)?;
        let refuse = |reason| Err(EngineError::SeparationPreconditionViolation { slot: id, reason });

        if !slot.is_loaded() {
            return refuse(SeparationRefusal::NotLoaded);
        }
        if slot.stems.is_generating() {
            return refuse(SeparationRefusal::AlreadyGenerating);
        }
        if !regenerate && slot.stems.is_available() {
            return refuse(SeparationRefusal::StemsAvailable);
        }
        if slot.active || player.is_playing() {
            return refuse(SeparationRefusal::LoopActive);
        }
        if slot.bpm.is_none() {
            return refuse(SeparationRefusal::BpmUnset);
        }
        match &self.separator {
            Some(separator) => Ok(Arc::clone(separator)),
            None => refuse(SeparationRefusal::NoSeparator),
        }
    }

    fn spawn_separation(&mut self, id: SlotId, separator: Arc<dyn StemSeparator>) -> EngineResult<()> {
        let slot = self.store.get_mut(id)?;
        let clip = slot.clip().map(Arc::clone).ok_or(EngineError::NotLoaded(id))?;
        let source = clip.id();
        let sample_rate = clip.sample_rate();

        self.pool.spawn(
            move || Completion::StemsSeparated {
                slot: id,
                source,
                result: separator.separate(&clip).and_then(|stems| stems.complete(sample_rate)),
            },
            move |message| Completion::StemsSeparated {
                slot: id,
                source,
                result: Err(SeparationError::Panicked(message)),
            },
        )?;
        slot.stems.set_generating(true);
        log::info!("{}: separating stems", id);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Completion queue
    // ─────────────────────────────────────────────────────────────

    /// Apply every finished background result. Returns how many were handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(completion) = self.pool.try_recv() {
            self.apply(completion);
            handled += 1;
        }
        handled
    }

    /// Poll until no background job is running, or `timeout` passes.
    /// Returns whether the session went idle.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.pool.in_flight() == 0;
            self.poll();
            if idle && self.pool.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    fn apply(&mut self, completion: Completion) {
        match completion {
            Completion::FileLoaded { slot: id, path, result } => {
                let outcome = match self.parts(id) {
                    Ok(Parts {
                        slot,
                        player,
                        engine,
                        mut ctx,
                    }) => {
                        if result.is_ok() && player.expects_load(&path) {
                            engine.stop_stem_players(&mut ctx, slot);
                        }
                        player.finish_load(&mut ctx, slot, path.clone(), result)
                    }
                    Err(_) => None,
                };
                if let Some(outcome) = outcome {
                    self.observer
                        .on_load_complete(id, outcome.as_ref().map(|_| path.as_path()));
                }
            }
            Completion::LoopPitched {
                slot: id,
                source,
                speed,
                result,
            } => {
                let outcome = match self.parts(id) {
                    Ok(Parts {
                        slot, player, mut ctx, ..
                    }) => player.finish_pitch(&mut ctx, slot, source, speed, result),
                    Err(_) => None,
                };
                if let Some(outcome) = outcome {
                    self.observer.on_pitch_ready(id, speed, outcome.as_ref().map(|_| ()));
                }
            }
            Completion::StemPitched {
                slot: id,
                reader,
                generation,
                speed,
                result,
            } => {
                let outcome = match self.parts(id) {
                    Ok(Parts {
                        slot, engine, mut ctx, ..
                    }) => engine.apply_repitch(&mut ctx, slot, reader, generation, result),
                    Err(_) => None,
                };
                if let Some(outcome) = outcome {
                    self.observer.on_pitch_ready(id, speed, outcome.as_ref().map(|_| ()));
                }
            }
            Completion::BpmDetected { slot: id, path, bpm } => {
                let Ok(slot) = self.store.get_mut(id) else {
                    return;
                };
                if slot.file_path() != Some(path.as_path()) {
                    log::debug!("{}: dropping BPM for {:?}, file changed", id, path);
                    return;
                }
                let bpm = bpm.filter(|b| b.is_finite() && *b > 0.0);
                match bpm {
                    Some(value) => {
                        slot.bpm = Some(value);
                        log::info!("{}: detected {:.2} BPM", id, value);
                    }
                    None => log::warn!("{}: BPM detection failed for {:?}", id, path),
                }
                self.observer.on_bpm_detected(id, bpm);
            }
            Completion::StemsSeparated { slot: id, source, result } => {
                let Ok(slot) = self.store.get_mut(id) else {
                    return;
                };
                let current = slot.stems.is_generating() && slot.clip().is_some_and(|c| c.id() == source);
                if !current {
                    log::debug!("{}: dropping stems for a replaced or deleted request", id);
                    return;
                }
                match &result {
                    Ok(stems) => {
                        slot.stems.populate(stems.clone());
                        log::info!("{}: stems ready", id);
                    }
                    Err(e) => {
                        slot.stems.set_generating(false);
                        log::error!("{}: stem separation failed: {}", id, e);
                    }
                }
                self.observer.on_stems_ready(id, result.as_ref().map(|_| ()));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────

    /// Settings of every loaded slot, without stems
    pub fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot()
    }

    /// Load the files of a snapshot and re-apply their settings
    ///
    /// Slots whose file fails to load are skipped with a warning. Returns how
    /// many slots were restored.
    pub fn restore(&mut self, snapshot: &SessionSnapshot) -> usize {
        let mut restored = 0;
        for config in &snapshot.slots {
            let id = SlotId(config.slot);
            if let Err(e) = self.load(id, &config.file_path) {
                log::warn!("{}: not restored: {}", id, e);
                continue;
            }
            let Ok(Parts {
                slot, player, mut ctx, ..
            }) = self.parts(id)
            else {
                continue;
            };
            if let Err(e) = slot.set_window(config.loop_start, config.loop_end) {
                log::warn!("{}: keeping full-file loop: {}", id, e);
            }
            slot.bpm = config.bpm.filter(|b| b.is_finite() && *b > 0.0);
            slot.intro_start = config.intro_start;
            slot.intro_enabled = config.intro_enabled;
            slot.key_lock = config.key_lock;
            // Mix settings are re-sent so the render graph matches the record
            let mix = player
                .set_gain_db(&mut ctx, slot, config.gain_db)
                .and_then(|()| player.set_eq(&mut ctx, slot, config.eq));
            if let Err(e) = mix {
                log::warn!("{}: mix settings not applied: {}", id, e);
            }
            restored += 1;
        }
        log::info!("Restored {} of {} slots", restored, snapshot.slots.len());
        restored
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    /// Stop every slot, join the worker pool and the collector, close the
    /// device. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.stop_all();
        if !self.pool.shutdown(SHUTDOWN_TIMEOUT) {
            log::warn!("Background jobs still running at shutdown; results dropped");
        }
        self.device.shutdown();
        self.gc.shutdown();
        log::info!("Session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::audio::DeviceState;
    use crate::audio_file::tests::write_sine_wav;
    use crate::audio_file::FileLoadError;
    use crate::dsp::LEVEL_FLOOR_DB;
    use crate::engine::MAIN_READER;
    use crate::error::PitchError;
    use crate::pitch::testing::{BrokenShifter, ScalingShifter};
    use crate::player::{PlayMode, PlayerState};
    use crate::separation::testing::{FakeSeparator, FixedBpm};
    use crate::types::AudioClip;

    const SR: u32 = 44100;
    const WAIT: Duration = Duration::from_secs(20);
    const S0: SlotId = SlotId(0);
    const S1: SlotId = SlotId(1);

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Loaded(SlotId, bool),
        Bpm(SlotId, Option<f64>),
        Stems(SlotId, bool),
        Pitch(SlotId, f64, bool),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl SessionObserver for Recorder {
        fn on_load_complete(&mut self, slot: SlotId, result: Result<&Path, &FileLoadError>) {
            self.push(Event::Loaded(slot, result.is_ok()));
        }

        fn on_bpm_detected(&mut self, slot: SlotId, bpm: Option<f64>) {
            self.push(Event::Bpm(slot, bpm));
        }

        fn on_stems_ready(&mut self, slot: SlotId, result: Result<(), &SeparationError>) {
            self.push(Event::Stems(slot, result.is_ok()));
        }

        fn on_pitch_ready(&mut self, slot: SlotId, speed: f64, result: Result<(), &PitchError>) {
            self.push(Event::Pitch(slot, speed, result.is_ok()));
        }
    }

    struct Fixture {
        session: Session,
        dir: tempfile::TempDir,
        pitch_calls: Arc<AtomicUsize>,
        events: Recorder,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with(Collaborators::default(), test_config())
        }

        /// Scaling shifter and fake separator unless `collaborators` brings its own
        fn with(mut collaborators: Collaborators, config: EngineConfig) -> Self {
            let pitch_calls = Arc::new(AtomicUsize::new(0));
            if collaborators.shifter.is_none() {
                collaborators.shifter = Some(Arc::new(ScalingShifter {
                    calls: Arc::clone(&pitch_calls),
                    delay: None,
                }));
            }
            if collaborators.separator.is_none() {
                collaborators.separator = Some(Arc::new(FakeSeparator::default()));
            }
            let events = Recorder::default();
            let session = Session::offline(
                config,
                SR,
                collaborators.with_observer(Box::new(events.clone())),
            )
            .unwrap();
            Self {
                session,
                dir: tempfile::tempdir().unwrap(),
                pitch_calls,
                events,
            }
        }

        fn wav(&self, name: &str, secs: f64) -> PathBuf {
            let path = self.dir.path().join(name);
            write_sine_wav(&path, secs, SR, 1);
            path
        }

        fn load(&mut self, id: SlotId, secs: f64) -> PathBuf {
            let path = self.wav(&format!("slot{}.wav", id.0), secs);
            self.session.load(id, &path).unwrap();
            path
        }

        fn with_stems(&mut self, id: SlotId) {
            self.session.set_bpm(id, Some(120.0)).unwrap();
            self.session.generate_stems(id).unwrap();
            assert!(self.session.wait_idle(WAIT));
            assert!(self.session.stems_available(id).unwrap());
        }

        /// The loop window of `id` cut from its source, as the readers see it
        fn dry_loop(&self, id: SlotId) -> AudioClip {
            let slot = self.session.slot(id).unwrap();
            let window = slot.window().unwrap();
            slot.clip().unwrap().slice_secs(window.start(), window.end())
        }

        fn current_frames(&self, id: SlotId) -> StereoBuffer {
            self.session.player(id).unwrap().current_clip().unwrap().frames().clone()
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            worker_threads: 2,
            max_slots: 4,
            ..Default::default()
        }
    }

    fn refusal(result: EngineResult<()>) -> SeparationRefusal {
        match result {
            Err(EngineError::SeparationPreconditionViolation { reason, .. }) => reason,
            other => panic!("expected a precondition violation, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut f = Fixture::new();
        f.session.stop(S0).unwrap();
        f.session.stop(S0).unwrap();
        assert_eq!(f.session.player(S0).unwrap().state(), PlayerState::Unloaded);

        f.load(S0, 2.0);
        for _ in 0..3 {
            f.session.stop(S0).unwrap();
            assert_eq!(f.session.player(S0).unwrap().state(), PlayerState::Stopped);
        }

        f.session.trigger(S0).unwrap();
        f.session.stop(S0).unwrap();
        f.session.stop(S0).unwrap();
        assert_eq!(f.session.player(S0).unwrap().state(), PlayerState::Stopped);
        assert!(!f.session.slot(S0).unwrap().active);

        f.with_stems(S0);
        f.session.toggle_stem(S0, "drums").unwrap();
        f.session.trigger(S0).unwrap();
        f.session.stop(S0).unwrap();
        f.session.stop(S0).unwrap();
        assert!(!f.session.stem_engine(S0).unwrap().is_live());
        assert_eq!(f.session.player(S0).unwrap().state(), PlayerState::Stopped);
    }

    #[test]
    fn test_loop_duration_follows_window() {
        let mut f = Fixture::new();
        f.load(S0, 10.0);
        f.session.update_loop_points(S0, 2.0, 6.0).unwrap();
        f.session.set_speed(S0, 1.0).unwrap();
        f.session.trigger(S0).unwrap();

        let slot = f.session.slot(S0).unwrap();
        let player = f.session.player(S0).unwrap();
        assert_eq!(player.mode(), Some(PlayMode::PlainLoop));
        assert!((player.active_loop_duration(slot).unwrap() - 4.0).abs() < 1e-9);

        f.session.set_speed(S0, 2.0).unwrap();
        let slot = f.session.slot(S0).unwrap();
        let player = f.session.player(S0).unwrap();
        assert!((player.active_loop_duration(slot).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_loop_points_keep_previous() {
        let mut f = Fixture::new();
        f.load(S0, 10.0);
        f.session.update_loop_points(S0, 2.0, 6.0).unwrap();
        f.session.trigger(S0).unwrap();

        for (start, end) in [(6.0, 2.0), (3.0, 3.0), (1.0, 10.5)] {
            let err = f.session.update_loop_points(S0, start, end).unwrap_err();
            assert!(matches!(err, EngineError::InvalidLoopBounds { .. }));
        }
        let window = f.session.slot(S0).unwrap().window().unwrap();
        assert_eq!((window.start(), window.end()), (2.0, 6.0));
        assert!(f.session.is_playing(S0).unwrap());
    }

    #[test]
    fn test_intro_plays_before_loop() {
        let mut f = Fixture::new();
        f.load(S0, 10.0);
        f.session.update_loop_points(S0, 2.0, 6.0).unwrap();

        let err = f.session.set_intro(S0, Some(3.0), true).unwrap_err();
        assert!(matches!(err, EngineError::InvalidIntroStart { .. }));

        f.session.set_intro(S0, Some(1.0), true).unwrap();
        f.session.trigger(S0).unwrap();
        let slot = f.session.slot(S0).unwrap();
        let player = f.session.player(S0).unwrap();
        assert_eq!(player.mode(), Some(PlayMode::IntroThenLoop));
        // The intro is not part of the loop length
        assert!((player.active_loop_duration(slot).unwrap() - 4.0).abs() < 1e-9);

        f.session.stop(S0).unwrap();
        assert_eq!(f.session.player(S0).unwrap().intro_start(), None);

        f.session.set_intro(S0, Some(1.0), false).unwrap();
        f.session.trigger(S0).unwrap();
        assert_eq!(f.session.player(S0).unwrap().mode(), Some(PlayMode::PlainLoop));
    }

    #[test]
    fn test_key_lock_reuses_cached_audio() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.session.set_key_lock(S0, true).unwrap();
        f.session.set_speed(S0, 1.25).unwrap();
        f.session.trigger(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));

        assert_eq!(f.pitch_calls.load(Ordering::SeqCst), 1);
        let first = Arc::clone(f.session.player(S0).unwrap().current_clip().unwrap());
        assert_eq!(
            first.frames().as_slice(),
            ScalingShifter::expected(&f.dry_loop(S0), 1.25).as_slice()
        );
        assert_eq!(f.session.player(S0).unwrap().cache().cached_speed(), Some(1.25));

        // Retrigger at the same speed: served from the cache
        f.session.trigger(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));
        let second = f.session.player(S0).unwrap().current_clip().unwrap();
        assert!(Arc::ptr_eq(&first, second));
        assert_eq!(f.pitch_calls.load(Ordering::SeqCst), 1);
        assert!(f.events.events().contains(&Event::Pitch(S0, 1.25, true)));
    }

    #[test]
    fn test_speed_changes_settle_on_last_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shifter = ScalingShifter {
            calls: Arc::clone(&calls),
            delay: Some(Duration::from_millis(20)),
        };
        let mut f = Fixture::with(Collaborators::default().with_shifter(Arc::new(shifter)), test_config());
        f.load(S0, 2.0);
        f.session.set_key_lock(S0, true).unwrap();
        f.session.trigger(S0).unwrap();

        for speed in [1.1, 1.3, 0.8] {
            f.session.set_speed(S0, speed).unwrap();
        }
        assert!(f.session.wait_idle(WAIT));

        assert_eq!(
            f.current_frames(S0).as_slice(),
            ScalingShifter::expected(&f.dry_loop(S0), 0.8).as_slice()
        );
        let player = f.session.player(S0).unwrap();
        assert_eq!(player.cache().cached_speed(), Some(0.8));
        assert!(!player.pitch_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_speed_one_restores_dry_audio() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.session.set_key_lock(S0, true).unwrap();
        f.session.set_speed(S0, 1.5).unwrap();
        f.session.trigger(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));

        f.session.set_speed(S0, 1.0).unwrap();
        assert_eq!(f.current_frames(S0).as_slice(), f.dry_loop(S0).frames().as_slice());
    }

    #[test]
    fn test_pitch_failure_plays_dry() {
        let mut f = Fixture::with(Collaborators::default().with_shifter(Arc::new(BrokenShifter)), test_config());
        f.load(S0, 2.0);
        f.session.set_key_lock(S0, true).unwrap();
        f.session.set_speed(S0, 1.5).unwrap();
        f.session.trigger(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));

        assert!(f.session.is_playing(S0).unwrap());
        assert_eq!(f.current_frames(S0).as_slice(), f.dry_loop(S0).frames().as_slice());
        assert!(f.events.events().contains(&Event::Pitch(S0, 1.5, false)));
    }

    #[test]
    fn test_separation_refused_with_stems_present() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);

        let stopped = refusal(f.session.generate_stems(S0));
        f.session.trigger(S0).unwrap();
        let playing = refusal(f.session.generate_stems(S0));
        assert_eq!(stopped, playing);
        assert!(!f.session.stems_generating(S0).unwrap());
    }

    #[test]
    fn test_separation_preconditions() {
        let mut f = Fixture::with(Collaborators::default(), test_config());
        assert_eq!(refusal(f.session.generate_stems(S0)), SeparationRefusal::NotLoaded);

        f.load(S0, 2.0);
        assert_eq!(refusal(f.session.generate_stems(S0)), SeparationRefusal::BpmUnset);

        f.session.set_bpm(S0, Some(128.0)).unwrap();
        f.session.trigger(S0).unwrap();
        assert_eq!(refusal(f.session.generate_stems(S0)), SeparationRefusal::LoopActive);
        assert!(!f.session.stems_generating(S0).unwrap());

        f.session.stop(S0).unwrap();
        f.session.generate_stems(S0).unwrap();
        assert_eq!(refusal(f.session.generate_stems(S0)), SeparationRefusal::AlreadyGenerating);
        assert!(f.session.wait_idle(WAIT));
        assert!(f.events.events().contains(&Event::Stems(S0, true)));
        assert_eq!(f.session.stem_states(S0).unwrap(), [false; 5]);
    }

    #[test]
    fn test_separation_needs_a_separator() {
        let mut f = Fixture::new();
        f.session.separator = None;
        f.load(S0, 2.0);
        f.session.set_bpm(S0, Some(100.0)).unwrap();
        assert_eq!(refusal(f.session.generate_stems(S0)), SeparationRefusal::NoSeparator);
    }

    #[test]
    fn test_separation_failure_is_reported() {
        let separator = FakeSeparator {
            fail: true,
            ..Default::default()
        };
        let mut f = Fixture::with(Collaborators::default().with_separator(Arc::new(separator)), test_config());
        f.load(S0, 2.0);
        f.session.set_bpm(S0, Some(120.0)).unwrap();
        f.session.generate_stems(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));

        assert!(f.events.events().contains(&Event::Stems(S0, false)));
        assert!(!f.session.stems_available(S0).unwrap());
        assert!(!f.session.stems_generating(S0).unwrap());
    }

    #[test]
    fn test_trigger_refused_while_generating() {
        let separator = FakeSeparator {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let mut f = Fixture::with(Collaborators::default().with_separator(Arc::new(separator)), test_config());
        f.load(S0, 2.0);
        f.session.set_bpm(S0, Some(120.0)).unwrap();
        f.session.generate_stems(S0).unwrap();

        assert!(matches!(f.session.trigger(S0), Err(EngineError::StemsGenerating(S0))));
        assert!(f.session.wait_idle(WAIT));
        f.session.trigger(S0).unwrap();
    }

    #[test]
    fn test_deleted_stems_ignore_late_result() {
        let separator = FakeSeparator {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut f = Fixture::with(Collaborators::default().with_separator(Arc::new(separator)), test_config());
        f.load(S0, 2.0);
        f.session.set_bpm(S0, Some(120.0)).unwrap();
        f.session.generate_stems(S0).unwrap();
        f.session.delete_stems(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));

        assert!(!f.session.stems_available(S0).unwrap());
        assert!(f.events.events().iter().all(|e| !matches!(e, Event::Stems(..))));
    }

    #[test]
    fn test_fast_retrigger_keeps_tables() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);
        f.session.toggle_stem(S0, "vocals").unwrap();
        f.session.trigger(S0).unwrap();

        let engine = f.session.stem_engine(S0).unwrap();
        assert!(engine.is_live());
        let versions = engine.table_versions().unwrap();
        assert!(versions.iter().all(Option::is_some));

        f.session.trigger(S0).unwrap();
        assert_eq!(f.session.stem_engine(S0).unwrap().table_versions().unwrap(), versions);

        // Stopping keeps the tables for the next trigger
        f.session.stop(S0).unwrap();
        f.session.trigger(S0).unwrap();
        assert_eq!(f.session.stem_engine(S0).unwrap().table_versions().unwrap(), versions);

        f.session.delete_stems(S0).unwrap();
        assert!(f.session.stem_engine(S0).unwrap().table_versions().is_none());
        assert!(!f.session.stem_engine(S0).unwrap().is_live());
    }

    #[test]
    fn test_instrumental_exclusivity() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        assert!(matches!(
            f.session.toggle_stem(S0, "vocals"),
            Err(EngineError::StemsUnavailable(S0))
        ));
        f.with_stems(S0);

        f.session.toggle_stem(S0, "drums").unwrap();
        f.session.toggle_stem(S0, "vocals").unwrap();
        assert!(f.session.toggle_stem(S0, "instrumental").unwrap());
        assert_eq!(f.session.stem_states(S0).unwrap(), [false, false, false, false, true]);

        assert!(f.session.toggle_stem(S0, "bass").unwrap());
        assert_eq!(f.session.stem_states(S0).unwrap(), [false, false, true, false, false]);

        assert!(matches!(
            f.session.toggle_stem(S0, "kazoo"),
            Err(EngineError::UnknownStem(_))
        ));
    }

    #[test]
    fn test_stems_join_a_playing_loop() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);
        f.session.trigger(S0).unwrap();
        f.session.render_offline(4096);
        assert!(!f.session.stem_engine(S0).unwrap().is_live());

        f.session.toggle_stem(S0, "drums").unwrap();
        assert!(f.session.stem_engine(S0).unwrap().is_live());
        f.session.render_offline(4096);

        // Everything off: the engine keeps running on the full mix
        f.session.toggle_stem(S0, "drums").unwrap();
        assert!(f.session.stem_engine(S0).unwrap().is_live());

        f.session.toggle_stem(S0, "vocals").unwrap();
        assert!(f.session.stop_all_stems_toggle(S0).unwrap());
        assert_eq!(f.session.stem_states(S0).unwrap(), [false; 5]);
        assert!(!f.session.stop_all_stems_toggle(S0).unwrap());
        assert_eq!(f.session.stem_states(S0).unwrap(), [true, false, false, false, false]);

        f.session.momentary_activate(S0, "bass").unwrap();
        assert_eq!(f.session.stem_states(S0).unwrap(), [true, false, true, false, false]);
        f.session.momentary_release(S0, "bass").unwrap();
        assert_eq!(f.session.stem_states(S0).unwrap(), [true, false, false, false, false]);
    }

    #[test]
    fn test_stems_joining_a_retrigger_lock_to_the_new_start() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);
        f.session.trigger(S0).unwrap();
        f.session.render_offline(SR as usize);

        // The restart is queued but not rendered when the stems join
        f.session.trigger(S0).unwrap();
        f.session.toggle_stem(S0, "drums").unwrap();
        f.session.render_offline(512);

        let start_id = f.session.player(S0).unwrap().start_id();
        let atomics = f.session.device().slot_atomics(S0.0).unwrap();
        let dry = atomics.dry_loop_phase(start_id).unwrap();
        let clock = atomics.phase();
        assert!(dry < 0.01, "dry phase {dry:.4}");
        assert!((clock - dry).abs() < 0.01, "dry phase {dry:.4} stem clock phase {clock:.4}");
    }

    #[test]
    fn test_speed_change_retunes_stem_clock() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);
        f.session.toggle_stem(S0, "drums").unwrap();
        f.session.trigger(S0).unwrap();
        let loop_secs = f.session.slot(S0).unwrap().window().unwrap().duration();
        let frequency = f.session.stem_engine(S0).unwrap().frequency();
        assert!((frequency - 1.0 / loop_secs).abs() < 1e-9);

        f.session.set_speed(S0, 1.5).unwrap();
        let expected = 1.5 / loop_secs;
        let frequency = f.session.stem_engine(S0).unwrap().frequency();
        assert!((frequency - expected).abs() < 1e-9, "clock at {frequency} Hz");

        let chunk = 4410;
        let step = chunk as f64 / SR as f64 * expected;
        f.session.render_offline(512);
        let before = f.session.device().slot_atomics(S0.0).unwrap().phase();
        f.session.render_offline(chunk);
        let after = f.session.device().slot_atomics(S0.0).unwrap().phase();
        assert!(((after - before).rem_euclid(1.0) - step).abs() < 1e-6);

        // Retrigger restarts the clock at the retuned rate
        f.session.trigger(S0).unwrap();
        let frequency = f.session.stem_engine(S0).unwrap().frequency();
        assert!((frequency - expected).abs() < 1e-9);
        f.session.render_offline(chunk);
        let phase = f.session.device().slot_atomics(S0.0).unwrap().phase();
        assert!((phase - step).abs() < 1e-6, "phase {phase}");
    }

    #[test]
    fn test_overlapping_momentary_holds() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);
        f.session.trigger(S0).unwrap();

        f.session.momentary_activate(S0, "vocals").unwrap();
        f.session.momentary_activate(S0, "drums").unwrap();
        f.session.momentary_release(S0, "vocals").unwrap();
        assert_eq!(f.session.stem_states(S0).unwrap(), [false, false, false, true, false]);
        f.session.momentary_release(S0, "drums").unwrap();
        assert_eq!(f.session.stem_states(S0).unwrap(), [false; 5]);
    }

    #[test]
    fn test_stem_repitch_applies_last_speed_only() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        f.with_stems(S0);
        f.session.set_key_lock(S0, true).unwrap();
        f.session.toggle_stem(S0, "drums").unwrap();
        f.session.trigger(S0).unwrap();

        f.session.set_speed(S0, 1.2).unwrap();
        f.session.set_speed(S0, 1.4).unwrap();
        assert!(f.session.stem_engine(S0).unwrap().repitch_pending());
        assert!(f.session.wait_idle(WAIT));

        let engine = f.session.stem_engine(S0).unwrap();
        assert!(!engine.repitch_pending());
        assert_eq!(engine.pitched_speed(), Some(1.4));
        let main = engine.reader_clip(MAIN_READER).unwrap();
        assert_eq!(
            main.frames().as_slice(),
            ScalingShifter::expected(&f.dry_loop(S0), 1.4).as_slice()
        );
        assert_eq!(f.session.slot(S0).unwrap().stems.cached_speed(), Some(1.4));
    }

    #[test]
    fn test_load_async_keeps_latest_request() {
        let mut f = Fixture::new();
        let first = f.wav("first.wav", 1.0);
        let second = f.wav("second.wav", 1.5);
        f.session.load_async(S0, &first).unwrap();
        f.session.load_async(S0, &second).unwrap();
        assert!(f.session.wait_idle(WAIT));

        let slot = f.session.slot(S0).unwrap();
        assert_eq!(slot.file_path(), Some(second.as_path()));
        assert_eq!(f.events.events(), vec![Event::Loaded(S0, true)]);
        assert_eq!(f.session.player(S0).unwrap().state(), PlayerState::Stopped);
    }

    #[test]
    fn test_failed_loads() {
        let mut f = Fixture::new();
        let missing = f.dir.path().join("missing.wav");
        assert!(matches!(f.session.load(S0, &missing), Err(EngineError::FileLoad(_))));
        assert!(!f.session.slot(S0).unwrap().is_loaded());

        f.session.load_async(S1, &missing).unwrap();
        assert!(f.session.wait_idle(WAIT));
        assert_eq!(f.events.events(), vec![Event::Loaded(S1, false)]);
        assert_eq!(f.session.player(S1).unwrap().state(), PlayerState::Unloaded);
        assert!(matches!(f.session.trigger(S1), Err(EngineError::NotLoaded(S1))));
    }

    #[test]
    fn test_level_meter() {
        let mut f = Fixture::new();
        f.load(S0, 2.0);
        assert_eq!(f.session.get_level_db(S0).unwrap(), LEVEL_FLOOR_DB);

        f.session.trigger(S0).unwrap();
        f.session.render_offline(8192);
        let level = f.session.get_level_db(S0).unwrap();
        assert!(level > -20.0, "level {}", level);

        f.session.stop(S0).unwrap();
        assert_eq!(f.session.get_level_db(S0).unwrap(), LEVEL_FLOOR_DB);
    }

    #[test]
    fn test_trigger_stops_other_slots() {
        let mut f = Fixture::new();
        f.load(S0, 1.0);
        f.load(S1, 1.0);
        f.session.trigger(S0).unwrap();
        f.session.trigger(S1).unwrap();
        assert!(!f.session.is_playing(S0).unwrap());
        assert!(f.session.is_playing(S1).unwrap());

        let config = EngineConfig {
            multi_loop: true,
            ..test_config()
        };
        let mut f = Fixture::with(Collaborators::default(), config);
        f.load(S0, 1.0);
        f.load(S1, 1.0);
        f.session.trigger(S0).unwrap();
        f.session.trigger(S1).unwrap();
        assert!(f.session.is_playing(S0).unwrap());
        assert!(f.session.is_playing(S1).unwrap());
    }

    #[test]
    fn test_global_speed_is_clamped() {
        let mut f = Fixture::new();
        f.load(S0, 1.0);
        f.load(S1, 1.0);
        f.session.set_global_speed(3.0).unwrap();
        assert_eq!(f.session.slot(S0).unwrap().speed, 2.0);
        assert_eq!(f.session.slot(S1).unwrap().speed, 2.0);
        // Empty slots follow too
        assert_eq!(f.session.slot(SlotId(3)).unwrap().speed, 2.0);
    }

    #[test]
    fn test_detect_bpm() {
        let collaborators = Collaborators::default().with_detector(Arc::new(FixedBpm(Some(124.0))));
        let mut f = Fixture::with(collaborators, test_config());
        assert!(matches!(f.session.detect_bpm(S0), Err(EngineError::NotLoaded(S0))));

        f.load(S0, 1.0);
        f.session.detect_bpm(S0).unwrap();
        assert!(f.session.wait_idle(WAIT));
        assert_eq!(f.session.slot(S0).unwrap().bpm, Some(124.0));
        assert_eq!(f.events.events(), vec![Event::Bpm(S0, Some(124.0))]);

        let mut f = Fixture::new();
        f.load(S0, 1.0);
        assert!(matches!(
            f.session.detect_bpm(S0),
            Err(EngineError::MissingCollaborator(_))
        ));
        assert!(matches!(
            f.session.set_bpm(S0, Some(-3.0)),
            Err(EngineError::InvalidBpm(_))
        ));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut f = Fixture::new();
        let path = f.load(S1, 4.0);
        f.session.update_loop_points(S1, 1.0, 3.0).unwrap();
        f.session.set_intro(S1, Some(0.5), true).unwrap();
        f.session.set_bpm(S1, Some(96.0)).unwrap();
        f.session.set_gain_db(S1, -6.0).unwrap();
        f.session.set_eq(S1, 0.5, 0.0, -1.0).unwrap();
        f.session.set_key_lock(S1, true).unwrap();
        f.with_stems(S1);

        let snapshot = f.session.snapshot();
        assert_eq!(snapshot.slots.len(), 1);
        let yaml = serde_yaml::to_string(&snapshot).unwrap();
        assert!(!yaml.contains("stem"));
        let parsed: SessionSnapshot = serde_yaml::from_str(&yaml).unwrap();

        let mut restored = Fixture::new();
        assert_eq!(restored.session.restore(&parsed), 1);
        assert_eq!(restored.session.snapshot(), snapshot);
        let slot = restored.session.slot(S1).unwrap();
        assert_eq!(slot.file_path(), Some(path.as_path()));
        assert!(!slot.stems.is_available());
    }

    #[test]
    fn test_unload_keeps_mix_settings() {
        let mut f = Fixture::new();
        f.load(S0, 1.0);
        f.session.set_gain_db(S0, -3.0).unwrap();
        f.session.trigger(S0).unwrap();
        f.session.unload(S0).unwrap();

        assert_eq!(f.session.player(S0).unwrap().state(), PlayerState::Unloaded);
        let slot = f.session.slot(S0).unwrap();
        assert!(!slot.is_loaded());
        assert_eq!(slot.gain_db, -3.0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut f = Fixture::new();
        f.load(S0, 1.0);
        f.session.trigger(S0).unwrap();
        f.session.shutdown();
        f.session.shutdown();
        assert_eq!(f.session.device().state(), DeviceState::ShutDown);
        assert!(!f.session.is_playing(S0).unwrap());
        assert!(matches!(f.session.stop(SlotId(99)), Err(EngineError::UnknownSlot(99))));
    }
}
