//! The audio-thread side of the engine
//!
//! One [`Renderer`] lives inside the audio callback. Per slot it runs up to
//! two voices:
//!
//! ```text
//! dry:   LoopReader ─► EQ ─► slot gain ─► × stem mute ────────────────┐
//!                                                                      ├─► master gain ─► out
//! stems: PhaseClock ─► 6 × TableReader (ramped gains) ─► EQ ─► slot gain ─┘
//! ```
//!
//! The slot meter taps the stem bus while stems are live, the dry voice
//! otherwise.
//!
//! The dry voice keeps running while stems play (silenced through the mute
//! multiplier) so its position and loop count stay correct.
//!
//! Nothing here allocates or locks. Voice storage is preallocated per slot at
//! construction; tables arrive as `Shared` handles and are released through
//! the collector.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::dsp::{GainRamp, DEFAULT_RAMP_MS};
use crate::eq::ThreeBandEq;
use crate::types::StereoSample;

use super::atomics::{LevelMeter, SlotAtomics};
use super::command::{GraphCommand, LoopStart, StemStart};
use super::reader::{LoopReader, PhaseClock, TableReader};
use super::table::{TableRef, NUM_READERS};

struct DryVoice {
    reader: LoopReader,
    mute: GainRamp,
    start_id: u64,
}

struct StemVoice {
    clock: PhaseClock,
    readers: [Option<TableReader>; NUM_READERS],
}

/// Everything a slot renders
struct SlotVoice {
    dry: Option<DryVoice>,
    stems: Option<StemVoice>,
    gain: GainRamp,
    dry_eq: ThreeBandEq,
    stem_eq: ThreeBandEq,
    meter: LevelMeter,
}

impl SlotVoice {
    fn new(sample_rate: u32, ramp_ms: f32) -> Self {
        Self {
            dry: None,
            stems: None,
            gain: GainRamp::new(1.0, ramp_ms, sample_rate),
            dry_eq: ThreeBandEq::new(sample_rate),
            stem_eq: ThreeBandEq::new(sample_rate),
            meter: LevelMeter::new(sample_rate),
        }
    }

    fn is_idle(&self) -> bool {
        self.dry.is_none() && self.stems.is_none()
    }
}

/// Realtime mixer for every slot
pub struct Renderer {
    sample_rate: u32,
    ramp_ms: f32,
    slots: Vec<SlotVoice>,
    atomics: Arc<[SlotAtomics]>,
    master: GainRamp,
}

impl Renderer {
    pub fn new(sample_rate: u32, max_slots: usize) -> Self {
        Self::with_ramp(sample_rate, max_slots, DEFAULT_RAMP_MS)
    }

    /// Renderer whose gain changes ramp over `ramp_ms`
    pub fn with_ramp(sample_rate: u32, max_slots: usize, ramp_ms: f32) -> Self {
        let slots = (0..max_slots).map(|_| SlotVoice::new(sample_rate, ramp_ms)).collect();
        let atomics: Arc<[SlotAtomics]> = (0..max_slots).map(|_| SlotAtomics::new()).collect();
        Self {
            sample_rate,
            ramp_ms,
            slots,
            atomics,
            master: GainRamp::new(1.0, ramp_ms, sample_rate),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Shared atomics, one per slot
    pub fn atomics(&self) -> Arc<[SlotAtomics]> {
        Arc::clone(&self.atomics)
    }

    /// Drain and apply all pending commands
    pub fn process_commands(&mut self, rx: &mut rtrb::Consumer<GraphCommand>) {
        while let Ok(cmd) = rx.pop() {
            self.apply(cmd);
        }
    }

    /// Apply one command. Commands for unknown slots are ignored.
    pub fn apply(&mut self, cmd: GraphCommand) {
        match cmd {
            GraphCommand::StartLoop(start) => self.start_loop(*start),
            GraphCommand::SwapLoopTable { slot, table, loop_offset } => {
                if let Some(dry) = self.slot_mut(slot).and_then(|s| s.dry.as_mut()) {
                    let _old: TableRef = dry.reader.swap_table(table, loop_offset);
                }
            }
            GraphCommand::SetLoopRate { slot, rate } => {
                if let Some(dry) = self.slot_mut(slot).and_then(|s| s.dry.as_mut()) {
                    dry.reader.set_rate(rate);
                }
            }
            GraphCommand::SetLoopMute { slot, muted } => {
                if let Some(dry) = self.slot_mut(slot).and_then(|s| s.dry.as_mut()) {
                    dry.mute.set_target(if muted { 0.0 } else { 1.0 });
                }
            }
            GraphCommand::StopLoop { slot } => {
                if let Some(voice) = self.slot_mut(slot) {
                    voice.dry = None;
                    voice.dry_eq.reset();
                    voice.meter.reset();
                }
            }
            GraphCommand::SetSlotGain { slot, gain } => {
                if let Some(voice) = self.slot_mut(slot) {
                    if voice.is_idle() {
                        voice.gain.snap(gain);
                    } else {
                        voice.gain.set_target(gain);
                    }
                }
            }
            GraphCommand::SetSlotEq { slot, eq } => {
                if let Some(voice) = self.slot_mut(slot) {
                    voice.dry_eq.set(eq);
                    voice.stem_eq.set(eq);
                }
            }
            GraphCommand::StartStems(start) => self.start_stems(*start),
            GraphCommand::SwapStemTable { slot, reader, table } => {
                let (sample_rate, ramp_ms) = (self.sample_rate, self.ramp_ms);
                if let Some(stems) = self.slot_mut(slot).and_then(|s| s.stems.as_mut()) {
                    if let Some(entry) = stems.readers.get_mut(reader) {
                        match entry {
                            Some(r) => {
                                let _old: TableRef = r.swap_table(table);
                            }
                            None => {
                                *entry = Some(TableReader::new(table, GainRamp::new(0.0, ramp_ms, sample_rate)));
                            }
                        }
                    }
                }
            }
            GraphCommand::SetStemGains { slot, gains } => {
                if let Some(stems) = self.slot_mut(slot).and_then(|s| s.stems.as_mut()) {
                    for (reader, gain) in stems.readers.iter_mut().zip(gains) {
                        if let Some(r) = reader {
                            r.gain_mut().set_target(gain);
                        }
                    }
                }
            }
            GraphCommand::SetClockFrequency { slot, frequency } => {
                if let Some(stems) = self.slot_mut(slot).and_then(|s| s.stems.as_mut()) {
                    stems.clock.set_frequency(frequency);
                }
            }
            GraphCommand::ResetClock { slot, phase } => {
                if let Some(stems) = self.slot_mut(slot).and_then(|s| s.stems.as_mut()) {
                    stems.clock.reset(phase);
                }
            }
            GraphCommand::StopStems { slot } => {
                if let Some(voice) = self.slot_mut(slot) {
                    voice.stems = None;
                    voice.stem_eq.reset();
                }
            }
            GraphCommand::SetMasterGain { gain } => self.master.set_target(gain),
            GraphCommand::StopAll => {
                for voice in &mut self.slots {
                    voice.dry = None;
                    voice.stems = None;
                    voice.meter.reset();
                }
            }
        }
    }

    fn slot_mut(&mut self, slot: usize) -> Option<&mut SlotVoice> {
        self.slots.get_mut(slot)
    }

    fn start_loop(&mut self, start: LoopStart) {
        let (sample_rate, ramp_ms) = (self.sample_rate, self.ramp_ms);
        let Some(voice) = self.slot_mut(start.slot) else {
            return;
        };
        let mut mute = GainRamp::new(1.0, ramp_ms, sample_rate);
        if start.muted {
            mute.snap(0.0);
        }
        if voice.stems.is_none() {
            voice.gain.snap(start.gain);
        } else {
            voice.gain.set_target(start.gain);
        }
        voice.dry_eq.reset();
        voice.dry_eq.set(start.eq);
        voice.stem_eq.set(start.eq);
        voice.meter.reset();
        voice.dry = Some(DryVoice {
            reader: LoopReader::new(start.table, start.loop_offset, start.rate),
            mute,
            start_id: start.start_id,
        });
    }

    fn start_stems(&mut self, start: StemStart) {
        let (sample_rate, ramp_ms) = (self.sample_rate, self.ramp_ms);
        let Some(voice) = self.slot_mut(start.slot) else {
            return;
        };
        let mut clock = PhaseClock::new(start.frequency, sample_rate);
        clock.reset(start.phase);

        let StemStart { tables, gains, .. } = start;
        let mut readers: [Option<TableReader>; NUM_READERS] = Default::default();
        for (i, table) in tables.into_iter().enumerate() {
            if let Some(table) = table {
                // Fade in from silence so engaging stems never clicks
                let mut gain = GainRamp::new(0.0, ramp_ms, sample_rate);
                gain.set_target(gains[i]);
                readers[i] = Some(TableReader::new(table, gain));
            }
        }

        if voice.dry.is_none() {
            voice.gain.snap(start.gain);
        } else {
            voice.gain.set_target(start.gain);
        }
        voice.stem_eq.reset();
        voice.stem_eq.set(start.eq);
        voice.meter.reset();
        voice.stems = Some(StemVoice { clock, readers });
    }

    /// Render one buffer, overwriting `out`
    pub fn render(&mut self, out: &mut [StereoSample]) {
        out.fill(StereoSample::silence());

        for (voice, atomics) in self.slots.iter_mut().zip(self.atomics.iter()) {
            if voice.is_idle() {
                if atomics.is_playing() || atomics.stems_live() {
                    atomics.clear();
                }
                continue;
            }

            for frame in out.iter_mut() {
                let gain = voice.gain.next();
                if let Some(dry) = voice.dry.as_mut() {
                    let s = voice.dry_eq.process(dry.reader.next()) * gain;
                    // Muted under live stems; the stem bus is what is heard
                    if voice.stems.is_none() {
                        voice.meter.feed(s);
                    }
                    *frame += s * dry.mute.next();
                }
                if let Some(stems) = voice.stems.as_mut() {
                    let phase = stems.clock.tick();
                    let mut mix = StereoSample::silence();
                    for reader in stems.readers.iter_mut().flatten() {
                        mix += reader.read(phase);
                    }
                    let s = voice.stem_eq.process(mix) * gain;
                    voice.meter.feed(s);
                    *frame += s;
                }
            }

            match voice.dry.as_ref() {
                Some(dry) => {
                    atomics.playing.store(true, Ordering::Relaxed);
                    atomics.set_position(dry.reader.position());
                    atomics.loop_offset.store(dry.reader.loop_offset() as u64, Ordering::Relaxed);
                    atomics.table_len.store(dry.reader.table().len() as u64, Ordering::Relaxed);
                    atomics.loops_completed.store(dry.reader.loops_completed(), Ordering::Relaxed);
                    atomics.loop_start_id.store(dry.start_id, Ordering::Relaxed);
                }
                None => atomics.playing.store(false, Ordering::Relaxed),
            }
            atomics.set_level_db(voice.meter.level_db());
            match voice.stems.as_ref() {
                Some(stems) => {
                    atomics.stems_live.store(true, Ordering::Relaxed);
                    atomics.set_phase(stems.clock.phase());
                }
                None => atomics.stems_live.store(false, Ordering::Relaxed),
            }
        }

        for frame in out.iter_mut() {
            *frame = *frame * self.master.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use basedrop::Collector;

    use super::*;
    use crate::engine::table::{stem_reader, SampleTable, MAIN_READER};
    use crate::eq::EqSettings;
    use crate::types::{AudioClip, StemKind, StereoBuffer};

    const SR: u32 = 1000;

    fn dc_table(collector: &Collector, value: f32, len: usize) -> TableRef {
        let clip = AudioClip::new(StereoBuffer::from_mono(&vec![value; len]), SR, 1);
        SampleTable::shared(&collector.handle(), Arc::new(clip))
    }

    fn start_loop(r: &mut Renderer, table: TableRef, muted: bool) {
        r.apply(GraphCommand::StartLoop(Box::new(LoopStart {
            slot: 0,
            table,
            loop_offset: 0,
            rate: 1.0,
            gain: 1.0,
            eq: EqSettings::default(),
            muted,
            start_id: 1,
        })));
    }

    fn render(r: &mut Renderer, frames: usize) -> Vec<StereoSample> {
        let mut out = vec![StereoSample::silence(); frames];
        r.render(&mut out);
        out
    }

    #[test]
    fn test_dry_loop_plays_and_publishes_state() {
        let collector = Collector::new();
        let mut r = Renderer::new(SR, 2);
        let atomics = r.atomics();
        start_loop(&mut r, dc_table(&collector, 0.5, 100), false);

        let out = render(&mut r, 250);
        assert!(out.iter().all(|s| (s.left - 0.5).abs() < 1e-6));
        assert!(atomics[0].is_playing());
        assert_eq!(atomics[0].loops_completed.load(Ordering::Relaxed), 2);
        assert!((atomics[0].position() - 50.0).abs() < 1e-9);
        assert!(atomics[0].level_db() > -7.0);
        assert!(!atomics[1].is_playing());

        r.apply(GraphCommand::StopLoop { slot: 0 });
        r.apply(GraphCommand::StopLoop { slot: 0 });
        let out = render(&mut r, 10);
        assert!(out.iter().all(|s| *s == StereoSample::silence()));
        assert!(!atomics[0].is_playing());
    }

    #[test]
    fn test_muted_dry_keeps_running() {
        let collector = Collector::new();
        let mut r = Renderer::new(SR, 1);
        let atomics = r.atomics();
        start_loop(&mut r, dc_table(&collector, 0.5, 100), true);

        let out = render(&mut r, 150);
        assert!(out.iter().all(|s| s.left == 0.0));
        assert_eq!(atomics[0].loops_completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stems_follow_gains() {
        let collector = Collector::new();
        let mut r = Renderer::new(SR, 1);

        let mut tables: crate::engine::ReaderTables = Default::default();
        tables[MAIN_READER] = Some(dc_table(&collector, 1.0, 100));
        tables[stem_reader(StemKind::Vocals)] = Some(dc_table(&collector, 0.25, 100));
        let mut gains = [0.0; NUM_READERS];
        gains[stem_reader(StemKind::Vocals)] = 1.0;

        r.apply(GraphCommand::StartStems(Box::new(StemStart {
            slot: 0,
            tables,
            phase: 0.0,
            frequency: 10.0,
            gains,
            gain: 1.0,
            eq: EqSettings::default(),
        })));

        // 15 ms ramp at 1 kHz is 15 frames
        let out = render(&mut r, 50);
        assert!(out[0].left < 0.25);
        assert!((out[40].left - 0.25).abs() < 1e-6);

        // Swap to the full mix
        let mut gains = [0.0; NUM_READERS];
        gains[MAIN_READER] = 1.0;
        r.apply(GraphCommand::SetStemGains { slot: 0, gains });
        let out = render(&mut r, 50);
        assert!((out[40].left - 1.0).abs() < 1e-6);
        assert!(r.atomics()[0].stems_live());
    }

    #[test]
    fn test_meter_follows_stem_bus() {
        let collector = Collector::new();
        let mut r = Renderer::new(SR, 1);
        let atomics = r.atomics();
        start_loop(&mut r, dc_table(&collector, 1.0, 100), false);
        render(&mut r, 20);
        assert!(atomics[0].level_db().abs() < 0.1);

        // Solo a quiet vocal: the dry voice is muted and must not be metered
        let mut tables: crate::engine::ReaderTables = Default::default();
        tables[MAIN_READER] = Some(dc_table(&collector, 1.0, 100));
        tables[stem_reader(StemKind::Vocals)] = Some(dc_table(&collector, 0.25, 100));
        let mut gains = [0.0; NUM_READERS];
        gains[stem_reader(StemKind::Vocals)] = 1.0;
        r.apply(GraphCommand::StartStems(Box::new(StemStart {
            slot: 0,
            tables,
            phase: 0.0,
            frequency: 10.0,
            gains,
            gain: 1.0,
            eq: EqSettings::default(),
        })));
        r.apply(GraphCommand::SetLoopMute { slot: 0, muted: true });
        let out = render(&mut r, 50);
        assert!((out[40].left - 0.25).abs() < 1e-6);
        let level = atomics[0].level_db();
        assert!((level - (-12.04)).abs() < 0.2, "level {level}");

        // Back to the dry voice
        r.apply(GraphCommand::StopStems { slot: 0 });
        r.apply(GraphCommand::SetLoopMute { slot: 0, muted: false });
        render(&mut r, 20);
        assert!(atomics[0].level_db().abs() < 0.1);
    }

    #[test]
    fn test_clock_reset_and_master_gain() {
        let collector = Collector::new();
        let mut r = Renderer::new(SR, 1);
        let mono: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let clip = AudioClip::new(StereoBuffer::from_mono(&mono), SR, 1);
        let mut tables: crate::engine::ReaderTables = Default::default();
        tables[MAIN_READER] = Some(SampleTable::shared(&collector.handle(), Arc::new(clip)));
        let mut gains = [0.0; NUM_READERS];
        gains[MAIN_READER] = 1.0;

        r.apply(GraphCommand::StartStems(Box::new(StemStart {
            slot: 0,
            tables,
            phase: 0.0,
            frequency: 10.0,
            gains,
            gain: 1.0,
            eq: EqSettings::default(),
        })));
        render(&mut r, 30);
        r.apply(GraphCommand::ResetClock { slot: 0, phase: 0.5 });
        let out = render(&mut r, 1);
        assert!((out[0].left - 50.0).abs() < 1e-4);

        r.apply(GraphCommand::SetMasterGain { gain: 0.0 });
        let out = render(&mut r, 40);
        assert_eq!(out[39].left, 0.0);
    }

    #[test]
    fn test_unknown_slot_is_ignored() {
        let collector = Collector::new();
        let mut r = Renderer::new(SR, 1);
        r.apply(GraphCommand::SwapLoopTable {
            slot: 9,
            table: dc_table(&collector, 1.0, 10),
            loop_offset: 0,
        });
        r.apply(GraphCommand::StopStems { slot: 9 });
        let out = render(&mut r, 4);
        assert!(out.iter().all(|s| s.left == 0.0));
    }
}
