//! Sample readers and the master phase clock
//!
//! The dry path uses a [`LoopReader`], which advances its own position by a
//! playback rate. The stem path is different: one [`PhaseClock`] ramps 0→1
//! once per loop and every [`TableReader`] maps that shared phase to an offset
//! in its own table. Because no stem reader keeps its own position, the stems
//! cannot drift apart, and retuning the clock retunes all of them at once.

use crate::dsp::GainRamp;
use crate::types::StereoSample;

use super::table::TableRef;

/// Linear-interpolated read at fractional `pos`. `wrap_to` is the frame that
/// follows the last one.
#[inline]
fn interpolate(frames: &[StereoSample], pos: f64, wrap_to: usize) -> StereoSample {
    let len = frames.len();
    let idx = (pos as usize).min(len - 1);
    let frac = (pos - idx as f64) as f32;
    let next = if idx + 1 < len { idx + 1 } else { wrap_to.min(len - 1) };
    frames[idx].lerp(frames[next], frac)
}

/// Dry loop reader
///
/// The table holds `[intro_start, loop_end)` when an intro is armed, or just
/// `[loop_start, loop_end)` otherwise. Playback starts at frame 0, runs to
/// the end once, and from then on wraps back to `loop_offset`, so an intro is
/// played exactly once and the loop repeats without a gap.
pub struct LoopReader {
    table: TableRef,
    loop_offset: usize,
    position: f64,
    rate: f64,
    loops: u64,
}

impl LoopReader {
    pub fn new(table: TableRef, loop_offset: usize, rate: f64) -> Self {
        let loop_offset = loop_offset.min(table.len().saturating_sub(1));
        Self {
            table,
            loop_offset,
            position: 0.0,
            rate,
            loops: 0,
        }
    }

    #[inline]
    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.max(0.0);
    }

    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Replace the table under a running reader, keeping the play position.
    /// Returns the old table so the caller decides where it is dropped.
    pub fn swap_table(&mut self, table: TableRef, loop_offset: usize) -> TableRef {
        let len = table.len();
        self.loop_offset = loop_offset.min(len.saturating_sub(1));
        if self.position >= len as f64 {
            self.position = self.loop_offset as f64;
        }
        std::mem::replace(&mut self.table, table)
    }

    /// Frame position within the table
    #[inline]
    pub fn position(&self) -> f64 {
        self.position
    }

    #[inline]
    pub fn loop_offset(&self) -> usize {
        self.loop_offset
    }

    #[inline]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Completed passes through the end of the table
    #[inline]
    pub fn loops_completed(&self) -> u64 {
        self.loops
    }

    /// Still inside the intro (first pass, before `loop_offset`)
    #[inline]
    pub fn in_intro(&self) -> bool {
        self.loops == 0 && self.position < self.loop_offset as f64
    }

    /// Read one frame and advance
    #[inline]
    pub fn next(&mut self) -> StereoSample {
        let frames = self.table.frames();
        let len = frames.len();
        if len == 0 {
            return StereoSample::silence();
        }

        let out = interpolate(frames, self.position, self.loop_offset);
        self.position += self.rate;
        if self.position >= len as f64 {
            let loop_len = (len - self.loop_offset) as f64;
            let over = (self.position - len as f64) % loop_len;
            self.position = self.loop_offset as f64 + over;
            self.loops += 1;
        }
        out
    }
}

/// Free-running 0→1 ramp
#[derive(Debug, Clone)]
pub struct PhaseClock {
    phase: f64,
    frequency: f64,
    increment: f64,
    sample_rate: f64,
}

impl PhaseClock {
    pub fn new(frequency: f64, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1) as f64;
        Self {
            phase: 0.0,
            frequency,
            increment: frequency / sample_rate,
            sample_rate,
        }
    }

    /// Clock frequency for a loop of `loop_secs` played at `speed`
    pub fn frequency_for(speed: f64, loop_secs: f64) -> f64 {
        if loop_secs <= 0.0 {
            return 0.0;
        }
        speed / loop_secs
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency;
        self.increment = frequency / self.sample_rate;
    }

    #[inline]
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Jump to `phase` (wrapped into 0..1)
    pub fn reset(&mut self, phase: f64) {
        self.phase = phase.rem_euclid(1.0);
    }

    #[inline]
    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Current phase, then advance one frame
    #[inline]
    pub fn tick(&mut self) -> f64 {
        let phase = self.phase;
        self.phase += self.increment;
        if self.phase >= 1.0 {
            self.phase -= self.phase.floor();
        }
        phase
    }
}

/// Phase-indexed table reader with a smoothed output gain
pub struct TableReader {
    table: TableRef,
    gain: GainRamp,
}

impl TableReader {
    pub fn new(table: TableRef, gain: GainRamp) -> Self {
        Self { table, gain }
    }

    pub fn swap_table(&mut self, table: TableRef) -> TableRef {
        std::mem::replace(&mut self.table, table)
    }

    #[inline]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    #[inline]
    pub fn gain_mut(&mut self) -> &mut GainRamp {
        &mut self.gain
    }

    /// Read the frame at `phase`, scaled by the next gain value
    #[inline]
    pub fn read(&mut self, phase: f64) -> StereoSample {
        let gain = self.gain.next();
        if gain == 0.0 {
            return StereoSample::silence();
        }
        let frames = self.table.frames();
        if frames.is_empty() {
            return StereoSample::silence();
        }
        interpolate(frames, phase * frames.len() as f64, 0) * gain
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use basedrop::Collector;

    use super::*;
    use crate::engine::table::SampleTable;
    use crate::types::{AudioClip, StereoBuffer};

    fn ramp_table(collector: &Collector, len: usize) -> TableRef {
        let mono: Vec<f32> = (0..len).map(|i| i as f32).collect();
        let clip = AudioClip::new(StereoBuffer::from_mono(&mono), 48000, 1);
        SampleTable::shared(&collector.handle(), Arc::new(clip))
    }

    #[test]
    fn test_plain_loop_wraps_to_start() {
        let collector = Collector::new();
        let mut reader = LoopReader::new(ramp_table(&collector, 4), 0, 1.0);
        let read: Vec<f32> = (0..6).map(|_| reader.next().left).collect();
        assert_eq!(read, vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
        assert_eq!(reader.loops_completed(), 1);
    }

    #[test]
    fn test_intro_plays_once() {
        let collector = Collector::new();
        // Frames 0..2 are intro, 2..5 the loop
        let mut reader = LoopReader::new(ramp_table(&collector, 5), 2, 1.0);
        assert!(reader.in_intro());
        let read: Vec<f32> = (0..11).map(|_| reader.next().left).collect();
        assert_eq!(read, vec![0.0, 1.0, 2.0, 3.0, 4.0, 2.0, 3.0, 4.0, 2.0, 3.0, 4.0]);
        assert!(!reader.in_intro());
    }

    #[test]
    fn test_rate_scales_loop_duration() {
        let collector = Collector::new();
        let mut reader = LoopReader::new(ramp_table(&collector, 100), 0, 2.0);
        for _ in 0..50 {
            reader.next();
        }
        assert_eq!(reader.loops_completed(), 1);
        assert_eq!(reader.position(), 0.0);
    }

    #[test]
    fn test_swap_keeps_position() {
        let collector = Collector::new();
        let mut reader = LoopReader::new(ramp_table(&collector, 10), 0, 1.0);
        for _ in 0..7 {
            reader.next();
        }
        let old = reader.swap_table(ramp_table(&collector, 10), 0);
        assert_eq!(old.len(), 10);
        assert_eq!(reader.position(), 7.0);

        // Shorter table: restart at the loop point
        reader.swap_table(ramp_table(&collector, 5), 1);
        assert_eq!(reader.position(), 1.0);
    }

    #[test]
    fn test_phase_clock_period() {
        // 0.5 Hz at 48 kHz: one cycle every 96000 frames
        let mut clock = PhaseClock::new(PhaseClock::frequency_for(1.0, 2.0), 48000);
        assert_eq!(clock.tick(), 0.0);
        for _ in 0..47999 {
            clock.tick();
        }
        assert!((clock.phase() - 0.5).abs() < 1e-9);
        clock.set_frequency(PhaseClock::frequency_for(2.0, 2.0));
        for _ in 0..24000 {
            clock.tick();
        }
        assert!(clock.phase() < 1e-6 || clock.phase() > 1.0 - 1e-6);
        clock.reset(1.25);
        assert!((clock.phase() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_table_reader_indexes_by_phase() {
        let collector = Collector::new();
        let mut reader = TableReader::new(ramp_table(&collector, 8), GainRamp::new(1.0, 15.0, 48000));
        assert_eq!(reader.read(0.0).left, 0.0);
        assert_eq!(reader.read(0.5).left, 4.0);
        assert!((reader.read(0.5625).left - 4.5).abs() < 1e-6);

        reader.gain_mut().snap(0.0);
        assert_eq!(reader.read(0.5), StereoSample::silence());
    }

    #[test]
    fn test_zero_frequency_clock_is_frozen() {
        assert_eq!(PhaseClock::frequency_for(1.0, 0.0), 0.0);
        let mut clock = PhaseClock::new(0.0, 48000);
        clock.reset(0.3);
        clock.tick();
        assert!((clock.phase() - 0.3).abs() < 1e-12);
    }
}
