//! Three-band EQ used on the dry loop and on the stem mix bus
//!
//! The low and high bands are isolators: a Linkwitz-Riley 24 dB/oct split at
//! 200 Hz and 4 kHz with the knob gain applied to the outer band only, so a
//! full low kill removes the bass and leaves the rest of the spectrum alone.
//! LR24 halves sum flat, so a band at 0 dB is transparent. The mid band is an
//! RBJ peak at 1 kHz. Band gains come from knob positions in -1..1 through
//! [`eq_knob_to_db`].

use serde::{Deserialize, Serialize};

use crate::dsp::{db_to_amp, eq_knob_to_db};
use crate::types::StereoSample;

pub const EQ_LOW_FREQ: f32 = 200.0;
pub const EQ_MID_FREQ: f32 = 1000.0;
pub const EQ_HIGH_FREQ: f32 = 4000.0;
const EQ_MID_Q: f32 = 0.7;

/// Below this the band is bypassed
const BYPASS_DB: f32 = 0.05;

/// Knob positions for the three bands, each in -1..1
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqSettings {
    pub low: f32,
    pub mid: f32,
    pub high: f32,
}

impl EqSettings {
    pub fn new(low: f32, mid: f32, high: f32) -> Self {
        Self {
            low: low.clamp(-1.0, 1.0),
            mid: mid.clamp(-1.0, 1.0),
            high: high.clamp(-1.0, 1.0),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.low == 0.0 && self.mid == 0.0 && self.high == 0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Coeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coeffs {
    const IDENTITY: Coeffs = Coeffs { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0 };

    fn peaking(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> Self {
        let a = 10f32.powf(gain_db / 40.0);
        let w0 = std::f32::consts::TAU * freq / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: -2.0 * cos_w0 / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }
}

/// One biquad section with stereo state (direct form I)
#[derive(Debug, Clone, Copy)]
struct Band {
    coeffs: Coeffs,
    bypass: bool,
    x: [[f32; 2]; 2],
    y: [[f32; 2]; 2],
}

impl Band {
    fn new() -> Self {
        Self {
            coeffs: Coeffs::IDENTITY,
            bypass: true,
            x: [[0.0; 2]; 2],
            y: [[0.0; 2]; 2],
        }
    }

    fn set(&mut self, coeffs: Option<Coeffs>) {
        match coeffs {
            Some(c) => {
                self.coeffs = c;
                self.bypass = false;
            }
            None => {
                self.coeffs = Coeffs::IDENTITY;
                self.bypass = true;
            }
        }
    }

    #[inline]
    fn tick(&mut self, ch: usize, input: f32) -> f32 {
        let c = &self.coeffs;
        let [x1, x2] = self.x[ch];
        let [y1, y2] = self.y[ch];
        let out = c.b0 * input + c.b1 * x1 + c.b2 * x2 - c.a1 * y1 - c.a2 * y2;
        self.x[ch] = [input, x1];
        self.y[ch] = [out, y1];
        out
    }

    #[inline]
    fn process(&mut self, s: StereoSample) -> StereoSample {
        if self.bypass {
            return s;
        }
        StereoSample::new(self.tick(0, s.left), self.tick(1, s.right))
    }

    fn reset(&mut self) {
        self.x = [[0.0; 2]; 2];
        self.y = [[0.0; 2]; 2];
    }
}

/// Two-pole Butterworth state-variable filter, LP and HP outputs
#[derive(Debug, Clone, Copy)]
struct Svf {
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    ic: [[f32; 2]; 2],
}

impl Svf {
    fn new(cutoff: f32, sample_rate: f32) -> Self {
        let g = (std::f32::consts::PI * cutoff.min(sample_rate * 0.45) / sample_rate).tan();
        let k = std::f32::consts::SQRT_2;
        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        Self { k, a1, a2, a3: g * a2, ic: [[0.0; 2]; 2] }
    }

    /// Returns (lowpass, highpass) for one channel
    #[inline]
    fn tick(&mut self, ch: usize, input: f32) -> (f32, f32) {
        let [ic1, ic2] = self.ic[ch];
        let v3 = input - ic2;
        let v1 = self.a1 * ic1 + self.a2 * v3;
        let v2 = ic2 + self.a2 * ic1 + self.a3 * v3;
        self.ic[ch] = [2.0 * v1 - ic1, 2.0 * v2 - ic2];
        (v2, input - self.k * v1 - v2)
    }

    fn reset(&mut self) {
        self.ic = [[0.0; 2]; 2];
    }
}

/// Which side of the split the knob gain applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Below,
    Above,
}

/// Linkwitz-Riley split with gain on one side
#[derive(Debug, Clone, Copy)]
struct Isolator {
    side: Side,
    lp: [Svf; 2],
    hp: [Svf; 2],
    gain: f32,
    bypass: bool,
}

impl Isolator {
    fn new(freq: f32, sample_rate: f32, side: Side) -> Self {
        let svf = Svf::new(freq, sample_rate);
        Self { side, lp: [svf; 2], hp: [svf; 2], gain: 1.0, bypass: true }
    }

    fn set_gain_db(&mut self, db: f32) {
        self.bypass = db.abs() < BYPASS_DB;
        self.gain = db_to_amp(db as f64) as f32;
    }

    #[inline]
    fn tick(&mut self, ch: usize, input: f32) -> f32 {
        let (lp1, _) = self.lp[0].tick(ch, input);
        let (low, _) = self.lp[1].tick(ch, lp1);
        let (_, hp1) = self.hp[0].tick(ch, input);
        let (_, high) = self.hp[1].tick(ch, hp1);
        match self.side {
            Side::Below => low * self.gain + high,
            Side::Above => low + high * self.gain,
        }
    }

    #[inline]
    fn process(&mut self, s: StereoSample) -> StereoSample {
        if self.bypass {
            return s;
        }
        StereoSample::new(self.tick(0, s.left), self.tick(1, s.right))
    }

    fn reset(&mut self) {
        for f in self.lp.iter_mut().chain(self.hp.iter_mut()) {
            f.reset();
        }
    }
}

/// Stereo three-band EQ
#[derive(Debug, Clone)]
pub struct ThreeBandEq {
    sample_rate: f32,
    settings: EqSettings,
    low: Isolator,
    mid: Band,
    high: Isolator,
}

impl ThreeBandEq {
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f32;
        Self {
            sample_rate: sr,
            settings: EqSettings::default(),
            low: Isolator::new(EQ_LOW_FREQ, sr, Side::Below),
            mid: Band::new(),
            high: Isolator::new(EQ_HIGH_FREQ, sr, Side::Above),
        }
    }

    pub fn settings(&self) -> EqSettings {
        self.settings
    }

    /// Apply new knob positions, recomputing only the bands that changed
    pub fn set(&mut self, settings: EqSettings) {
        let old = self.settings;
        self.settings = settings;

        if old.low != settings.low {
            self.low.set_gain_db(eq_knob_to_db(settings.low as f64) as f32);
        }
        if old.mid != settings.mid {
            let db = eq_knob_to_db(settings.mid as f64) as f32;
            let sr = self.sample_rate;
            self.mid.set((db.abs() >= BYPASS_DB).then(|| Coeffs::peaking(EQ_MID_FREQ, db, EQ_MID_Q, sr)));
        }
        if old.high != settings.high {
            self.high.set_gain_db(eq_knob_to_db(settings.high as f64) as f32);
        }
    }

    #[inline]
    pub fn process(&mut self, input: StereoSample) -> StereoSample {
        let s = self.low.process(input);
        let s = self.mid.process(s);
        self.high.process(s)
    }

    pub fn reset(&mut self) {
        self.low.reset();
        self.mid.reset();
        self.high.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_rms(eq: &mut ThreeBandEq, freq: f32, sample_rate: u32) -> f32 {
        let n = sample_rate as usize / 2;
        let mut sum = 0.0;
        for i in 0..n {
            let v = (std::f32::consts::TAU * freq * i as f32 / sample_rate as f32).sin();
            let out = eq.process(StereoSample::mono(v));
            // Skip the filter's settling time
            if i > n / 2 {
                sum += out.left * out.left;
            }
        }
        (sum / (n - n / 2 - 1) as f32).sqrt()
    }

    #[test]
    fn test_flat_eq_is_transparent() {
        let mut eq = ThreeBandEq::new(48000);
        eq.set(EqSettings::default());
        let s = StereoSample::new(0.3, -0.7);
        assert_eq!(eq.process(s), s);
    }

    #[test]
    fn test_low_kill_attenuates_bass() {
        let mut eq = ThreeBandEq::new(48000);
        eq.set(EqSettings::new(-1.0, 0.0, 0.0));
        let bass = sine_rms(&mut eq, 50.0, 48000);
        assert!(bass < 0.01, "bass rms {bass}");
        // Everything well above the split passes within a dB of a unity sine
        for freq in [1000.0, 4000.0, 8000.0] {
            eq.reset();
            let rms = sine_rms(&mut eq, freq, 48000);
            assert!(rms > 0.63 && rms < 0.8, "{freq} Hz rms {rms}");
        }
    }

    #[test]
    fn test_high_kill_keeps_mids() {
        let mut eq = ThreeBandEq::new(48000);
        eq.set(EqSettings::new(0.0, 0.0, -1.0));
        let treble = sine_rms(&mut eq, 16000.0, 48000);
        assert!(treble < 0.01, "treble rms {treble}");
        eq.reset();
        let mid = sine_rms(&mut eq, 500.0, 48000);
        assert!(mid > 0.63, "mid rms {mid}");
    }

    #[test]
    fn test_isolator_at_zero_db_sums_flat() {
        let mut eq = ThreeBandEq::new(48000);
        // Run the split even though the knob is centred
        eq.low.bypass = false;
        for freq in [60.0, 200.0, 2000.0] {
            eq.reset();
            let rms = sine_rms(&mut eq, freq, 48000);
            assert!((rms - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.02, "{freq} Hz rms {rms}");
        }
    }

    #[test]
    fn test_high_boost_raises_treble() {
        let mut eq = ThreeBandEq::new(48000);
        eq.set(EqSettings::new(0.0, 0.0, 1.0));
        let treble = sine_rms(&mut eq, 12000.0, 48000);
        // Unity sine has rms ~0.707; +12 dB is ~2.8
        assert!(treble > 1.5, "treble rms {treble}");
    }

    #[test]
    fn test_settings_clamped() {
        let s = EqSettings::new(-3.0, 0.5, 2.0);
        assert_eq!(s, EqSettings { low: -1.0, mid: 0.5, high: 1.0 });
        assert!(EqSettings::default().is_flat());
    }
}
