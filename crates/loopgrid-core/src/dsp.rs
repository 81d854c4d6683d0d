//! DSP helpers shared by the players and the render graph
//!
//! Unit conversions (dB, speed to semitones, EQ knob curve) and [`GainRamp`],
//! the click-free smoothed gain used for per-stem mutes, slot gain and master
//! gain.

/// Level reported when nothing is playing
pub const LEVEL_FLOOR_DB: f32 = -80.0;

/// Slowest playback speed accepted by the players
pub const MIN_SPEED: f64 = 0.5;

/// Fastest playback speed accepted by the players
pub const MAX_SPEED: f64 = 2.0;

/// Default ramp time for stem gains
pub const DEFAULT_RAMP_MS: f32 = 15.0;

/// Knob position at and below which a band is fully cut
const EQ_KILL_THRESHOLD: f64 = -0.98;

/// Maximum boost at the top of the knob
const EQ_MAX_BOOST_DB: f64 = 12.0;

/// Convert decibels to a linear amplitude factor
#[inline]
pub fn db_to_amp(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Convert a linear amplitude to decibels, floored at [`LEVEL_FLOOR_DB`]
#[inline]
pub fn amp_to_db(amp: f64) -> f64 {
    if amp <= 0.0 {
        return LEVEL_FLOOR_DB as f64;
    }
    (20.0 * amp.log10()).max(LEVEL_FLOOR_DB as f64)
}

/// Semitone shift that cancels the pitch change of playing at `speed`
///
/// Playing twice as fast raises pitch an octave, so the correction is
/// `-12 * log2(speed)`. Non-positive speeds are degenerate and map to 0.
#[inline]
pub fn speed_to_semitones(speed: f64) -> f64 {
    if speed <= 0.0 || !speed.is_finite() {
        return 0.0;
    }
    -12.0 * speed.log2()
}

/// Clamp a requested speed into the playable range
#[inline]
pub fn clamp_speed(speed: f64) -> f64 {
    if !speed.is_finite() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

/// Map an EQ knob position (-1..1) to a band gain in dB
///
/// Boost is linear up to +12 dB. Cut follows a compressive curve that falls
/// to -60 dB approaching -0.98 and jumps to a full -80 dB kill below that.
pub fn eq_knob_to_db(value: f64) -> f64 {
    let value = value.clamp(-1.0, 1.0);
    if value >= 0.0 {
        value * EQ_MAX_BOOST_DB
    } else if value <= EQ_KILL_THRESHOLD {
        LEVEL_FLOOR_DB as f64
    } else {
        let t = (value - EQ_KILL_THRESHOLD) / -EQ_KILL_THRESHOLD;
        -60.0 * (1.0 - t.powf(0.4))
    }
}

/// Linear gain smoother
///
/// Moves from the current gain to the target over a fixed number of samples.
/// Calling [`GainRamp::next`] once per frame yields the gain for that frame.
#[derive(Debug, Clone)]
pub struct GainRamp {
    current: f32,
    target: f32,
    step: f32,
    ramp_samples: u32,
    remaining: u32,
}

impl GainRamp {
    /// Create a ramp resting at `initial`, moving over `ramp_ms` at `sample_rate`
    pub fn new(initial: f32, ramp_ms: f32, sample_rate: u32) -> Self {
        let ramp_samples = ((ramp_ms.max(0.0) / 1000.0) * sample_rate as f32).round() as u32;
        Self {
            current: initial,
            target: initial,
            step: 0.0,
            ramp_samples: ramp_samples.max(1),
            remaining: 0,
        }
    }

    /// Start moving towards `target`
    pub fn set_target(&mut self, target: f32) {
        if (target - self.target).abs() < f32::EPSILON && self.remaining == 0 {
            return;
        }
        self.target = target;
        self.remaining = self.ramp_samples;
        self.step = (target - self.current) / self.ramp_samples as f32;
    }

    /// Jump straight to `value` with no ramp
    pub fn snap(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.remaining = 0;
        self.step = 0.0;
    }

    /// Gain for the next frame
    #[inline]
    pub fn next(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// True when the ramp has settled at zero
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.remaining == 0 && self.current == 0.0
    }
}
