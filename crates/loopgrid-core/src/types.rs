//! Core types for loopgrid
//!
//! Stereo frames and buffers, the five stem categories, slot identifiers, and
//! [`AudioClip`], the immutable decoded audio that every cache and table in the
//! engine is built from.

use std::ops::{Add, AddAssign, Index, Mul};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fallback output rate when the device does not report one
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Number of stem categories a separated track provides
pub const NUM_STEMS: usize = 5;

/// Audio sample type
pub type Sample = f32;

/// Stem categories
///
/// `Instrumental` is the sum of drums, bass and melody, and is mutually
/// exclusive with the other four when selecting what plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StemKind {
    Vocals = 0,
    Melody = 1,
    Bass = 2,
    Drums = 3,
    Instrumental = 4,
}

impl StemKind {
    pub const ALL: [StemKind; NUM_STEMS] = [
        StemKind::Vocals,
        StemKind::Melody,
        StemKind::Bass,
        StemKind::Drums,
        StemKind::Instrumental,
    ];

    /// The four stems that make up the full mix
    pub const PARTS: [StemKind; 4] = [
        StemKind::Vocals,
        StemKind::Melody,
        StemKind::Bass,
        StemKind::Drums,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    /// Lowercase name used by UI bindings and log output
    pub fn name(self) -> &'static str {
        match self {
            StemKind::Vocals => "vocals",
            StemKind::Melody => "melody",
            StemKind::Bass => "bass",
            StemKind::Drums => "drums",
            StemKind::Instrumental => "instrumental",
        }
    }

    /// Parse a stem name (case-insensitive). "other" is accepted for melody,
    /// which is what most separation models call it.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vocals" => Some(StemKind::Vocals),
            "melody" | "other" => Some(StemKind::Melody),
            "bass" => Some(StemKind::Bass),
            "drums" => Some(StemKind::Drums),
            "instrumental" => Some(StemKind::Instrumental),
            _ => None,
        }
    }

    #[inline]
    pub fn is_instrumental(self) -> bool {
        self == StemKind::Instrumental
    }
}

impl std::fmt::Display for StemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single stereo frame
///
/// `#[repr(C)]` keeps the layout `[left, right]` so frame slices can be viewed
/// as interleaved `f32` through bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Mono sum used by single-channel outputs
    #[inline]
    pub fn to_mono(self) -> Sample {
        (self.left + self.right) * 0.5
    }

    #[inline]
    pub fn peak(self) -> Sample {
        self.left.abs().max(self.right.abs())
    }

    /// Linear interpolation between two frames
    #[inline]
    pub fn lerp(self, other: Self, t: Sample) -> Self {
        Self {
            left: self.left + (other.left - self.left) * t,
            right: self.right + (other.right - self.right) * t,
        }
    }
}

impl Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.left + other.left, self.right + other.right)
    }
}

impl AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self::new(self.left * factor, self.right * factor)
    }
}

/// A growable buffer of stereo frames
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    /// Build from separate channel slices. The shorter channel decides the length.
    pub fn from_channels(left: &[Sample], right: &[Sample]) -> Self {
        Self {
            samples: left
                .iter()
                .zip(right)
                .map(|(&l, &r)| StereoSample::new(l, r))
                .collect(),
        }
    }

    /// Build from a mono slice, duplicating it to both channels
    pub fn from_mono(mono: &[Sample]) -> Self {
        Self {
            samples: mono.iter().map(|&v| StereoSample::mono(v)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer without reallocating
    /// (as long as `new_len` stays within capacity). New frames are silent.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        debug_assert!(new_len <= self.samples.capacity());
        if new_len > self.samples.len() {
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Zero-copy interleaved view `[L, R, L, R, ...]`
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.samples)
    }

    /// Split into (left, right) channel vectors
    pub fn to_channels(&self) -> (Vec<Sample>, Vec<Sample>) {
        self.samples.iter().map(|s| (s.left, s.right)).unzip()
    }

    /// Copy of the frames in `start..end`, clamped to the buffer
    pub fn slice(&self, start: usize, end: usize) -> StereoBuffer {
        let end = end.min(self.samples.len());
        let start = start.min(end);
        Self::from_vec(self.samples[start..end].to_vec())
    }

    #[inline]
    pub fn push(&mut self, sample: StereoSample) {
        self.samples.push(sample);
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

/// Index of a grid slot ("button")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Process-unique identity of an [`AudioClip`]
///
/// Caches key on this rather than on buffer contents: two clips cut from the
/// same file with different bounds get different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipId(u64);

static NEXT_CLIP_ID: AtomicU64 = AtomicU64::new(1);

impl ClipId {
    pub fn next() -> Self {
        Self(NEXT_CLIP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Immutable decoded audio
///
/// Always stored as stereo frames at `sample_rate`. `channels` records how
/// many channels the source had so that channel-preserving processing (pitch
/// shifting) can work on the original layout.
#[derive(Debug, Clone)]
pub struct AudioClip {
    id: ClipId,
    frames: StereoBuffer,
    sample_rate: u32,
    channels: u16,
}

impl AudioClip {
    pub fn new(frames: StereoBuffer, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: ClipId::next(),
            frames,
            sample_rate,
            channels: channels.clamp(1, 2),
        }
    }

    #[inline]
    pub fn id(&self) -> ClipId {
        self.id
    }

    #[inline]
    pub fn frames(&self) -> &StereoBuffer {
        &self.frames
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn is_mono(&self) -> bool {
        self.channels == 1
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames.len() as f64 / self.sample_rate.max(1) as f64
    }

    /// Convert seconds to a frame index, clamped to the clip
    pub fn frame_at(&self, secs: f64) -> usize {
        let frame = (secs.max(0.0) * self.sample_rate as f64).round() as usize;
        frame.min(self.frames.len())
    }

    /// New clip holding `[start_secs, end_secs)` with a fresh identity
    pub fn slice_secs(&self, start_secs: f64, end_secs: f64) -> AudioClip {
        let start = self.frame_at(start_secs);
        let end = self.frame_at(end_secs);
        AudioClip::new(self.frames.slice(start, end), self.sample_rate, self.channels)
    }

    /// Sample-wise sum of several clips (used to derive the instrumental stem).
    /// The result is as long as the longest input; the rate and channel count
    /// come from the first clip.
    pub fn mix(clips: &[&AudioClip]) -> Option<AudioClip> {
        let first = clips.first()?;
        let len = clips.iter().map(|c| c.len()).max().unwrap_or(0);
        let mut out = StereoBuffer::silence(len);
        for clip in clips {
            for (dst, src) in out.as_mut_slice().iter_mut().zip(clip.frames.iter()) {
                *dst += *src;
            }
        }
        let channels = clips.iter().map(|c| c.channels).max().unwrap_or(1);
        Some(AudioClip::new(out, first.sample_rate, channels))
    }
}
