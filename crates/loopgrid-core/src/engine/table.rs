//! Playable sample tables
//!
//! A table wraps an [`AudioClip`] for the render graph and tags it with a
//! version number. Tables are built straight from in-memory clips; nothing is
//! written to disk.
//!
//! The callback holds tables as `basedrop::Shared`, so when it drops the last
//! reference the clip is released on the collector thread, not in the callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::{Handle, Shared};

use crate::types::{AudioClip, StemKind, StereoSample, NUM_STEMS};

/// Reader slot of the full mix in a stem set
pub const MAIN_READER: usize = 0;

/// Main plus one reader per stem
pub const NUM_READERS: usize = NUM_STEMS + 1;

/// Reader slot for a stem
#[inline]
pub fn stem_reader(kind: StemKind) -> usize {
    kind.index() + 1
}

static NEXT_TABLE_VERSION: AtomicU64 = AtomicU64::new(1);

/// Immutable playable audio with a unique version tag
#[derive(Debug)]
pub struct SampleTable {
    version: u64,
    clip: Arc<AudioClip>,
}

/// Handle to a table shared with the audio thread
pub type TableRef = Shared<SampleTable>;

impl SampleTable {
    pub fn new(clip: Arc<AudioClip>) -> Self {
        Self {
            version: NEXT_TABLE_VERSION.fetch_add(1, Ordering::Relaxed),
            clip,
        }
    }

    /// Build a table and wrap it for the audio thread
    pub fn shared(handle: &Handle, clip: Arc<AudioClip>) -> TableRef {
        Shared::new(handle, Self::new(clip))
    }

    /// Unique per construction; unchanged as long as the table is reused
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn clip(&self) -> &Arc<AudioClip> {
        &self.clip
    }

    #[inline]
    pub fn frames(&self) -> &[StereoSample] {
        self.clip.frames().as_slice()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clip.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clip.is_empty()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.clip.sample_rate()
    }

    pub fn duration_secs(&self) -> f64 {
        self.clip.duration_secs()
    }
}

/// The set of tables a stem engine plays: main plus five stems
pub type ReaderTables = [Option<TableRef>; NUM_READERS];

/// Version tags of a table set, `None` where a reader has no table
pub fn table_versions(tables: &ReaderTables) -> [Option<u64>; NUM_READERS] {
    std::array::from_fn(|i| tables[i].as_ref().map(|t| t.version()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoBuffer;
    use basedrop::Collector;

    #[test]
    fn test_versions_are_unique() {
        let collector = Collector::new();
        let clip = Arc::new(AudioClip::new(StereoBuffer::silence(8), 48000, 2));
        let a = SampleTable::shared(&collector.handle(), Arc::clone(&clip));
        let b = SampleTable::shared(&collector.handle(), clip);
        assert_ne!(a.version(), b.version());
        assert_eq!(a.clone().version(), a.version());
    }

    #[test]
    fn test_reader_slots() {
        assert_eq!(stem_reader(StemKind::Vocals), 1);
        assert_eq!(stem_reader(StemKind::Instrumental), NUM_READERS - 1);
    }
}
