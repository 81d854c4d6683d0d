//! Per-slot records owned by the session

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::slot::{LoopSlot, SlotConfig};
use crate::types::SlotId;

/// The grid: one [`LoopSlot`] per button, indexed by [`SlotId`]
#[derive(Debug)]
pub struct SessionStore {
    slots: Vec<LoopSlot>,
}

impl SessionStore {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: (0..num_slots).map(|i| LoopSlot::new(SlotId(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> EngineResult<&LoopSlot> {
        self.slots.get(id.0).ok_or(EngineError::UnknownSlot(id.0))
    }

    pub fn get_mut(&mut self, id: SlotId) -> EngineResult<&mut LoopSlot> {
        self.slots.get_mut(id.0).ok_or(EngineError::UnknownSlot(id.0))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopSlot> {
        self.slots.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> {
        (0..self.slots.len()).map(SlotId)
    }

    /// Slots currently producing audio
    pub fn active_slots(&self) -> Vec<SlotId> {
        self.slots.iter().filter(|s| s.active).map(|s| s.id()).collect()
    }

    /// Settings of every loaded slot
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            slots: self.slots.iter().filter_map(LoopSlot::config).collect(),
        }
    }
}

/// What a session persists between runs
///
/// Stems are not part of it; they are regenerated on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}
