//! Lock-free command queue from the control thread to the renderer
//!
//! Every change to the render graph (starting a reader, swapping a table,
//! retuning the clock) is a [`GraphCommand`] pushed onto an `rtrb` ring buffer.
//! The audio callback drains the queue before rendering each buffer, so a
//! swap is always applied between two buffers and the callback never sees a
//! half-built graph.
//!
//! Large payloads are boxed to keep the enum small for the ring buffer.

use crate::eq::EqSettings;

use super::table::{ReaderTables, TableRef, NUM_READERS};

/// Parameters for starting a dry loop voice
pub struct LoopStart {
    pub slot: usize,
    pub table: TableRef,
    /// Frame in `table` where the repeating part begins
    pub loop_offset: usize,
    pub rate: f64,
    /// Linear slot gain
    pub gain: f32,
    pub eq: EqSettings,
    /// Start silenced by the stem mute multiplier
    pub muted: bool,
    /// Player's start counter, published back with the reader position
    pub start_id: u64,
}

/// Parameters for starting a stem voice
pub struct StemStart {
    pub slot: usize,
    pub tables: ReaderTables,
    /// Initial clock phase (0..1)
    pub phase: f64,
    /// Clock frequency in Hz (`speed / loop_secs`)
    pub frequency: f64,
    /// Target gain per reader; readers fade in from silence
    pub gains: [f32; NUM_READERS],
    pub gain: f32,
    pub eq: EqSettings,
}

/// Commands sent from the control thread to the audio thread
pub enum GraphCommand {
    // ─────────────────────────────────────────────────────────────
    // Dry loop
    // ─────────────────────────────────────────────────────────────
    StartLoop(Box<LoopStart>),
    /// Hot-swap the dry table without moving the play position
    SwapLoopTable { slot: usize, table: TableRef, loop_offset: usize },
    SetLoopRate { slot: usize, rate: f64 },
    /// Ramp the stem mute multiplier on the dry voice
    SetLoopMute { slot: usize, muted: bool },
    StopLoop { slot: usize },

    // ─────────────────────────────────────────────────────────────
    // Slot mix (applies to dry and stems)
    // ─────────────────────────────────────────────────────────────
    SetSlotGain { slot: usize, gain: f32 },
    SetSlotEq { slot: usize, eq: EqSettings },

    // ─────────────────────────────────────────────────────────────
    // Stems
    // ─────────────────────────────────────────────────────────────
    StartStems(Box<StemStart>),
    /// Replace one reader's table; the clock keeps running
    SwapStemTable { slot: usize, reader: usize, table: TableRef },
    SetStemGains { slot: usize, gains: [f32; NUM_READERS] },
    SetClockFrequency { slot: usize, frequency: f64 },
    ResetClock { slot: usize, phase: f64 },
    StopStems { slot: usize },

    // ─────────────────────────────────────────────────────────────
    // Master
    // ─────────────────────────────────────────────────────────────
    SetMasterGain { gain: f32 },
    /// Silence every slot
    StopAll,
}

/// Default command queue capacity
///
/// A full grid retune (every slot: rate, clock, gains) stays far below this.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Create a command channel (producer for the control thread, consumer for
/// the audio thread)
pub fn command_channel(capacity: usize) -> (CommandSender, rtrb::Consumer<GraphCommand>) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(16));
    (CommandSender { producer }, consumer)
}

/// Control-side end of the command queue
pub struct CommandSender {
    producer: rtrb::Producer<GraphCommand>,
}

impl CommandSender {
    /// Queue a command without blocking
    ///
    /// Returns the command back if the queue is full.
    pub fn send(&mut self, cmd: GraphCommand) -> Result<(), GraphCommand> {
        self.producer.push(cmd).map_err(|e| match e {
            rtrb::PushError::Full(value) => value,
        })
    }

    /// Free space in the queue
    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}
