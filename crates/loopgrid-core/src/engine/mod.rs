//! Realtime render graph
//!
//! Everything the audio callback touches lives here:
//! - [`SampleTable`]: immutable playable audio, shared with the callback
//! - Readers: the dry [`LoopReader`], the master [`PhaseClock`] and the
//!   phase-indexed [`TableReader`]s that play stems
//! - [`Renderer`]: per-slot voices mixed through EQ and gain stages
//! - [`GraphCommand`]: the lock-free queue the control thread drives it with
//! - [`SlotAtomics`]: lock-free state the control thread reads back
//! - [`GarbageCollector`]: deferred frees for tables dropped in the callback

mod atomics;
mod command;
pub mod gc;
mod reader;
mod renderer;
mod table;

pub use atomics::*;
pub use command::*;
pub use gc::GarbageCollector;
pub use reader::*;
pub use renderer::*;
pub use table::*;
