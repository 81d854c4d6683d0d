//! Loopgrid Core - synchronized loop, key-lock and stem playback

pub mod audio;
pub mod audio_file;
pub mod config;
pub mod context;
pub mod dsp;
pub mod engine;
pub mod eq;
pub mod error;
pub mod pitch;
pub mod player;
pub mod separation;
pub mod session;
pub mod slot;
pub mod stems;
pub mod types;
pub mod worker;

pub use error::{EngineError, EngineResult};
pub use session::{Collaborators, Session, SessionObserver, SessionSnapshot};
pub use types::*;
