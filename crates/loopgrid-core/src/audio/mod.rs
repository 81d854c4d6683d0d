//! Audio output
//!
//! [`AudioDevice`] owns the output stream and the control-side end of the
//! render command queue. Two backends share the same callback state:
//! - **cpal**: a real output stream on the host's audio API
//! - **offline**: no stream; buffers are rendered on demand with
//!   [`AudioDevice::render_offline`] (tests, headless bouncing)
//!
//! ```text
//! ┌──────────────────┐   GraphCommand    ┌─────────────────────┐
//! │  control thread  │──────push()──────►│  rtrb ring buffer   │
//! └──────────────────┘                   └──────────┬──────────┘
//!          ▲                                        │ pop()
//!          │ Relaxed atomics                        ▼
//! ┌──────────────────┐                   ┌─────────────────────┐
//! │   SlotAtomics    │◄──────────────────│   audio callback    │
//! └──────────────────┘                   │  (owns Renderer)    │
//!                                        └─────────────────────┘
//! ```

mod config;
mod cpal_backend;
mod device;
mod error;

pub use config::*;
pub use cpal_backend::list_output_devices;
pub use device::{AudioDevice, DeviceState, GraphSettings};
pub use error::{AudioError, AudioResult};
