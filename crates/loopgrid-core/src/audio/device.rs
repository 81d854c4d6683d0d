//! Output device lifecycle
//!
//! `boot → start ⇄ stop → shutdown`. Boot failures are fatal for the
//! application and are surfaced as-is, never retried. Stop and shutdown are
//! idempotent.

use std::sync::{Arc, Mutex};

use crate::dsp::db_to_amp;
use crate::engine::{command_channel, CommandSender, GraphCommand, Renderer, SlotAtomics};
use crate::error::{EngineError, EngineResult};
use crate::types::{StereoBuffer, StereoSample};

use super::config::{AudioConfig, MAX_BUFFER_SIZE};
use super::cpal_backend::{self, CpalStream};
use super::error::{AudioError, AudioResult};

/// Lifecycle state of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Stream built, not yet producing audio
    Booted,
    Running,
    Stopped,
    ShutDown,
}

/// State owned by the audio callback
pub(super) struct CallbackState {
    renderer: Renderer,
    command_rx: rtrb::Consumer<GraphCommand>,
    buffer: StereoBuffer,
}

impl CallbackState {
    fn new(renderer: Renderer, command_rx: rtrb::Consumer<GraphCommand>) -> Self {
        Self {
            renderer,
            command_rx,
            buffer: StereoBuffer::silence(MAX_BUFFER_SIZE),
        }
    }

    /// Apply pending commands and render `n_frames`
    pub(super) fn process(&mut self, n_frames: usize) -> &[StereoSample] {
        let n_frames = n_frames.min(MAX_BUFFER_SIZE);
        self.buffer.set_len_from_capacity(n_frames);
        self.renderer.process_commands(&mut self.command_rx);
        self.renderer.render(self.buffer.as_mut_slice());
        self.buffer.as_slice()
    }
}

enum Backend {
    Cpal(CpalStream),
    Offline,
}

/// Settings that size the render graph
#[derive(Debug, Clone, Copy)]
pub struct GraphSettings {
    pub max_slots: usize,
    pub ramp_ms: f32,
    pub queue_capacity: usize,
}

/// The realtime output device and its render graph
pub struct AudioDevice {
    backend: Backend,
    callback: Arc<Mutex<CallbackState>>,
    commands: CommandSender,
    atomics: Arc<[SlotAtomics]>,
    sample_rate: u32,
    channels: u16,
    state: DeviceState,
    master_gain_db: f64,
}

impl AudioDevice {
    /// Open the configured output device and build its stream
    pub fn boot(config: &AudioConfig, graph: GraphSettings) -> AudioResult<Self> {
        let device = cpal_backend::find_device(config.device.as_deref())?;
        let output = cpal_backend::output_config(&device, config)?;

        let (callback, commands, atomics) = Self::graph(output.sample_rate, graph);
        let stream = cpal_backend::build_stream(&device, &output, Arc::clone(&callback))?;

        log::info!(
            "Audio device booted: {} Hz, {} ch, buffer {:?}",
            output.sample_rate,
            output.channels,
            config.buffer_size
        );
        Ok(Self {
            backend: Backend::Cpal(stream),
            callback,
            commands,
            atomics,
            sample_rate: output.sample_rate,
            channels: output.channels,
            state: DeviceState::Booted,
            master_gain_db: 0.0,
        })
    }

    /// A device with no stream; audio is pulled with [`render_offline`](Self::render_offline)
    pub fn offline(sample_rate: u32, graph: GraphSettings) -> Self {
        let (callback, commands, atomics) = Self::graph(sample_rate, graph);
        Self {
            backend: Backend::Offline,
            callback,
            commands,
            atomics,
            sample_rate,
            channels: 2,
            state: DeviceState::Booted,
            master_gain_db: 0.0,
        }
    }

    fn graph(
        sample_rate: u32,
        graph: GraphSettings,
    ) -> (Arc<Mutex<CallbackState>>, CommandSender, Arc<[SlotAtomics]>) {
        let renderer = Renderer::with_ramp(sample_rate, graph.max_slots, graph.ramp_ms);
        let atomics = renderer.atomics();
        let (commands, command_rx) = command_channel(graph.queue_capacity);
        let callback = Arc::new(Mutex::new(CallbackState::new(renderer, command_rx)));
        (callback, commands, atomics)
    }

    /// Start producing audio
    pub fn start(&mut self) -> AudioResult<()> {
        match self.state {
            DeviceState::Running => return Ok(()),
            DeviceState::ShutDown => return Err(AudioError::ShutDown),
            DeviceState::Booted | DeviceState::Stopped => {}
        }
        if let Backend::Cpal(stream) = &self.backend {
            stream.play()?;
        }
        self.state = DeviceState::Running;
        log::info!("Audio device started");
        Ok(())
    }

    /// Pause output. Queued commands are applied on the next start.
    pub fn stop(&mut self) {
        if self.state != DeviceState::Running {
            return;
        }
        if let Backend::Cpal(stream) = &self.backend {
            if let Err(e) = stream.pause() {
                log::warn!("{}", e);
            }
        }
        self.state = DeviceState::Stopped;
        log::info!("Audio device stopped");
    }

    /// Silence everything and close the stream
    pub fn shutdown(&mut self) {
        if self.state == DeviceState::ShutDown {
            return;
        }
        let _ = self.commands.send(GraphCommand::StopAll);
        self.stop();
        // Dropping the stream closes it
        self.backend = Backend::Offline;
        self.state = DeviceState::ShutDown;
        log::info!("Audio device shut down");
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.backend, Backend::Offline)
    }

    /// Per-slot state published by the audio thread
    pub fn atomics(&self) -> &Arc<[SlotAtomics]> {
        &self.atomics
    }

    pub fn slot_atomics(&self, slot: usize) -> Option<&SlotAtomics> {
        self.atomics.get(slot)
    }

    /// Queue a graph command
    pub fn send(&mut self, cmd: GraphCommand) -> EngineResult<()> {
        if self.state == DeviceState::ShutDown {
            return Ok(());
        }
        self.commands.send(cmd).map_err(|_| {
            log::warn!("Audio command queue full, dropping command");
            EngineError::CommandQueueFull
        })
    }

    /// Master output gain in dB
    pub fn set_master_gain_db(&mut self, db: f64) -> EngineResult<()> {
        self.master_gain_db = db;
        self.send(GraphCommand::SetMasterGain {
            gain: db_to_amp(db) as f32,
        })
    }

    pub fn master_gain_db(&self) -> f64 {
        self.master_gain_db
    }

    /// Render `frames` on the calling thread (offline backend only)
    ///
    /// Returns silence while the device is not running.
    pub fn render_offline(&mut self, frames: usize) -> StereoBuffer {
        let mut out = StereoBuffer::with_capacity(frames);
        if !self.is_offline() || self.state != DeviceState::Running {
            out.set_len_from_capacity(frames);
            return out;
        }
        let Ok(mut state) = self.callback.lock() else {
            out.set_len_from_capacity(frames);
            return out;
        };
        let mut remaining = frames;
        while remaining > 0 {
            let chunk = remaining.min(MAX_BUFFER_SIZE);
            for s in state.process(chunk) {
                out.push(*s);
            }
            remaining -= chunk;
        }
        out
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
