//! RT-safe deferred deallocation for sample tables
//!
//! Sample tables are handed to the audio thread as `basedrop::Shared<T>`.
//! When the audio thread drops the last reference (a reader swapped out or a
//! slot stopped), the free is queued instead of performed in the callback, and
//! the collector thread owned here reclaims it.
//!
//! The collector is owned by the session root and shut down explicitly; there
//! is no process-wide instance.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Collector, Handle};

/// How often queued drops are reclaimed
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Owner of the collector thread
pub struct GarbageCollector {
    handle: Handle,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GarbageCollector {
    /// Spawn the collector thread and wait for its handle
    pub fn spawn() -> io::Result<Self> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("audio-gc".to_string())
            .spawn(move || {
                // Collector is !Sync, so it lives entirely on this thread
                let mut collector = Collector::new();
                if handle_tx.send(collector.handle()).is_err() {
                    return;
                }
                log::info!("Audio GC thread started");

                loop {
                    collector.collect();
                    match stop_rx.recv_timeout(COLLECT_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                collector.collect();
                log::debug!("Audio GC thread stopped");
            })?;

        let handle = handle_rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "GC thread exited before sending its handle")
        })?;

        Ok(Self {
            handle,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Handle for creating `Shared<T>` allocations
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the collector thread after a final collection pass. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Audio GC thread panicked");
            }
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_spawn_and_shutdown() {
        let mut gc = GarbageCollector::spawn().unwrap();
        let data = Shared::new(&gc.handle(), vec![0.0f32; 1024]);
        let other = data.clone();
        drop(data);
        assert_eq!(other.len(), 1024);
        drop(other);
        gc.shutdown();
        gc.shutdown();
    }
}
