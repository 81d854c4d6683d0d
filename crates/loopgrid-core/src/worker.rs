//! Background worker pool and completion queue
//!
//! Anything that can block (decoding, pitch shifting, beat tracking, stem
//! separation) runs here, never on the control thread or the audio thread.
//!
//! ```text
//! control thread ── spawn(job) ──► rayon pool ── Completion ──► channel
//!       ▲                                                          │
//!       └──────────────────── Session::poll() ◄────────────────────┘
//! ```
//!
//! Jobs get owned copies or `Arc`s of what they need and report back only
//! through the channel; they never touch session state. A job that panics is
//! turned into a failure completion, so one bad task cannot take the pool
//! down or leave the control thread waiting for a result that never comes.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use crate::audio_file::FileLoadResult;
use crate::error::{EngineError, EngineResult, PitchResult};
use crate::separation::SeparationResult;
use crate::types::{AudioClip, ClipId, SlotId, NUM_STEMS};

/// Result of a background job
#[derive(Debug)]
pub enum Completion {
    FileLoaded {
        slot: SlotId,
        path: PathBuf,
        result: FileLoadResult<AudioClip>,
    },
    /// Pitch-corrected dry loop for `(source, speed)`
    LoopPitched {
        slot: SlotId,
        source: ClipId,
        speed: f64,
        result: PitchResult<AudioClip>,
    },
    /// One reader of a stem engine repitch batch
    StemPitched {
        slot: SlotId,
        reader: usize,
        generation: u64,
        speed: f64,
        result: PitchResult<AudioClip>,
    },
    BpmDetected {
        slot: SlotId,
        path: PathBuf,
        bpm: Option<f64>,
    },
    StemsSeparated {
        slot: SlotId,
        source: ClipId,
        result: SeparationResult<[Arc<AudioClip>; NUM_STEMS]>,
    },
}

/// Owned thread pool plus the queue its jobs report to
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> EngineResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("loopgrid-worker-{}", i))
            .build()
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        let (completion_tx, completion_rx) = channel::unbounded();
        log::info!("Worker pool started with {} threads", threads.max(1));

        Ok(Self {
            pool: Some(pool),
            completion_tx,
            completion_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` in the background
    ///
    /// If `job` panics, `on_panic` builds the failure completion from the
    /// panic message instead.
    pub fn spawn<F, P>(&self, job: F, on_panic: P) -> EngineResult<()>
    where
        F: FnOnce() -> Completion + Send + 'static,
        P: FnOnce(String) -> Completion + Send + 'static,
    {
        let Some(pool) = self.pool.as_ref() else {
            return Err(EngineError::Worker("worker pool is shut down".to_string()));
        };

        let tx = self.completion_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);

        pool.spawn(move || {
            let completion = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(completion) => completion,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("Background job panicked: {}", message);
                    on_panic(message)
                }
            };
            // Receiver lives as long as the pool owner; a failed send means
            // the session is gone and nobody wants the result.
            let _ = tx.send(completion);
            // Decrement after sending so in_flight == 0 implies the queue
            // holds every result
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Next finished result, if any
    pub fn try_recv(&self) -> Option<Completion> {
        self.completion_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next result
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Completion> {
        self.completion_rx.recv_timeout(timeout).ok()
    }

    /// Jobs spawned whose results are not yet queued
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Results waiting in the queue
    pub fn pending(&self) -> usize {
        self.completion_rx.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_none()
    }

    /// Wait (bounded) for in-flight jobs, then release the threads
    ///
    /// Returns `false` if jobs were still running at the deadline; their
    /// results are dropped. Calling it again is a no-op.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        let Some(pool) = self.pool.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let finished = self.in_flight() == 0;
        if !finished {
            log::warn!("Worker pool shut down with {} jobs still running", self.in_flight());
        }
        drop(pool);
        log::info!("Worker pool shut down");
        finished
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(2));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
