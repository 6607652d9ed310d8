//! Background eviction daemon.
//!
//! One worker thread per cache, woken through a single-slot channel. Waking
//! an already-woken daemon is a no-op, so the trigger can be called from any
//! thread as often as it likes.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

use super::{run_pass, EvictionSource};
use crate::cache::inner::CacheInner;
use crate::error::{Error, Result};

/// Upper bound on consecutive passes per wake-up.
const MAX_PASSES_PER_WAKE: usize = 64;

#[derive(Debug)]
enum Request {
    Wake,
    Shutdown,
}

/// Handle to the background eviction thread.
#[derive(Debug)]
pub struct EvictorDaemon {
    tx: Sender<Request>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EvictorDaemon {
    pub(crate) fn spawn(inner: Arc<CacheInner>) -> Result<Self> {
        let (tx, rx) = bounded::<Request>(1);
        let worker = thread::Builder::new()
            .name("nodecache-evictor".to_string())
            .spawn(move || worker_loop(&inner, &rx))
            .map_err(|e| Error::Internal(format!("failed to spawn evictor thread: {e}")))?;
        tracing::info!("Background evictor started");
        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Requests a background pass. Never blocks.
    pub fn wake(&self) {
        // Full: a wake-up is already pending.
        if let Err(TrySendError::Disconnected(_)) = self.tx.try_send(Request::Wake) {
            tracing::debug!("Evictor wake-up after shutdown ignored");
        }
    }

    /// Returns true while the worker thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Stops the worker and waits for it. Idempotent.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(Request::Shutdown);
            if worker.join().is_err() {
                tracing::error!("Background evictor panicked");
            } else {
                tracing::info!("Background evictor stopped");
            }
        }
    }
}

impl Drop for EvictorDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: &CacheInner, rx: &Receiver<Request>) {
    while let Ok(request) = rx.recv() {
        match request {
            Request::Wake => {
                for _ in 0..MAX_PASSES_PER_WAKE {
                    if !inner.budget.is_over() {
                        break;
                    }
                    if !run_pass(inner, EvictionSource::Background).made_progress() {
                        break;
                    }
                }
            }
            Request::Shutdown => break,
        }
    }
}
