//! Environment-wide failure channel.
//!
//! Failures that affect no specific caller, such as a dirty node that could
//! not be flushed during eviction, are published here instead of being
//! returned to whichever thread happened to run the pass.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::NodeId;

/// Capacity of the failure queue; older undrained failures are kept, newer
/// ones are counted and retained as the last failure only.
const FAILURE_QUEUE_CAPACITY: usize = 256;

/// Kind of an environment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A dirty node could not be made durable.
    FlushFailed,
    /// The tree refused a structural removal with an error.
    StructuralRemovalFailed,
}

/// A serious condition signalled to the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentFailure {
    /// What failed.
    pub kind: FailureKind,
    /// Node involved.
    pub node: NodeId,
    /// Collaborator message.
    pub message: String,
}

impl fmt::Display for EnvironmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on node {}: {}", self.kind, self.node, self.message)
    }
}

/// Publishes [`EnvironmentFailure`]s to subscribers.
#[derive(Debug)]
pub struct FailureChannel {
    tx: Sender<EnvironmentFailure>,
    rx: Receiver<EnvironmentFailure>,
    last: Mutex<Option<EnvironmentFailure>>,
    published: AtomicU64,
}

impl Default for FailureChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureChannel {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(FAILURE_QUEUE_CAPACITY);
        Self {
            tx,
            rx,
            last: Mutex::new(None),
            published: AtomicU64::new(0),
        }
    }

    /// Publishes a failure. Never blocks.
    pub fn publish(&self, failure: EnvironmentFailure) {
        self.published.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some(failure.clone());
        match self.tx.try_send(failure) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::debug!(node = %dropped.node, "Failure queue full, keeping last failure only");
            }
        }
    }

    /// Receiver of published failures.
    ///
    /// All receivers share one queue: each failure is delivered once.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<EnvironmentFailure> {
        self.rx.clone()
    }

    /// Most recent failure, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<EnvironmentFailure> {
        self.last.lock().clone()
    }

    /// Failures published since creation.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
