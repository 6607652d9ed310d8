//! Error types for the node cache.
//!
//! Only conditions that a caller can act on are surfaced here. Transient
//! eviction races are resolved inside the evictor, and durable-flush failures
//! travel on the [`FailureChannel`](crate::failure::FailureChannel) rather than
//! through a return value.

use thiserror::Error;

use crate::config::ConfigError;
use crate::node::NodeId;

/// Result type alias for node cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node cache operations.
///
/// Error codes follow the pattern `NCACHE-XXX` for easy grepping in logs.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected (NCACHE-001).
    #[error("[NCACHE-001] Configuration error: {0}")]
    Config(String),

    /// Node is not resident in the cache (NCACHE-002).
    ///
    /// Returned when a handle was evicted or replaced by a delta before the
    /// call reached it.
    #[error("[NCACHE-002] Node {0} is not resident")]
    NodeNotResident(NodeId),

    /// Slot index out of range for a leaf container (NCACHE-003).
    #[error("[NCACHE-003] Slot {slot} out of range for node {node} ({len} slots)")]
    InvalidSlot {
        /// Node the slot was addressed in.
        node: NodeId,
        /// Requested slot index.
        slot: usize,
        /// Number of slots the node holds.
        len: usize,
    },

    /// Durable write of a dirty node failed (NCACHE-004).
    #[error("[NCACHE-004] Flush of node {node} failed: {reason}")]
    Flush {
        /// Node that could not be written.
        node: NodeId,
        /// Reason reported by the log collaborator.
        reason: String,
    },

    /// Structural removal delegated to the tree failed (NCACHE-005).
    #[error("[NCACHE-005] Tree mutation error: {0}")]
    Tree(String),

    /// Internal error (NCACHE-006).
    ///
    /// Indicates a broken invariant. Please report if encountered.
    #[error("[NCACHE-006] Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code (e.g., "NCACHE-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "NCACHE-001",
            Self::NodeNotResident(_) => "NCACHE-002",
            Self::InvalidSlot { .. } => "NCACHE-003",
            Self::Flush { .. } => "NCACHE-004",
            Self::Tree(_) => "NCACHE-005",
            Self::Internal(_) => "NCACHE-006",
        }
    }

    /// Returns true if this error is recoverable.
    ///
    /// A failed flush leaves the node resident and dirty, so the write can be
    /// retried. Broken invariants cannot.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
