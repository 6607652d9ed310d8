//! External collaborators of the cache.
//!
//! The cache never writes node content or changes tree structure itself. A
//! [`LogWriter`] makes dirty nodes durable before they are reclaimed, and a
//! [`TreeMutator`] performs structural removal of empty nodes.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::node::{LeafSlot, NodeId, NodeKind};

/// Location of a durable write in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DurableLocation {
    /// Log file number.
    pub file: u32,
    /// Byte offset inside the file.
    pub offset: u64,
}

/// View of a dirty node handed to the log for a durable write.
#[derive(Debug, Clone, Copy)]
pub struct FlushRequest<'a> {
    /// Node identity.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Whether only the dirty slots are present.
    pub is_delta: bool,
    /// Slots of a leaf container.
    pub slots: &'a [LeafSlot],
    /// Child references of an internal node.
    pub entries: u32,
    /// Approximate size of the node.
    pub approx_bytes: u64,
}

/// Durable write path for dirty nodes.
///
/// Called with the node latch held; implementations must not call back into
/// the cache for the same node.
pub trait LogWriter: Send + Sync {
    /// Writes `node` durably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Flush`](crate::Error::Flush) if the write fails. The
    /// node then stays resident and dirty.
    fn flush(&self, node: &FlushRequest<'_>) -> Result<DurableLocation>;
}

/// Structural operations on the tree.
pub trait TreeMutator: Send + Sync {
    /// Removes an empty node from its parent.
    ///
    /// Returns false if the tree decided to keep the node (for example the
    /// root, or a node that received new entries in the meantime).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tree`](crate::Error::Tree) if the removal failed.
    fn remove_empty_node(&self, node: NodeId, parent: Option<NodeId>) -> Result<bool>;
}

/// Log that accepts every write, assigning increasing offsets in file 0.
#[derive(Debug, Default)]
pub struct NullLog {
    next_offset: AtomicU64,
}

impl NullLog {
    /// Creates a log starting at offset 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogWriter for NullLog {
    fn flush(&self, node: &FlushRequest<'_>) -> Result<DurableLocation> {
        let offset = self
            .next_offset
            .fetch_add(node.approx_bytes.max(1), Ordering::AcqRel);
        Ok(DurableLocation { file: 0, offset })
    }
}

/// Tree that keeps every node; structural removal never happens.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainingTree;

impl TreeMutator for RetainingTree {
    fn remove_empty_node(&self, _node: NodeId, _parent: Option<NodeId>) -> Result<bool> {
        Ok(false)
    }
}
