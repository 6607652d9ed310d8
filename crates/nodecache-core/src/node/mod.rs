//! Resident tree nodes as seen by the cache.
//!
//! The cache never owns node content. It keeps a [`NodeHandle`] per resident
//! node carrying what residency decisions need: kind, dirtiness, delta flag,
//! approximate size, per-slot record residency and LRU membership. Parent and
//! child relations are expressed as [`NodeId`] lookups into the registry, so
//! handles never point at each other.

mod handle;

pub use handle::{NodeHandle, NodeSnapshot};
pub(crate) use handle::{NodeBody, Residency};

use bytes::Bytes;
use std::fmt;

/// Fixed per-node overhead of an internal node.
pub const INTERNAL_NODE_OVERHEAD: u64 = 128;

/// Fixed per-node overhead of a full leaf container.
pub const LEAF_CONTAINER_OVERHEAD: u64 = 128;

/// Fixed per-node overhead of a delta leaf container.
pub const DELTA_OVERHEAD: u64 = 64;

/// Bytes per child reference held by an internal node.
pub const INTERNAL_ENTRY_BYTES: u64 = 24;

/// Bytes per leaf slot, excluding its key and record.
pub const SLOT_OVERHEAD: u64 = 16;

/// Stable identity of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Non-leaf node holding only child references.
    Internal,
    /// Bottom-level node holding slots that reference leaf records.
    LeafContainer,
}

/// One slot of a leaf container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSlot {
    /// Slot key.
    pub key: Bytes,
    /// Size of the referenced leaf record when resident.
    pub record_bytes: u32,
    /// Whether the leaf record is held in memory.
    pub resident: bool,
    /// Whether the slot changed since the container was last made durable.
    pub dirty: bool,
}

impl LeafSlot {
    /// A clean slot whose record is not resident.
    #[must_use]
    pub fn new(key: impl Into<Bytes>, record_bytes: u32) -> Self {
        Self {
            key: key.into(),
            record_bytes,
            resident: false,
            dirty: false,
        }
    }

    /// Marks the record resident.
    #[must_use]
    pub fn with_resident_record(mut self) -> Self {
        self.resident = true;
        self
    }

    /// Marks the slot dirty.
    #[must_use]
    pub fn dirty(mut self) -> Self {
        self.dirty = true;
        self
    }

    /// Bytes the slot itself occupies in its container.
    #[must_use]
    pub fn slot_bytes(&self) -> u64 {
        SLOT_OVERHEAD + self.key.len() as u64
    }

    /// Bytes of the resident record, zero when absent.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        if self.resident {
            u64::from(self.record_bytes)
        } else {
            0
        }
    }
}

/// Description of a node being made resident.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Node identity.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Parent node, `None` for the root.
    pub parent: Option<NodeId>,
    /// Slots of a leaf container; empty for internal nodes.
    pub slots: Vec<LeafSlot>,
    /// Child references of an internal node.
    pub entries: u32,
    /// Whether the node is dirty when loaded (newly built by a mutation).
    pub dirty: bool,
}

impl NodeSpec {
    /// An internal node with `entries` child references.
    #[must_use]
    pub fn internal(id: NodeId, parent: Option<NodeId>, entries: u32) -> Self {
        Self {
            id,
            kind: NodeKind::Internal,
            parent,
            slots: Vec::new(),
            entries,
            dirty: false,
        }
    }

    /// A leaf container holding `slots`.
    #[must_use]
    pub fn leaf(id: NodeId, parent: Option<NodeId>, slots: Vec<LeafSlot>) -> Self {
        Self {
            id,
            kind: NodeKind::LeafContainer,
            parent,
            slots,
            entries: 0,
            dirty: false,
        }
    }

    /// Marks the node dirty, as for a node newly built by a tree mutation.
    #[must_use]
    pub fn dirty(mut self) -> Self {
        self.dirty = true;
        self
    }
}

/// Whether a node may be fully reclaimed without discarding anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Clean, unpinned, without resident children or records.
    Eligible,
    /// Not resident.
    NotResident,
    /// Holds changes that are not durable yet.
    Dirty,
    /// A cursor is positioned on the node.
    Pinned,
    /// An internal node with resident children.
    HasResidentChildren,
    /// A leaf container still holding resident leaf records.
    HasResidentRecords,
}

/// Estimated resident size of a node body.
#[must_use]
pub fn estimate_bytes(kind: NodeKind, is_delta: bool, slots: &[LeafSlot], entries: u32) -> u64 {
    match kind {
        NodeKind::Internal => INTERNAL_NODE_OVERHEAD + u64::from(entries) * INTERNAL_ENTRY_BYTES,
        NodeKind::LeafContainer => {
            let overhead = if is_delta {
                DELTA_OVERHEAD
            } else {
                LEAF_CONTAINER_OVERHEAD
            };
            overhead
                + slots
                    .iter()
                    .map(|s| s.slot_bytes() + s.resident_bytes())
                    .sum::<u64>()
        }
    }
}
