//! Node handle and its latch-protected body.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{estimate_bytes, Eligibility, LeafSlot, NodeId, NodeKind, NodeSpec};
use crate::lru::{ListMembership, ShardId};

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Residency {
    Resident,
    /// Fully evicted; the handle is discarded.
    Evicted,
    /// Superseded by a new handle for the same node (delta compaction or
    /// reconstitution).
    Replaced,
}

/// Mutable state of a resident node, guarded by the node latch.
#[derive(Debug)]
pub(crate) struct NodeBody {
    pub(crate) residency: Residency,
    pub(crate) dirty: bool,
    pub(crate) is_delta: bool,
    pub(crate) approx_bytes: u64,
    pub(crate) slots: Vec<LeafSlot>,
    /// Child references of an internal node.
    pub(crate) entries: u32,
    /// Children currently resident in the cache.
    pub(crate) resident_children: u32,
    pub(crate) pins: u32,
    /// Whether this node is counted in its parent's `resident_children`.
    pub(crate) parent_counted: bool,
    pub(crate) membership: Option<ListMembership>,
    /// Loaded at the cold end by a mode that may discard it, and its first
    /// operation has not decided yet.
    pub(crate) fresh: bool,
}

impl NodeBody {
    pub(crate) fn from_spec(spec: &NodeSpec) -> Self {
        Self {
            residency: Residency::Resident,
            dirty: spec.dirty || spec.slots.iter().any(|s| s.dirty),
            is_delta: false,
            approx_bytes: estimate_bytes(spec.kind, false, &spec.slots, spec.entries),
            slots: spec.slots.clone(),
            entries: spec.entries,
            resident_children: 0,
            pins: 0,
            parent_counted: false,
            membership: None,
            fresh: false,
        }
    }

    pub(crate) fn is_resident(&self) -> bool {
        self.residency == Residency::Resident
    }

    pub(crate) fn resident_leaf_count(&self) -> u32 {
        self.slots.iter().filter(|s| s.resident).count() as u32
    }

    /// Bytes of every entry: slot plus resident record.
    pub(crate) fn full_entry_bytes(&self) -> u64 {
        self.slots.iter().map(entry_bytes).sum()
    }

    /// Bytes of the dirty entries, resident records included.
    pub(crate) fn dirty_entry_bytes(&self) -> u64 {
        self.slots.iter().filter(|s| s.dirty).map(entry_bytes).sum()
    }

    pub(crate) fn clean_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.dirty).count()
    }

    /// Clears the dirty state of the node and all of its slots.
    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
        for slot in &mut self.slots {
            slot.dirty = false;
        }
    }

    pub(crate) fn eligibility(&self, kind: NodeKind) -> Eligibility {
        if !self.is_resident() {
            Eligibility::NotResident
        } else if self.pins > 0 {
            Eligibility::Pinned
        } else if self.dirty {
            Eligibility::Dirty
        } else if kind == NodeKind::Internal && self.resident_children > 0 {
            Eligibility::HasResidentChildren
        } else if self.resident_leaf_count() > 0 {
            Eligibility::HasResidentRecords
        } else {
            Eligibility::Eligible
        }
    }
}

fn entry_bytes(slot: &LeafSlot) -> u64 {
    slot.slot_bytes() + slot.resident_bytes()
}

/// Point-in-time copy of a handle's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node identity.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Whether the handle is still resident.
    pub resident: bool,
    /// Dirty flag.
    pub dirty: bool,
    /// Delta flag.
    pub is_delta: bool,
    /// Approximate resident bytes.
    pub approx_bytes: u64,
    /// Number of slots (leaf containers).
    pub slot_count: usize,
    /// Resident leaf records (leaf containers).
    pub resident_leaf_count: u32,
    /// Child references (internal nodes).
    pub entries: u32,
    /// Resident children (internal nodes).
    pub resident_children: u32,
    /// Pin count.
    pub pins: u32,
    /// LRU membership, `None` when untracked.
    pub membership: Option<ListMembership>,
    /// Generation at the time of the snapshot.
    pub generation: u64,
}

/// Descriptor of one resident tree node.
///
/// The generation counter advances on every change that should invalidate an
/// eviction decision taken on an older view of the node (touch, dirtying,
/// eviction, replacement). Readers compare generations instead of holding a
/// lock across selection and reclamation.
#[derive(Debug)]
pub struct NodeHandle {
    id: NodeId,
    kind: NodeKind,
    parent: Option<NodeId>,
    shard: ShardId,
    generation: AtomicU64,
    body: Mutex<NodeBody>,
}

impl NodeHandle {
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        parent: Option<NodeId>,
        shard: ShardId,
        body: NodeBody,
    ) -> Self {
        Self {
            id,
            kind,
            parent,
            shard,
            generation: AtomicU64::new(0),
            body: Mutex::new(body),
        }
    }

    /// Node identity.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Parent node, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Shard the node is tracked in.
    #[must_use]
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Acquires the node latch.
    pub(crate) fn latch(&self) -> MutexGuard<'_, NodeBody> {
        self.body.lock()
    }

    /// Whether the handle still describes a resident node.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.latch().is_resident()
    }

    /// Dirty flag.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.latch().dirty
    }

    /// Delta flag.
    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.latch().is_delta
    }

    /// Approximate resident bytes.
    #[must_use]
    pub fn approx_bytes(&self) -> u64 {
        self.latch().approx_bytes
    }

    /// Number of resident leaf records.
    #[must_use]
    pub fn resident_leaf_count(&self) -> u32 {
        self.latch().resident_leaf_count()
    }

    /// LRU membership, `None` when evicted or not yet tracked.
    #[must_use]
    pub fn membership(&self) -> Option<ListMembership> {
        self.latch().membership
    }

    /// Copies the handle state.
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        let body = self.latch();
        NodeSnapshot {
            id: self.id,
            kind: self.kind,
            resident: body.is_resident(),
            dirty: body.dirty,
            is_delta: body.is_delta,
            approx_bytes: body.approx_bytes,
            slot_count: body.slots.len(),
            resident_leaf_count: body.resident_leaf_count(),
            entries: body.entries,
            resident_children: body.resident_children,
            pins: body.pins,
            membership: body.membership,
            generation: self.generation(),
        }
    }
}
