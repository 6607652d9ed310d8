//! State shared by the cache façade, the evictor and its daemon.
//!
//! # Lock Ordering
//!
//! 1. Node latch (a parent latch only after the child latch was released,
//!    except while registering a new child)
//! 2. Registry shard lock or LRU shard lock, never both
//!
//! Every method taking a `&mut NodeBody` expects the caller to hold that
//! node's latch.

use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::budget::MemoryBudget;
use crate::collaborators::{DurableLocation, FlushRequest, LogWriter, TreeMutator};
use crate::compactor::NodeCompactor;
use crate::config::NodeCacheConfig;
use crate::error::{Error, Result};
use crate::evictor::EvictionStats;
use crate::failure::{EnvironmentFailure, FailureChannel, FailureKind};
use crate::lru::LruShards;
use crate::node::{estimate_bytes, NodeBody, NodeHandle, NodeKind, NodeSpec, Residency};
use crate::registry::NodeRegistry;

/// Nodes removed from the tree by one structural cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Removal {
    pub(crate) nodes: usize,
    pub(crate) bytes: u64,
}

/// Outcome of discarding a handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Discarded {
    pub(crate) bytes: u64,
    /// The node was counted in its parent's resident children.
    pub(crate) parent_counted: bool,
}

pub(crate) struct CacheInner {
    pub(crate) config: NodeCacheConfig,
    pub(crate) registry: NodeRegistry,
    pub(crate) lru: LruShards,
    pub(crate) budget: MemoryBudget,
    pub(crate) compactor: NodeCompactor,
    pub(crate) stats: EvictionStats,
    pub(crate) failures: FailureChannel,
    pub(crate) log: Arc<dyn LogWriter>,
    pub(crate) tree: Arc<dyn TreeMutator>,
    /// Round-robin start shard of the next pass.
    pub(crate) next_shard: AtomicUsize,
    /// A background daemon serves this cache.
    pub(crate) has_daemon: bool,
}

impl fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInner")
            .field("config", &self.config)
            .field("resident", &self.registry.len())
            .field("budget", &self.budget)
            .field("has_daemon", &self.has_daemon)
            .finish_non_exhaustive()
    }
}

impl CacheInner {
    pub(crate) fn new(
        config: NodeCacheConfig,
        log: Arc<dyn LogWriter>,
        tree: Arc<dyn TreeMutator>,
        has_daemon: bool,
    ) -> Self {
        Self {
            registry: NodeRegistry::new(),
            lru: LruShards::new(config.cache.lru_shards),
            budget: MemoryBudget::new(config.cache.max_memory_bytes),
            compactor: NodeCompactor::new(config.evictor.delta_threshold),
            stats: EvictionStats::new(),
            failures: FailureChannel::new(),
            log,
            tree,
            next_shard: AtomicUsize::new(0),
            has_daemon,
            config,
        }
    }

    /// Registers a node, or returns the resident handle for its id.
    ///
    /// A new node goes to the hot end when `promote` is set. Otherwise it is
    /// tracked at the cold end and flagged fresh, so the evictor can still
    /// reach it if the operation that loaded it never finishes.
    ///
    /// The returned handle carries one pin for the caller, taken before any
    /// pass can see the node.
    ///
    /// Returns the handle and whether this call created it.
    pub(crate) fn register(&self, spec: &NodeSpec, promote: bool) -> (Arc<NodeHandle>, bool) {
        loop {
            let parent = spec.parent.and_then(|p| self.registry.get(p));
            let mut parent_body = parent.as_ref().map(|p| p.latch());
            let counted = matches!(parent_body.as_deref(), Some(pb) if pb.is_resident());

            let mut body = NodeBody::from_spec(spec);
            body.parent_counted = counted;
            body.fresh = !promote;
            body.pins = 1;
            let bytes = body.approx_bytes;
            let handle = Arc::new(NodeHandle::new(
                spec.id,
                spec.kind,
                spec.parent,
                self.lru.shard_for(spec.id),
                body,
            ));

            self.budget.add(bytes);
            match self.registry.insert_if_absent(handle) {
                Ok(handle) => {
                    if let Some(pb) = parent_body.as_mut().filter(|_| counted) {
                        pb.resident_children += 1;
                    }
                    drop(parent_body);
                    let mut body = handle.latch();
                    if promote {
                        self.lru.touch_locked(&handle, &mut body, true);
                    } else {
                        self.lru.track_cold_locked(&handle, &mut body);
                    }
                    drop(body);
                    return (handle, true);
                }
                Err(existing) => {
                    self.budget.sub(bytes);
                    drop(parent_body);
                    let mut body = existing.latch();
                    if !body.is_resident() {
                        // Being discarded by another thread; its registry
                        // entry goes away once that thread releases the latch.
                        drop(body);
                        std::thread::yield_now();
                        continue;
                    }
                    body.pins += 1;
                    if promote {
                        self.lru.touch_locked(&existing, &mut body, true);
                    }
                    drop(body);
                    return (existing, false);
                }
            }
        }
    }

    /// Resident handle currently registered for the node behind `node`.
    ///
    /// A handle superseded by a delta or a reconstituted node resolves to its
    /// successor.
    pub(crate) fn current(&self, node: &Arc<NodeHandle>) -> Option<Arc<NodeHandle>> {
        if node.is_resident() {
            return Some(Arc::clone(node));
        }
        self.registry.get(node.id())
    }

    /// Fully evicts a node: untracks it, discards the handle and releases its
    /// bytes. The parent is not touched; see [`Self::release_parent`].
    pub(crate) fn discard_locked(&self, node: &Arc<NodeHandle>, body: &mut NodeBody) -> Discarded {
        self.lru.untrack_locked(node, body);
        body.residency = Residency::Evicted;
        node.bump_generation();
        let parent_counted = std::mem::take(&mut body.parent_counted);
        self.budget.sub(body.approx_bytes);
        self.registry.remove(node);
        Discarded {
            bytes: body.approx_bytes,
            parent_counted,
        }
    }

    /// Drops a discarded child from its parent's resident-children count.
    ///
    /// Returns the parent if it has no resident child left.
    pub(crate) fn release_parent(
        &self,
        child: &NodeHandle,
        discarded: Discarded,
    ) -> Option<Arc<NodeHandle>> {
        if !discarded.parent_counted {
            return None;
        }
        let parent = self.registry.get(child.parent()?)?;
        let mut body = parent.latch();
        if !body.is_resident() {
            return None;
        }
        body.resident_children = body.resident_children.saturating_sub(1);
        let childless = body.resident_children == 0;
        drop(body);
        childless.then_some(parent)
    }

    /// Sets the approximate size of a node, keeping all totals in step.
    pub(crate) fn resize_locked(&self, body: &mut NodeBody, new_bytes: u64) {
        let old = body.approx_bytes;
        if old == new_bytes {
            return;
        }
        body.approx_bytes = new_bytes;
        self.budget.apply_delta(old, new_bytes);
        self.lru.resize_locked(body, old, new_bytes);
    }

    /// Recomputes the size estimate after a slot or entry change.
    pub(crate) fn refresh_size_locked(&self, kind: NodeKind, body: &mut NodeBody) {
        let bytes = estimate_bytes(kind, body.is_delta, &body.slots, body.entries);
        self.resize_locked(body, bytes);
    }

    pub(crate) fn mark_dirty_locked(
        &self,
        node: &NodeHandle,
        body: &mut NodeBody,
        slot: Option<usize>,
    ) -> Result<()> {
        if let Some(idx) = slot {
            let len = body.slots.len();
            let entry = body.slots.get_mut(idx).ok_or(Error::InvalidSlot {
                node: node.id(),
                slot: idx,
                len,
            })?;
            entry.dirty = true;
        }
        body.dirty = true;
        node.bump_generation();
        Ok(())
    }

    /// Installs `new_body` as the successor of `old`.
    ///
    /// The successor takes over the LRU position (moved to the hot end), the
    /// registry entry and the parent's child count.
    pub(crate) fn replace_locked(
        &self,
        old: &Arc<NodeHandle>,
        old_body: &mut NodeBody,
        mut new_body: NodeBody,
    ) -> Arc<NodeHandle> {
        new_body.parent_counted = std::mem::take(&mut old_body.parent_counted);
        let new_bytes = new_body.approx_bytes;
        let new = Arc::new(NodeHandle::new(
            old.id(),
            old.kind(),
            old.parent(),
            old.shard(),
            new_body,
        ));
        {
            let mut body = new.latch();
            self.lru.replace_locked(old_body, &new, &mut body);
        }
        self.budget.apply_delta(old_body.approx_bytes, new_bytes);
        old_body.residency = Residency::Replaced;
        old.bump_generation();
        let swapped = self.registry.replace(old, Arc::clone(&new));
        debug_assert!(swapped, "replaced handle was not registered");
        new
    }

    /// Writes a dirty node through the log.
    pub(crate) fn flush_locked(
        &self,
        node: &NodeHandle,
        body: &NodeBody,
    ) -> Result<DurableLocation> {
        let request = FlushRequest {
            id: node.id(),
            kind: node.kind(),
            is_delta: body.is_delta,
            slots: &body.slots,
            entries: body.entries,
            approx_bytes: body.approx_bytes,
        };
        self.log.flush(&request)
    }

    /// Signals a failed flush on the failure channel.
    pub(crate) fn report_flush_failure(&self, node: &NodeHandle, err: &Error) {
        self.stats.record_flush_failure();
        tracing::error!(node = %node.id(), error = %err, "Dirty node flush failed, node stays resident");
        self.failures.publish(EnvironmentFailure {
            kind: FailureKind::FlushFailed,
            node: node.id(),
            message: err.to_string(),
        });
    }

    /// Removes `node` from the tree if it is empty, then its parent if that
    /// leaves the parent empty, and so on upwards.
    pub(crate) fn remove_empty(&self, node: &Arc<NodeHandle>) -> Result<Removal> {
        let mut removed = Removal::default();
        let mut next = Some(Arc::clone(node));
        while let Some(node) = next.take() {
            let mut body = node.latch();
            if !body.is_resident() || body.pins > 0 || !is_structurally_empty(node.kind(), &body) {
                break;
            }
            match self.tree.remove_empty_node(node.id(), node.parent()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    drop(body);
                    tracing::warn!(node = %node.id(), error = %err, "Structural removal failed");
                    self.failures.publish(EnvironmentFailure {
                        kind: FailureKind::StructuralRemovalFailed,
                        node: node.id(),
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
            let discarded = self.discard_locked(&node, &mut body);
            drop(body);
            removed.nodes += 1;
            removed.bytes += discarded.bytes;
            self.stats.record_structural_removal();
            tracing::trace!(node = %node.id(), "Empty node removed from tree");
            next = self.detach_from_parent(&node, discarded);
        }
        Ok(removed)
    }

    /// Drops one entry of the parent of a structurally removed node.
    ///
    /// Returns the parent if it has no entry left.
    fn detach_from_parent(&self, child: &NodeHandle, discarded: Discarded) -> Option<Arc<NodeHandle>> {
        let parent = self.registry.get(child.parent()?)?;
        let mut body = parent.latch();
        if !body.is_resident() {
            return None;
        }
        body.entries = body.entries.saturating_sub(1);
        if discarded.parent_counted {
            body.resident_children = body.resident_children.saturating_sub(1);
        }
        body.dirty = true;
        parent.bump_generation();
        self.refresh_size_locked(parent.kind(), &mut body);
        let empty = body.entries == 0;
        drop(body);
        empty.then_some(parent)
    }

    /// Checks tracking invariants at a quiescent point.
    pub(crate) fn verify_residency(&self) -> Result<()> {
        let mut tracked = FxHashSet::default();
        for shard in self.lru.iter() {
            let mut bytes = 0u64;
            for (position, node) in shard.entries() {
                let body = node.latch();
                if !body.is_resident() {
                    return Err(Error::Internal(format!(
                        "{} tracked in {} but not resident",
                        node.id(),
                        shard.id()
                    )));
                }
                match body.membership {
                    Some(m) if m.shard == shard.id() && m.position == position => {}
                    other => {
                        return Err(Error::Internal(format!(
                            "{} found in {} at {} but membership is {other:?}",
                            node.id(),
                            shard.id(),
                            position.index()
                        )));
                    }
                }
                if !tracked.insert(node.id()) {
                    return Err(Error::Internal(format!("{} tracked twice", node.id())));
                }
                bytes += body.approx_bytes;
            }
            if bytes != shard.tracked_bytes() {
                return Err(Error::Internal(format!(
                    "{} accounts {} bytes, members hold {bytes}",
                    shard.id(),
                    shard.tracked_bytes()
                )));
            }
        }

        let mut used = 0u64;
        for node in self.registry.handles() {
            let body = node.latch();
            if !body.is_resident() {
                return Err(Error::Internal(format!(
                    "{} registered but not resident",
                    node.id()
                )));
            }
            if body.membership.is_some() != tracked.contains(&node.id()) {
                return Err(Error::Internal(format!(
                    "{} membership disagrees with its shard",
                    node.id()
                )));
            }
            used += body.approx_bytes;
        }
        if used != self.budget.used() {
            return Err(Error::Internal(format!(
                "budget accounts {} bytes, resident nodes hold {used}",
                self.budget.used()
            )));
        }
        Ok(())
    }
}

/// Whether a node has no structural purpose left.
pub(crate) fn is_structurally_empty(kind: NodeKind, body: &NodeBody) -> bool {
    match kind {
        NodeKind::LeafContainer => !body.is_delta && body.slots.is_empty(),
        NodeKind::Internal => body.entries == 0 && body.resident_children == 0,
    }
}
