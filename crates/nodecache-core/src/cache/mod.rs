//! The node cache.
//!
//! [`NodeCache`] is owned by one storage environment and passed by reference
//! to every operation. It ties together the resident-node registry, the LRU
//! shards, memory accounting, the evictor and the collaborators.
//!
//! # Example
//!
//! ```rust
//! use nodecache_core::{CacheMode, LeafSlot, NodeCache, NodeCacheConfig, NodeId, NodeSpec, OpEffect};
//!
//! let cache = NodeCache::new(NodeCacheConfig::default().with_background_evictor(false))?;
//! let loaded = cache.load_node(
//!     NodeSpec::leaf(NodeId(1), None, vec![LeafSlot::new(&b"key"[..], 64)]),
//!     CacheMode::Default,
//! );
//! let outcome = cache.finish_op(&loaded.handle, CacheMode::EvictLn, OpEffect::read(0))?;
//! assert_eq!(outcome.record_resident, Some(false));
//! # Ok::<(), nodecache_core::Error>(())
//! ```

pub(crate) mod inner;

use std::fmt;
use std::sync::Arc;

use self::inner::{is_structurally_empty, CacheInner, Discarded};
use crate::cache_mode::{resolve_cache_mode, CacheMode, ContainerPolicy, RecordPolicy};
use crate::collaborators::{LogWriter, NullLog, RetainingTree, TreeMutator};
use crate::compactor::{merge_slots, NotEligible};
use crate::config::NodeCacheConfig;
use crate::cursor::CursorResidency;
use crate::error::{Error, Result};
use crate::evictor::{run_pass, EvictionSource, EvictionStatsSnapshot, EvictorDaemon, PassReport};
use crate::failure::FailureChannel;
use crate::node::{
    estimate_bytes, Eligibility, LeafSlot, NodeBody, NodeHandle, NodeId, NodeKind, NodeSpec,
    Residency,
};

/// Result of [`NodeCache::load_node`].
#[derive(Debug, Clone)]
pub struct Loaded {
    /// Resident handle of the node.
    pub handle: Arc<NodeHandle>,
    /// Whether this call made the node resident.
    pub newly_loaded: bool,
}

/// Leaf record touched by an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpEffect {
    /// Slot of the leaf record, `None` if the operation only visited the
    /// container.
    pub slot: Option<usize>,
    /// New size of the record, when the operation read or wrote it.
    pub record_bytes: Option<u32>,
    /// Whether the operation dirtied the container.
    pub dirtied: bool,
}

impl OpEffect {
    /// The operation visited the container only.
    #[must_use]
    pub fn container_only() -> Self {
        Self::default()
    }

    /// The operation read the record in `slot`.
    #[must_use]
    pub fn read(slot: usize) -> Self {
        Self {
            slot: Some(slot),
            ..Self::default()
        }
    }

    /// The operation wrote the record in `slot`, dirtying the container.
    #[must_use]
    pub fn write(slot: usize) -> Self {
        Self {
            slot: Some(slot),
            record_bytes: None,
            dirtied: true,
        }
    }

    /// Sets the record size observed by the operation.
    #[must_use]
    pub fn with_record_bytes(mut self, bytes: u32) -> Self {
        self.record_bytes = Some(bytes);
        self
    }
}

/// What happened to the container at the end of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOutcome {
    /// Moved to the hot end (tracked if it was not).
    Promoted,
    /// LRU position left alone.
    Kept,
    /// Newly loaded but could not be discarded; tracked without promotion.
    Tracked,
    /// Eviction postponed until the cursor leaves the node.
    Deferred,
    /// Discarded from the cache.
    Evicted,
    /// The node was no longer resident.
    Absent,
}

/// Result of applying a cache mode after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpOutcome {
    /// Container effect.
    pub container: ContainerOutcome,
    /// Residency of the touched leaf record, `None` if no record was touched.
    pub record_resident: Option<bool>,
}

/// Builder for [`NodeCache`] with custom collaborators.
pub struct NodeCacheBuilder {
    config: NodeCacheConfig,
    log: Arc<dyn LogWriter>,
    tree: Arc<dyn TreeMutator>,
}

impl fmt::Debug for NodeCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCacheBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NodeCacheBuilder {
    /// Sets the log used to flush dirty nodes.
    #[must_use]
    pub fn log(mut self, log: Arc<dyn LogWriter>) -> Self {
        self.log = log;
        self
    }

    /// Sets the tree used for structural removal.
    #[must_use]
    pub fn tree(mut self, tree: Arc<dyn TreeMutator>) -> Self {
        self.tree = tree;
        self
    }

    /// Validates the configuration and builds the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration, or
    /// [`Error::Internal`] if the background thread cannot be spawned.
    pub fn build(self) -> Result<NodeCache> {
        self.config.validate()?;
        let background = self.config.evictor.background;
        let inner = Arc::new(CacheInner::new(self.config, self.log, self.tree, background));
        let daemon = if background {
            Some(EvictorDaemon::spawn(Arc::clone(&inner))?)
        } else {
            None
        };
        tracing::info!(
            max_memory = inner.budget.max(),
            shards = inner.lru.len(),
            background,
            "Node cache created"
        );
        Ok(NodeCache { inner, daemon })
    }
}

/// In-memory cache of B-tree nodes with bounded resident memory.
pub struct NodeCache {
    inner: Arc<CacheInner>,
    daemon: Option<EvictorDaemon>,
}

impl fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCache")
            .field("inner", &self.inner)
            .field("daemon", &self.daemon.is_some())
            .finish()
    }
}

impl Drop for NodeCache {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop();
        }
    }
}

impl NodeCache {
    /// Creates a cache with the default collaborators.
    ///
    /// Dirty nodes are "flushed" to a [`NullLog`] and empty nodes are never
    /// removed from the tree.
    ///
    /// # Errors
    ///
    /// See [`NodeCacheBuilder::build`].
    pub fn new(config: NodeCacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(config: NodeCacheConfig) -> NodeCacheBuilder {
        NodeCacheBuilder {
            config,
            log: Arc::new(NullLog::new()),
            tree: Arc::new(RetainingTree),
        }
    }

    /// Configuration the cache was built with.
    #[must_use]
    pub fn config(&self) -> &NodeCacheConfig {
        &self.inner.config
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &CacheInner {
        &self.inner
    }

    /// Resolves the effective mode of an operation against the environment
    /// default of this cache.
    #[must_use]
    pub fn resolve_cache_mode(
        &self,
        op_override: Option<CacheMode>,
        cursor_default: Option<CacheMode>,
        db_default: Option<CacheMode>,
    ) -> CacheMode {
        resolve_cache_mode(
            op_override,
            cursor_default,
            db_default,
            self.inner.config.cache.default_cache_mode,
        )
    }

    // ---- residency ----

    /// Makes a node resident, or returns the resident handle for its id.
    ///
    /// Under `Default` and `EvictLn` the node is tracked at the hot end right
    /// away. Under `Unchanged` and `EvictBin` a newly loaded node waits at the
    /// cold end until [`finish_op`](Self::finish_op) decides whether to keep
    /// it.
    ///
    /// The pass a load may trigger never reclaims the loaded node itself.
    /// Use [`load_pinned`](Self::load_pinned) to keep it safe from other
    /// threads' passes until the operation is over.
    pub fn load_node(&self, spec: NodeSpec, mode: CacheMode) -> Loaded {
        let loaded = self.load_pinned(spec, mode);
        self.unpin(&loaded.handle);
        loaded
    }

    /// Like [`load_node`](Self::load_node), but the handle comes back with a
    /// pin held for the caller, so no pass evicts or compacts it before
    /// [`unpin`](Self::unpin). While pinned, modes that would discard the
    /// container track it instead.
    pub fn load_pinned(&self, spec: NodeSpec, mode: CacheMode) -> Loaded {
        let (handle, newly_loaded) = self.inner.register(&spec, mode.promotes_on_load());
        if newly_loaded {
            tracing::trace!(node = %spec.id, %mode, "Node loaded");
            self.check_budget();
        }
        Loaded {
            handle,
            newly_loaded,
        }
    }

    /// Current resident handle for `id`.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Arc<NodeHandle>> {
        self.inner.registry.get(id)
    }

    /// Applies the per-mode table to a container after an operation that did
    /// not address a particular record.
    ///
    /// A node evicted meanwhile yields [`ContainerOutcome::Absent`].
    ///
    /// # Errors
    ///
    /// None today: a container-only operation names no slot. The `Result`
    /// matches [`finish_op`](Self::finish_op).
    pub fn touch(
        &self,
        node: &Arc<NodeHandle>,
        mode: CacheMode,
        is_write_that_dirtied: bool,
    ) -> Result<OpOutcome> {
        let effect = OpEffect {
            dirtied: is_write_that_dirtied,
            ..OpEffect::container_only()
        };
        self.apply_op(node, mode, effect, false)
    }

    /// Applies the per-mode table at the end of an operation.
    ///
    /// A node evicted meanwhile yields [`ContainerOutcome::Absent`] and no
    /// record residency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSlot`] if `effect.slot` is out of range.
    pub fn finish_op(
        &self,
        node: &Arc<NodeHandle>,
        mode: CacheMode,
        effect: OpEffect,
    ) -> Result<OpOutcome> {
        self.apply_op(node, mode, effect, false)
    }

    /// Like [`finish_op`](Self::finish_op) for an operation run through a
    /// cursor: container eviction is postponed until the cursor moves off
    /// the node or closes.
    ///
    /// # Errors
    ///
    /// See [`finish_op`](Self::finish_op).
    pub fn finish_cursor_op(
        &self,
        node: &Arc<NodeHandle>,
        mode: CacheMode,
        effect: OpEffect,
    ) -> Result<OpOutcome> {
        self.apply_op(node, mode, effect, true)
    }

    /// Applies the eviction postponed by cursor operations under `mode` when
    /// the cursor moves to another node.
    pub fn deferred_evict_on_cursor_move(
        &self,
        node: &Arc<NodeHandle>,
        mode: CacheMode,
    ) -> ContainerOutcome {
        self.apply_deferred(node, mode)
    }

    /// Applies the eviction postponed by cursor operations under `mode` when
    /// the cursor closes.
    pub fn deferred_evict_on_cursor_close(
        &self,
        node: &Arc<NodeHandle>,
        mode: CacheMode,
    ) -> ContainerOutcome {
        self.apply_deferred(node, mode)
    }

    /// Opens a cursor-scoped residency tracker.
    #[must_use]
    pub fn cursor(&self, default_mode: Option<CacheMode>) -> CursorResidency<'_> {
        CursorResidency::new(self, default_mode)
    }

    fn apply_op(
        &self,
        node: &Arc<NodeHandle>,
        mode: CacheMode,
        effect: OpEffect,
        deferred: bool,
    ) -> Result<OpOutcome> {
        const ABSENT: OpOutcome = OpOutcome {
            container: ContainerOutcome::Absent,
            record_resident: None,
        };
        loop {
            let Some(current) = self.inner.current(node) else {
                return Ok(ABSENT);
            };
            let mut body = current.latch();
            match body.residency {
                Residency::Resident => {}
                // Superseded between lookup and latch; follow the successor.
                Residency::Replaced => continue,
                Residency::Evicted => return Ok(ABSENT),
            }
            let (outcome, discarded) =
                self.apply_op_locked(&current, &mut body, mode, effect, deferred)?;
            drop(body);

            if let Some(discarded) = discarded {
                self.inner.release_parent(&current, discarded);
            }
            self.check_budget();
            return Ok(outcome);
        }
    }

    fn apply_op_locked(
        &self,
        node: &Arc<NodeHandle>,
        body: &mut NodeBody,
        mode: CacheMode,
        effect: OpEffect,
        deferred: bool,
    ) -> Result<(OpOutcome, Option<Discarded>)> {
        let inner = &*self.inner;
        if let Some(idx) = effect.slot {
            if node.kind() != NodeKind::LeafContainer || idx >= body.slots.len() {
                return Err(Error::InvalidSlot {
                    node: node.id(),
                    slot: idx,
                    len: body.slots.len(),
                });
            }
        }
        if effect.dirtied {
            inner.mark_dirty_locked(node, body, effect.slot)?;
        }

        let record_resident = effect
            .slot
            .map(|idx| self.apply_record_policy(node, body, idx, mode, effect.record_bytes));

        let mut discarded = None;
        let container = match mode.container_policy() {
            ContainerPolicy::Promote => {
                inner.lru.touch_locked(node, body, true);
                ContainerOutcome::Promoted
            }
            ContainerPolicy::KeepPosition => {
                if body.membership.is_some() && !body.fresh {
                    ContainerOutcome::Kept
                } else if deferred {
                    ContainerOutcome::Deferred
                } else if evictable_by_mode(node.kind(), body) {
                    discarded = Some(self.evict_by_mode(node, body, mode));
                    ContainerOutcome::Evicted
                } else {
                    inner.lru.touch_locked(node, body, false);
                    ContainerOutcome::Tracked
                }
            }
            ContainerPolicy::EvictUnlessDirty => {
                if !body.dirty && deferred {
                    ContainerOutcome::Deferred
                } else if evictable_by_mode(node.kind(), body) {
                    discarded = Some(self.evict_by_mode(node, body, mode));
                    ContainerOutcome::Evicted
                } else {
                    inner.lru.touch_locked(node, body, true);
                    ContainerOutcome::Promoted
                }
            }
        };
        if container != ContainerOutcome::Deferred {
            body.fresh = false;
        }
        Ok((
            OpOutcome {
                container,
                record_resident,
            },
            discarded,
        ))
    }

    fn apply_record_policy(
        &self,
        node: &NodeHandle,
        body: &mut NodeBody,
        idx: usize,
        mode: CacheMode,
        record_bytes: Option<u32>,
    ) -> bool {
        let slot = &mut body.slots[idx];
        if let Some(bytes) = record_bytes {
            slot.record_bytes = bytes;
        }
        match mode.record_policy() {
            RecordPolicy::Retain => slot.resident = true,
            RecordPolicy::Preserve => {}
            RecordPolicy::Evict => {
                if slot.resident {
                    slot.resident = false;
                    self.inner.stats.record_record_evicted();
                }
            }
        }
        let resident = slot.resident;
        self.inner.refresh_size_locked(node.kind(), body);
        resident
    }

    fn apply_deferred(&self, node: &Arc<NodeHandle>, mode: CacheMode) -> ContainerOutcome {
        let inner = &*self.inner;
        let Some(node) = inner.current(node) else {
            return ContainerOutcome::Absent;
        };
        let mut body = node.latch();
        if !body.is_resident() {
            return ContainerOutcome::Absent;
        }

        let mut discarded = None;
        let outcome = match mode.container_policy() {
            ContainerPolicy::Promote => ContainerOutcome::Kept,
            ContainerPolicy::KeepPosition => {
                if body.membership.is_some() && !body.fresh {
                    ContainerOutcome::Kept
                } else if evictable_by_mode(node.kind(), &body) {
                    discarded = Some(self.evict_by_mode(&node, &mut body, mode));
                    ContainerOutcome::Evicted
                } else {
                    inner.lru.touch_locked(&node, &mut body, false);
                    ContainerOutcome::Tracked
                }
            }
            ContainerPolicy::EvictUnlessDirty => {
                if evictable_by_mode(node.kind(), &body) {
                    discarded = Some(self.evict_by_mode(&node, &mut body, mode));
                    ContainerOutcome::Evicted
                } else {
                    inner.lru.touch_locked(&node, &mut body, true);
                    ContainerOutcome::Promoted
                }
            }
        };
        body.fresh = false;
        drop(body);

        if let Some(discarded) = discarded {
            inner.release_parent(&node, discarded);
        }
        self.check_budget();
        outcome
    }

    fn evict_by_mode(&self, node: &Arc<NodeHandle>, body: &mut NodeBody, mode: CacheMode) -> Discarded {
        let discarded = self.inner.discard_locked(node, body);
        self.inner.stats.record_mode_eviction();
        tracing::trace!(node = %node.id(), %mode, bytes = discarded.bytes, "Container evicted by cache mode");
        discarded
    }

    // ---- pinning & eligibility ----

    /// Pins a node; pinned nodes are never reclaimed or compacted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`] if the node is gone.
    pub fn pin(&self, node: &Arc<NodeHandle>) -> Result<()> {
        self.with_resident(node, |_, body| {
            body.pins += 1;
            Ok(())
        })?;
        Ok(())
    }

    /// Releases one pin.
    pub fn unpin(&self, node: &Arc<NodeHandle>) {
        if let Some(node) = self.inner.current(node) {
            let mut body = node.latch();
            body.pins = body.pins.saturating_sub(1);
        }
    }

    /// Whether the node could be fully reclaimed right now.
    #[must_use]
    pub fn eligibility(&self, id: NodeId) -> Eligibility {
        match self.inner.registry.get(id) {
            Some(node) => node.latch().eligibility(node.kind()),
            None => Eligibility::NotResident,
        }
    }

    // ---- tree-mutation notifications ----

    /// Sets the approximate size of a node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`] if the node is gone.
    pub fn on_node_size_changed(&self, node: &Arc<NodeHandle>, new_approx_bytes: u64) -> Result<()> {
        self.with_resident(node, |_, body| {
            self.inner.resize_locked(body, new_approx_bytes);
            Ok(())
        })?;
        self.check_budget();
        Ok(())
    }

    /// Marks a node, and optionally one of its slots, dirty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`] or [`Error::InvalidSlot`].
    pub fn on_node_dirtied(&self, node: &Arc<NodeHandle>, slot: Option<usize>) -> Result<()> {
        self.with_resident(node, |node, body| {
            self.inner.mark_dirty_locked(node, body, slot)
        })?;
        Ok(())
    }

    /// Marks a node and all of its slots clean after a durable write made
    /// outside the evictor (checkpoint).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`] if the node is gone.
    pub fn on_node_flushed(&self, node: &Arc<NodeHandle>) -> Result<()> {
        self.with_resident(node, |_, body| {
            body.mark_clean();
            Ok(())
        })?;
        Ok(())
    }

    /// Inserts or replaces a slot of a leaf container, keyed order kept.
    ///
    /// The slot and the container become dirty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`], or [`Error::Tree`] for an internal
    /// node.
    pub fn on_slot_inserted(&self, node: &Arc<NodeHandle>, slot: LeafSlot) -> Result<()> {
        self.with_resident(node, |node, body| {
            if node.kind() != NodeKind::LeafContainer {
                return Err(Error::Tree(format!("slot inserted into internal node {}", node.id())));
            }
            let slot = LeafSlot { dirty: true, ..slot };
            match body.slots.binary_search_by(|s| s.key.cmp(&slot.key)) {
                Ok(idx) => body.slots[idx] = slot,
                Err(idx) => body.slots.insert(idx, slot),
            }
            body.dirty = true;
            node.bump_generation();
            self.inner.refresh_size_locked(node.kind(), body);
            Ok(())
        })?;
        self.check_budget();
        Ok(())
    }

    /// Removes a slot from a leaf container.
    ///
    /// A full container left without slots is removed from the tree through
    /// the [`TreeMutator`], which may cascade to its ancestors. Returns the
    /// number of nodes removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`], [`Error::InvalidSlot`], or the
    /// tree's error if structural removal failed.
    pub fn on_slot_removed(&self, node: &Arc<NodeHandle>, slot: usize) -> Result<usize> {
        let (current, empty) = self.with_resident(node, |node, body| {
            if slot >= body.slots.len() {
                return Err(Error::InvalidSlot {
                    node: node.id(),
                    slot,
                    len: body.slots.len(),
                });
            }
            body.slots.remove(slot);
            body.dirty = true;
            node.bump_generation();
            self.inner.refresh_size_locked(node.kind(), body);
            Ok(is_structurally_empty(node.kind(), body))
        })?;
        if !empty {
            return Ok(0);
        }
        Ok(self.inner.remove_empty(&current)?.nodes)
    }

    /// Sets the number of child references of an internal node.
    ///
    /// An internal node left without entries is removed from the tree.
    /// Returns the number of nodes removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`], [`Error::Tree`] for a leaf
    /// container, or the tree's error if structural removal failed.
    pub fn on_entries_changed(&self, node: &Arc<NodeHandle>, entries: u32) -> Result<usize> {
        let (current, empty) = self.with_resident(node, |node, body| {
            if node.kind() != NodeKind::Internal {
                return Err(Error::Tree(format!("entries changed on leaf container {}", node.id())));
            }
            body.entries = entries;
            body.dirty = true;
            node.bump_generation();
            self.inner.refresh_size_locked(node.kind(), body);
            Ok(is_structurally_empty(node.kind(), body))
        })?;
        if !empty {
            self.check_budget();
            return Ok(0);
        }
        Ok(self.inner.remove_empty(&current)?.nodes)
    }

    fn with_resident<T>(
        &self,
        node: &Arc<NodeHandle>,
        f: impl FnOnce(&NodeHandle, &mut NodeBody) -> Result<T>,
    ) -> Result<(Arc<NodeHandle>, T)> {
        loop {
            let current = self
                .inner
                .current(node)
                .ok_or(Error::NodeNotResident(node.id()))?;
            let mut body = current.latch();
            match body.residency {
                Residency::Resident => {}
                Residency::Replaced => continue,
                Residency::Evicted => return Err(Error::NodeNotResident(node.id())),
            }
            let value = f(&current, &mut body)?;
            drop(body);
            return Ok((current, value));
        }
    }

    // ---- delta handling ----

    /// Compacts a leaf container to its delta form.
    ///
    /// The returned handle replaces `node`, which is discarded.
    ///
    /// # Errors
    ///
    /// Returns the reason the node is [`NotEligible`].
    pub fn compact(&self, node: &Arc<NodeHandle>) -> std::result::Result<Arc<NodeHandle>, NotEligible> {
        let node = self.inner.current(node).ok_or(NotEligible::NotResident)?;
        let mut body = node.latch();
        let (delta, plan) = self.inner.compactor.build_delta(node.kind(), &body)?;
        let delta = self.inner.replace_locked(&node, &mut body, delta);
        self.inner.stats.record_compaction(plan.bytes_saved());
        Ok(delta)
    }

    /// Rebuilds a full leaf container from a delta and the slots read back
    /// from storage.
    ///
    /// Stored slots are taken as clean; slots of the delta override them by
    /// key. A handle that is not a delta is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`] if the delta is gone.
    pub fn reconstitute(
        &self,
        delta: &Arc<NodeHandle>,
        full_slots: Vec<LeafSlot>,
    ) -> Result<Arc<NodeHandle>> {
        let node = self
            .inner
            .current(delta)
            .ok_or(Error::NodeNotResident(delta.id()))?;
        let mut body = node.latch();
        if !body.is_resident() {
            return Err(Error::NodeNotResident(node.id()));
        }
        if !body.is_delta {
            drop(body);
            return Ok(node);
        }

        let stored = full_slots
            .into_iter()
            .map(|s| LeafSlot { dirty: false, ..s })
            .collect();
        let slots = merge_slots(stored, &body.slots);
        let full = NodeBody {
            residency: Residency::Resident,
            dirty: true,
            is_delta: false,
            approx_bytes: estimate_bytes(NodeKind::LeafContainer, false, &slots, 0),
            slots,
            entries: 0,
            resident_children: 0,
            pins: body.pins,
            parent_counted: false,
            membership: None,
            fresh: body.fresh,
        };
        let full = self.inner.replace_locked(&node, &mut body, full);
        drop(body);
        self.inner.stats.record_reconstitution();
        tracing::trace!(node = %full.id(), "Delta reconstituted");
        self.check_budget();
        Ok(full)
    }

    // ---- eviction ----

    /// Trigger invoked whenever accounted memory may exceed the budget.
    ///
    /// Wakes the background daemon. The calling thread runs a pass itself
    /// when there is no daemon, or when memory is above the budget by more
    /// than the critical overage. Safe to call redundantly.
    pub fn on_memory_over_budget(&self) {
        let inner = &*self.inner;
        if !inner.budget.is_over() {
            return;
        }
        match &self.daemon {
            Some(daemon) => {
                daemon.wake();
                if inner.budget.excess() > inner.config.evictor.critical_overage_bytes {
                    run_pass(inner, EvictionSource::Critical);
                }
            }
            None => {
                run_pass(inner, EvictionSource::Critical);
            }
        }
    }

    fn check_budget(&self) {
        if self.inner.budget.is_over() {
            self.on_memory_over_budget();
        }
    }

    /// Runs one pass on the calling thread.
    pub fn evict_memory(&self) -> PassReport {
        run_pass(&self.inner, EvictionSource::Manual)
    }

    /// Changes the memory budget and evicts if it is now exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `bytes` is zero or not above the
    /// configured batch size.
    pub fn set_max_memory(&self, bytes: u64) -> Result<()> {
        if bytes == 0 || bytes <= self.inner.config.evictor.batch_bytes {
            return Err(Error::Config(format!(
                "max memory {bytes} must be above evictor.batch_bytes ({})",
                self.inner.config.evictor.batch_bytes
            )));
        }
        self.inner.budget.set_max(bytes);
        self.check_budget();
        Ok(())
    }

    // ---- observation ----

    /// Accounted bytes of all resident nodes.
    #[must_use]
    pub fn memory_used(&self) -> u64 {
        self.inner.budget.used()
    }

    /// Current budget.
    #[must_use]
    pub fn max_memory(&self) -> u64 {
        self.inner.budget.max()
    }

    /// Number of resident nodes.
    #[must_use]
    pub fn resident_nodes(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of nodes tracked in the LRU shards.
    #[must_use]
    pub fn tracked_nodes(&self) -> usize {
        self.inner.lru.tracked_nodes()
    }

    /// Eviction statistics.
    #[must_use]
    pub fn stats(&self) -> EvictionStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Resets eviction statistics.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Environment-wide failure channel.
    #[must_use]
    pub fn failures(&self) -> &FailureChannel {
        &self.inner.failures
    }

    /// Background daemon, if running.
    #[must_use]
    pub fn daemon(&self) -> Option<&EvictorDaemon> {
        self.daemon.as_ref()
    }

    /// Checks that every tracked node appears exactly once, in the shard and
    /// position its membership records, and that byte totals agree.
    ///
    /// Only meaningful while no other thread uses the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] describing the first violation found.
    pub fn verify_residency(&self) -> Result<()> {
        self.inner.verify_residency()
    }
}

/// Whether a cache mode may discard the container now.
fn evictable_by_mode(kind: NodeKind, body: &NodeBody) -> bool {
    !body.dirty && body.pins == 0 && !(kind == NodeKind::Internal && body.resident_children > 0)
}
