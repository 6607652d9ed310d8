//! Eviction statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::EvictionSource;
use crate::node::NodeKind;

/// Counters updated by eviction passes and cache-mode evictions.
#[derive(Debug, Default)]
pub struct EvictionStats {
    passes_critical: AtomicU64,
    passes_background: AtomicU64,
    passes_manual: AtomicU64,
    candidates_selected: AtomicU64,
    stale_candidates: AtomicU64,
    internal_evictions: AtomicU64,
    leaf_container_evictions: AtomicU64,
    delta_compactions: AtomicU64,
    delta_reconstitutions: AtomicU64,
    bytes_reclaimed: AtomicU64,
    dirty_deferred: AtomicU64,
    pinned_skipped: AtomicU64,
    children_skipped: AtomicU64,
    dirty_flushed: AtomicU64,
    flush_failures: AtomicU64,
    records_evicted: AtomicU64,
    mode_evictions: AtomicU64,
    cascade_reclaims: AtomicU64,
    structural_removals: AtomicU64,
    starved_passes: AtomicU64,
}

/// Point-in-time copy of [`EvictionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionStatsSnapshot {
    /// Inline passes run by a thread that pushed memory far over budget.
    pub passes_critical: u64,
    /// Passes run by the background daemon.
    pub passes_background: u64,
    /// Passes requested explicitly.
    pub passes_manual: u64,
    /// Candidates taken from a cold end.
    pub candidates_selected: u64,
    /// Candidates discarded because they changed after selection.
    pub stale_candidates: u64,
    /// Internal nodes fully evicted.
    pub internal_evictions: u64,
    /// Leaf containers fully evicted.
    pub leaf_container_evictions: u64,
    /// Leaf containers compacted to a delta.
    pub delta_compactions: u64,
    /// Deltas turned back into full nodes.
    pub delta_reconstitutions: u64,
    /// Bytes freed by eviction passes.
    pub bytes_reclaimed: u64,
    /// Dirty nodes moved back to the hot end.
    pub dirty_deferred: u64,
    /// Pinned nodes moved back to the hot end.
    pub pinned_skipped: u64,
    /// Internal nodes skipped because children are resident.
    pub children_skipped: u64,
    /// Dirty nodes written before eviction.
    pub dirty_flushed: u64,
    /// Failed durable writes.
    pub flush_failures: u64,
    /// Leaf records dropped by cache modes.
    pub records_evicted: u64,
    /// Containers dropped at the end of an operation by cache modes.
    pub mode_evictions: u64,
    /// Parents reclaimed after their last resident child.
    pub cascade_reclaims: u64,
    /// Empty nodes removed from the tree.
    pub structural_removals: u64,
    /// Passes that reclaimed nothing while over budget.
    pub starved_passes: u64,
}

impl EvictionStatsSnapshot {
    /// Full evictions of both node kinds.
    #[must_use]
    pub fn full_evictions(&self) -> u64 {
        self.internal_evictions + self.leaf_container_evictions
    }

    /// Passes of all sources.
    #[must_use]
    pub fn total_passes(&self) -> u64 {
        self.passes_critical + self.passes_background + self.passes_manual
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EvictionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_pass(&self, source: EvictionSource) {
        match source {
            EvictionSource::Critical => bump(&self.passes_critical),
            EvictionSource::Background => bump(&self.passes_background),
            EvictionSource::Manual => bump(&self.passes_manual),
        }
    }

    pub(crate) fn record_candidate(&self) {
        bump(&self.candidates_selected);
    }

    pub(crate) fn record_stale(&self) {
        bump(&self.stale_candidates);
    }

    pub(crate) fn record_eviction(&self, kind: NodeKind, bytes: u64) {
        match kind {
            NodeKind::Internal => bump(&self.internal_evictions),
            NodeKind::LeafContainer => bump(&self.leaf_container_evictions),
        }
        self.bytes_reclaimed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self, bytes_saved: u64) {
        bump(&self.delta_compactions);
        self.bytes_reclaimed.fetch_add(bytes_saved, Ordering::Relaxed);
    }

    pub(crate) fn record_reconstitution(&self) {
        bump(&self.delta_reconstitutions);
    }

    pub(crate) fn record_dirty_deferred(&self) {
        bump(&self.dirty_deferred);
    }

    pub(crate) fn record_pinned_skipped(&self) {
        bump(&self.pinned_skipped);
    }

    pub(crate) fn record_children_skipped(&self) {
        bump(&self.children_skipped);
    }

    pub(crate) fn record_flush(&self) {
        bump(&self.dirty_flushed);
    }

    pub(crate) fn record_flush_failure(&self) {
        bump(&self.flush_failures);
    }

    pub(crate) fn record_record_evicted(&self) {
        bump(&self.records_evicted);
    }

    pub(crate) fn record_mode_eviction(&self) {
        bump(&self.mode_evictions);
    }

    pub(crate) fn record_cascade(&self) {
        bump(&self.cascade_reclaims);
    }

    pub(crate) fn record_structural_removal(&self) {
        bump(&self.structural_removals);
    }

    pub(crate) fn record_starved(&self) {
        bump(&self.starved_passes);
    }

    /// Copies all counters.
    #[must_use]
    pub fn snapshot(&self) -> EvictionStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EvictionStatsSnapshot {
            passes_critical: load(&self.passes_critical),
            passes_background: load(&self.passes_background),
            passes_manual: load(&self.passes_manual),
            candidates_selected: load(&self.candidates_selected),
            stale_candidates: load(&self.stale_candidates),
            internal_evictions: load(&self.internal_evictions),
            leaf_container_evictions: load(&self.leaf_container_evictions),
            delta_compactions: load(&self.delta_compactions),
            delta_reconstitutions: load(&self.delta_reconstitutions),
            bytes_reclaimed: load(&self.bytes_reclaimed),
            dirty_deferred: load(&self.dirty_deferred),
            pinned_skipped: load(&self.pinned_skipped),
            children_skipped: load(&self.children_skipped),
            dirty_flushed: load(&self.dirty_flushed),
            flush_failures: load(&self.flush_failures),
            records_evicted: load(&self.records_evicted),
            mode_evictions: load(&self.mode_evictions),
            cascade_reclaims: load(&self.cascade_reclaims),
            structural_removals: load(&self.structural_removals),
            starved_passes: load(&self.starved_passes),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.passes_critical,
            &self.passes_background,
            &self.passes_manual,
            &self.candidates_selected,
            &self.stale_candidates,
            &self.internal_evictions,
            &self.leaf_container_evictions,
            &self.delta_compactions,
            &self.delta_reconstitutions,
            &self.bytes_reclaimed,
            &self.dirty_deferred,
            &self.pinned_skipped,
            &self.children_skipped,
            &self.dirty_flushed,
            &self.flush_failures,
            &self.records_evicted,
            &self.mode_evictions,
            &self.cascade_reclaims,
            &self.structural_removals,
            &self.starved_passes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
