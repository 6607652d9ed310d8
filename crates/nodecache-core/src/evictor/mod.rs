//! Eviction passes.
//!
//! A pass runs while accounted memory exceeds the budget and stops once
//! `batch_bytes` of headroom are free below it, or when a full scan of every
//! shard makes no progress.
//!
//! ```text
//!   Idle ─► SelectCandidate ─► Classify ─┬─► Reclaim  (clean)
//!    ▲                                   ├─► Compact  (dirty, small delta)
//!    └───────────────────────────────────┴─► Defer    (dirty, pinned, busy)
//! ```
//!
//! Candidates are peeked at the cold end, never popped. Classification runs
//! under the node latch and compares the generation observed at the cold end
//! with the current one; any touch, dirtying or replacement in between makes
//! the candidate stale and it is skipped.
//!
//! A pass has two phases. The clean phase reclaims clean nodes and compacts
//! or defers dirty ones. Only if memory is still over the goal after every
//! shard was scanned does the flush phase write dirty nodes through the log
//! and reclaim them.

mod daemon;
mod stats;
#[cfg(test)]
mod tests;

pub use daemon::EvictorDaemon;
pub use stats::{EvictionStats, EvictionStatsSnapshot};

use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::inner::{is_structurally_empty, CacheInner, Removal};
use crate::lru::ShardId;
use crate::node::{Eligibility, NodeBody, NodeHandle, NodeKind};

/// Who started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EvictionSource {
    /// The thread that pushed memory far over budget, inline.
    Critical,
    /// The background daemon.
    Background,
    /// An explicit request.
    Manual,
}

/// Summary of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Candidates examined.
    pub candidates: u64,
    /// Candidates skipped because they changed after selection.
    pub stale: u64,
    /// Nodes fully evicted, cascades included.
    pub evicted: u64,
    /// Leaf containers compacted to a delta.
    pub compacted: u64,
    /// Nodes moved back to the hot end.
    pub deferred: u64,
    /// Dirty nodes flushed before eviction.
    pub flushed: u64,
    /// Bytes freed.
    pub bytes_reclaimed: u64,
}

impl PassReport {
    /// Whether the pass freed anything.
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.bytes_reclaimed > 0 || self.evicted > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Clean,
    Flush,
}

/// What happened to one candidate.
#[derive(Debug)]
enum Decision {
    Stale,
    Deferred,
    Compacted { bytes_saved: u64 },
    Evicted {
        bytes: u64,
        parent: Option<Arc<NodeHandle>>,
        flushed: bool,
    },
    Removed(Removal),
}

/// Runs one pass.
pub(crate) fn run_pass(inner: &CacheInner, source: EvictionSource) -> PassReport {
    let mut report = PassReport::default();
    if !inner.budget.is_over() {
        return report;
    }
    inner.stats.record_pass(source);

    let headroom = inner.config.evictor.batch_bytes;
    let flush_allowed = inner.config.evictor.flush_on_pressure
        && (source != EvictionSource::Critical || !inner.has_daemon);
    let shard_count = inner.lru.len();
    let start = inner.next_shard.fetch_add(1, Ordering::Relaxed) % shard_count;

    let mut phases = vec![Phase::Clean];
    if flush_allowed {
        phases.push(Phase::Flush);
    }
    'phases: for phase in phases {
        for offset in 0..shard_count {
            if inner.budget.has_headroom(headroom) {
                break 'phases;
            }
            let shard = ShardId((start + offset) % shard_count);
            scan_shard(inner, shard, phase, headroom, &mut report);
        }
    }

    if report.made_progress() {
        tracing::debug!(
            ?source,
            bytes = report.bytes_reclaimed,
            evicted = report.evicted,
            compacted = report.compacted,
            deferred = report.deferred,
            used = inner.budget.used(),
            "Eviction pass finished"
        );
    } else if inner.budget.is_over() {
        inner.stats.record_starved();
        tracing::debug!(
            ?source,
            candidates = report.candidates,
            used = inner.budget.used(),
            excess = inner.budget.excess(),
            "Eviction pass starved, nothing reclaimable"
        );
    }
    report
}

/// Examines at most as many candidates as the shard held when the scan began.
fn scan_shard(
    inner: &CacheInner,
    shard: ShardId,
    phase: Phase,
    headroom: u64,
    report: &mut PassReport,
) {
    let lru_shard = inner.lru.shard(shard);
    let visits = lru_shard.len();
    for _ in 0..visits {
        if inner.budget.has_headroom(headroom) {
            return;
        }
        let Some((node, generation)) = lru_shard.peek_cold_with_generation() else {
            return;
        };
        report.candidates += 1;
        inner.stats.record_candidate();

        match classify(inner, &node, generation, phase) {
            Decision::Stale => {
                report.stale += 1;
                inner.stats.record_stale();
            }
            Decision::Deferred => report.deferred += 1,
            Decision::Compacted { bytes_saved } => {
                report.compacted += 1;
                report.bytes_reclaimed += bytes_saved;
            }
            Decision::Evicted {
                bytes,
                parent,
                flushed,
            } => {
                report.evicted += 1;
                report.flushed += u64::from(flushed);
                report.bytes_reclaimed += bytes;
                if let Some(parent) = parent {
                    cascade(inner, parent, headroom, report);
                }
            }
            Decision::Removed(removal) => {
                report.evicted += removal.nodes as u64;
                report.bytes_reclaimed += removal.bytes;
            }
        }
    }
}

/// Decides on and acts upon one candidate under its latch.
fn classify(inner: &CacheInner, node: &Arc<NodeHandle>, generation: u64, phase: Phase) -> Decision {
    let mut body = node.latch();
    if node.generation() != generation || !body.is_resident() {
        tracing::trace!(node = %node.id(), "Stale eviction candidate");
        return Decision::Stale;
    }

    if body.pins > 0 {
        inner.stats.record_pinned_skipped();
        return defer(inner, node, &mut body);
    }
    if node.kind() == NodeKind::Internal && body.resident_children > 0 {
        inner.stats.record_children_skipped();
        return defer(inner, node, &mut body);
    }

    if !body.dirty {
        if node.kind() == NodeKind::LeafContainer && is_structurally_empty(node.kind(), &body) {
            drop(body);
            return remove_empty(inner, node);
        }
        return evict(inner, node, &mut body);
    }

    match phase {
        Phase::Clean => match inner.compactor.build_delta(node.kind(), &body) {
            Ok((delta, plan)) => {
                let delta = inner.replace_locked(node, &mut body, delta);
                inner.stats.record_compaction(plan.bytes_saved());
                tracing::trace!(
                    node = %delta.id(),
                    saved = plan.bytes_saved(),
                    ratio = plan.ratio,
                    "Compacted leaf container to delta"
                );
                Decision::Compacted {
                    bytes_saved: plan.bytes_saved(),
                }
            }
            Err(reason) => {
                tracing::trace!(node = %node.id(), %reason, "Dirty node deferred");
                inner.stats.record_dirty_deferred();
                defer(inner, node, &mut body)
            }
        },
        Phase::Flush => match inner.flush_locked(node, &body) {
            Ok(location) => {
                body.mark_clean();
                node.bump_generation();
                inner.stats.record_flush();
                tracing::trace!(node = %node.id(), ?location, "Flushed dirty node before eviction");
                match evict(inner, node, &mut body) {
                    Decision::Evicted { bytes, parent, .. } => Decision::Evicted {
                        bytes,
                        parent,
                        flushed: true,
                    },
                    other => other,
                }
            }
            Err(err) => {
                inner.report_flush_failure(node, &err);
                tracing::warn!(node = %node.id(), "Node kept resident for retry on a later pass");
                defer(inner, node, &mut body)
            }
        },
    }
}

fn defer(inner: &CacheInner, node: &Arc<NodeHandle>, body: &mut NodeBody) -> Decision {
    inner.lru.touch_locked(node, body, true);
    Decision::Deferred
}

fn evict(
    inner: &CacheInner,
    node: &Arc<NodeHandle>,
    body: &mut parking_lot::MutexGuard<'_, NodeBody>,
) -> Decision {
    let discarded = inner.discard_locked(node, body);
    inner.stats.record_eviction(node.kind(), discarded.bytes);
    parking_lot::MutexGuard::unlocked(body, || Decision::Evicted {
        bytes: discarded.bytes,
        parent: inner.release_parent(node, discarded),
        flushed: false,
    })
}

/// Structural removal of an empty clean leaf container; plain eviction if
/// the tree keeps it.
fn remove_empty(inner: &CacheInner, node: &Arc<NodeHandle>) -> Decision {
    if let Ok(removal) = inner.remove_empty(node) {
        if removal.nodes > 0 {
            return Decision::Removed(removal);
        }
    }
    let mut body = node.latch();
    if !body.is_resident() || body.dirty || body.pins > 0 {
        return Decision::Stale;
    }
    evict(inner, node, &mut body)
}

/// Reclaims parents left without resident children, bottom-up, while the
/// pass still lacks `headroom` free bytes.
fn cascade(inner: &CacheInner, parent: Arc<NodeHandle>, headroom: u64, report: &mut PassReport) {
    let mut next = Some(parent);
    while let Some(node) = next.take() {
        if inner.budget.has_headroom(headroom) {
            return;
        }
        let mut body = node.latch();
        if body.eligibility(node.kind()) != Eligibility::Eligible {
            return;
        }
        inner.stats.record_cascade();
        match evict(inner, &node, &mut body) {
            Decision::Evicted { bytes, parent, .. } => {
                report.evicted += 1;
                report.bytes_reclaimed += bytes;
                next = parent;
            }
            _ => return,
        }
    }
}
