//! Tests for eviction passes and the background daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{classify, run_pass, Decision, EvictionSource, Phase};
use crate::cache::NodeCache;
use crate::cache_mode::CacheMode;
use crate::collaborators::{DurableLocation, FlushRequest, LogWriter, TreeMutator};
use crate::config::NodeCacheConfig;
use crate::error::{Error, Result};
use crate::failure::FailureKind;
use crate::lru::ShardId;
use crate::node::{LeafSlot, NodeHandle, NodeId, NodeSpec};
use crate::OpEffect;

struct FailingLog;

impl LogWriter for FailingLog {
    fn flush(&self, node: &FlushRequest<'_>) -> Result<DurableLocation> {
        Err(Error::Flush {
            node: node.id,
            reason: "disk full".to_string(),
        })
    }
}

/// Removes every empty node except the root.
struct RemovingTree;

impl TreeMutator for RemovingTree {
    fn remove_empty_node(&self, _node: NodeId, parent: Option<NodeId>) -> Result<bool> {
        Ok(parent.is_some())
    }
}

fn config() -> NodeCacheConfig {
    NodeCacheConfig::default()
        .with_background_evictor(false)
        .with_lru_shards(1)
        .with_batch_bytes(0)
}

fn cache_with(config: NodeCacheConfig) -> NodeCache {
    NodeCache::new(config).expect("valid config")
}

fn clean_leaf(id: u64) -> NodeSpec {
    NodeSpec::leaf(
        NodeId(id),
        None,
        (0u8..4).map(|i| LeafSlot::new(vec![i; 16], 64)).collect(),
    )
}

/// Every slot dirty, so compaction saves nothing.
fn fully_dirty_leaf(id: u64) -> NodeSpec {
    NodeSpec::leaf(
        NodeId(id),
        None,
        (0u8..4).map(|i| LeafSlot::new(vec![i; 16], 64).dirty()).collect(),
    )
}

/// One dirty slot out of ten, well below the compaction threshold.
fn compactable_leaf(id: u64) -> NodeSpec {
    NodeSpec::leaf(
        NodeId(id),
        None,
        (0u8..10)
            .map(|i| {
                let slot = LeafSlot::new(vec![i; 32], 200).with_resident_record();
                if i == 0 {
                    slot.dirty()
                } else {
                    slot
                }
            })
            .collect(),
    )
}

fn load(cache: &NodeCache, spec: NodeSpec) -> Arc<NodeHandle> {
    cache.load_node(spec, CacheMode::Default).handle
}

/// Shrinks the budget just below current usage without triggering a pass.
fn squeeze(cache: &NodeCache, bytes: u64) {
    let used = cache.memory_used();
    cache.inner().budget.set_max(used - bytes);
}

// ========== Clean reclamation ==========

#[test]
fn test_pass_under_budget_does_nothing() {
    let cache = cache_with(config());
    load(&cache, clean_leaf(1));

    let report = cache.evict_memory();

    assert_eq!(report, super::PassReport::default());
    assert_eq!(cache.stats().total_passes(), 0);
}

#[test]
fn test_pass_reclaims_coldest_clean_node_first() {
    // Arrange
    let cache = cache_with(config());
    for id in 1..=4 {
        load(&cache, clean_leaf(id));
    }
    squeeze(&cache, 1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert_eq!(report.evicted, 1);
    assert!(cache.get(NodeId(1)).is_none());
    assert!((2..=4).all(|id| cache.get(NodeId(id)).is_some()));
    assert!(!cache.inner().budget.is_over());
    let stats = cache.stats();
    assert_eq!(stats.passes_manual, 1);
    assert_eq!(stats.leaf_container_evictions, 1);
    assert_eq!(stats.bytes_reclaimed, report.bytes_reclaimed);
    cache.verify_residency().expect("consistent");
}

#[test]
fn test_pass_converges_across_shards() {
    // Arrange
    let cache = cache_with(config().with_lru_shards(4));
    for id in 0..200 {
        load(&cache, clean_leaf(id));
    }
    let half = cache.memory_used() / 2;
    cache.inner().budget.set_max(half);

    // Act
    let report = run_pass(cache.inner(), EvictionSource::Manual);

    // Assert
    assert!(report.made_progress());
    assert!(cache.memory_used() <= half);
    assert!(cache.resident_nodes() < 200);
    cache.verify_residency().expect("consistent");
}

#[test]
fn test_pinned_node_is_skipped() {
    // Arrange
    let cache = cache_with(config());
    let pinned = load(&cache, clean_leaf(1));
    load(&cache, clean_leaf(2));
    cache.pin(&pinned).expect("resident");
    squeeze(&cache, 1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert!(pinned.is_resident());
    assert!(cache.get(NodeId(2)).is_none());
    assert_eq!(report.deferred, 1);
    assert_eq!(cache.stats().pinned_skipped, 1);
}

// ========== Dirty nodes ==========

#[test]
fn test_dirty_node_is_deferred_while_clean_nodes_remain() {
    // Arrange: the dirty node sits at the cold end
    let cache = cache_with(config());
    let dirty = load(&cache, fully_dirty_leaf(1));
    load(&cache, clean_leaf(2));
    load(&cache, clean_leaf(3));
    squeeze(&cache, 1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert!(dirty.is_resident());
    assert!(dirty.is_dirty());
    assert!(cache.get(NodeId(2)).is_none());
    assert!(cache.get(NodeId(3)).is_some());
    assert_eq!(report.deferred, 1);
    assert_eq!(report.flushed, 0);
    let stats = cache.stats();
    assert_eq!(stats.dirty_deferred, 1);
    assert_eq!(stats.dirty_flushed, 0);
}

#[test]
fn test_dirty_node_is_flushed_when_nothing_clean_is_left() {
    let cache = cache_with(config());
    let dirty = load(&cache, fully_dirty_leaf(1));
    squeeze(&cache, 1);

    let report = cache.evict_memory();

    assert!(!dirty.is_resident());
    assert_eq!(report.flushed, 1);
    assert_eq!(report.evicted, 1);
    assert_eq!(cache.stats().dirty_flushed, 1);
    assert_eq!(cache.memory_used(), 0);
}

#[test]
fn test_dirty_node_stays_when_flush_on_pressure_is_off() {
    let cache = cache_with(config().with_flush_on_pressure(false));
    let dirty = load(&cache, fully_dirty_leaf(1));
    squeeze(&cache, 1);

    let report = cache.evict_memory();

    assert!(dirty.is_resident());
    assert!(!report.made_progress());
    assert_eq!(cache.stats().starved_passes, 1);
}

#[test]
fn test_flush_failure_is_published_and_node_kept() {
    // Arrange
    let cache = NodeCache::builder(config())
        .log(Arc::new(FailingLog))
        .build()
        .expect("valid config");
    let failures = cache.failures().subscribe();
    let dirty = load(&cache, fully_dirty_leaf(7));
    squeeze(&cache, 1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert!(dirty.is_resident());
    assert!(dirty.is_dirty());
    assert_eq!(report.flushed, 0);
    let failure = failures.try_recv().expect("failure published");
    assert_eq!(failure.kind, FailureKind::FlushFailed);
    assert_eq!(failure.node, NodeId(7));
    assert!(failure.message.contains("disk full"));
    let stats = cache.stats();
    assert_eq!(stats.flush_failures, 1);
    assert_eq!(stats.starved_passes, 1);
    cache.verify_residency().expect("consistent");
}

#[test]
fn test_dirty_leaf_container_is_compacted() {
    // Arrange
    let cache = cache_with(config());
    let full = load(&cache, compactable_leaf(1));
    squeeze(&cache, 1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert_eq!(report.compacted, 1);
    assert_eq!(report.flushed, 0);
    assert!(!full.is_resident());
    let delta = cache.get(NodeId(1)).expect("delta registered");
    assert!(delta.is_delta());
    assert!(delta.is_dirty());
    assert!(!cache.inner().budget.is_over());
    assert_eq!(cache.stats().delta_compactions, 1);
    cache.verify_residency().expect("consistent");
}

// ========== Tree shape ==========

#[test]
fn test_parent_is_deferred_then_cascaded() {
    // Arrange: the root is colder than its only child
    let cache = cache_with(config());
    let root = load(&cache, NodeSpec::internal(NodeId(1), None, 1));
    let child = load(
        &cache,
        NodeSpec::leaf(NodeId(2), Some(NodeId(1)), vec![LeafSlot::new(&b"k"[..], 8)]),
    );
    cache.inner().budget.set_max(1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert!(!root.is_resident());
    assert!(!child.is_resident());
    assert_eq!(report.evicted, 2);
    assert_eq!(report.deferred, 1);
    let stats = cache.stats();
    assert_eq!(stats.children_skipped, 1);
    assert_eq!(stats.cascade_reclaims, 1);
    assert_eq!(stats.internal_evictions, 1);
    assert_eq!(cache.memory_used(), 0);
}

#[test]
fn test_empty_leaf_container_is_removed_structurally() {
    // Arrange
    let cache = NodeCache::builder(config())
        .tree(Arc::new(RemovingTree))
        .build()
        .expect("valid config");
    let root = load(&cache, NodeSpec::internal(NodeId(1), None, 1));
    load(&cache, NodeSpec::leaf(NodeId(2), Some(NodeId(1)), Vec::new()));
    squeeze(&cache, 1);

    // Act
    let report = cache.evict_memory();

    // Assert
    assert_eq!(report.evicted, 1);
    assert!(cache.get(NodeId(2)).is_none());
    assert!(root.is_resident());
    assert!(root.is_dirty());
    assert_eq!(root.snapshot().entries, 0);
    assert_eq!(cache.stats().structural_removals, 1);
    cache.verify_residency().expect("consistent");
}

#[test]
fn test_empty_leaf_container_kept_by_tree_is_evicted() {
    let cache = cache_with(config());
    load(&cache, NodeSpec::leaf(NodeId(1), None, Vec::new()));
    squeeze(&cache, 1);

    let report = cache.evict_memory();

    assert_eq!(report.evicted, 1);
    let stats = cache.stats();
    assert_eq!(stats.structural_removals, 0);
    assert_eq!(stats.leaf_container_evictions, 1);
}

// ========== Race safety ==========

#[test]
fn test_touch_after_selection_makes_candidate_stale() {
    // Arrange
    let cache = cache_with(config());
    let node = load(&cache, clean_leaf(1));
    load(&cache, clean_leaf(2));
    let (candidate, generation) = cache
        .inner()
        .lru
        .shard(ShardId(0))
        .peek_cold_with_generation()
        .expect("tracked");
    assert!(Arc::ptr_eq(&candidate, &node));

    // Act: another thread touches the node between selection and classification
    cache
        .finish_op(&node, CacheMode::Default, OpEffect::read(0))
        .expect("resident");
    let decision = classify(cache.inner(), &candidate, generation, Phase::Clean);

    // Assert
    assert!(matches!(decision, Decision::Stale));
    assert!(node.is_resident());
}

#[test]
fn test_dirtying_after_selection_makes_candidate_stale() {
    let cache = cache_with(config());
    let node = load(&cache, clean_leaf(1));
    let (candidate, generation) = cache
        .inner()
        .lru
        .shard(ShardId(0))
        .peek_cold_with_generation()
        .expect("tracked");

    cache.on_node_dirtied(&node, Some(1)).expect("resident");
    let decision = classify(cache.inner(), &candidate, generation, Phase::Flush);

    assert!(matches!(decision, Decision::Stale));
    assert!(node.is_resident());
    assert!(node.is_dirty());
}

#[test]
fn test_unchanged_candidate_is_evicted() {
    let cache = cache_with(config());
    let node = load(&cache, clean_leaf(1));
    let (candidate, generation) = cache
        .inner()
        .lru
        .shard(ShardId(0))
        .peek_cold_with_generation()
        .expect("tracked");

    let decision = classify(cache.inner(), &candidate, generation, Phase::Clean);

    assert!(matches!(decision, Decision::Evicted { flushed: false, .. }));
    assert!(!node.is_resident());
}

// ========== Triggers ==========

#[test]
fn test_inline_pass_keeps_budget_without_daemon() {
    // Arrange
    let per_node = {
        let sizing = cache_with(config());
        load(&sizing, clean_leaf(0));
        sizing.memory_used()
    };
    let cache = cache_with(config().with_max_memory(per_node * 10));

    // Act
    for id in 0..50 {
        load(&cache, clean_leaf(id));
        // Assert: every load that overshoots is reclaimed inline
        assert!(cache.memory_used() <= cache.max_memory());
    }

    let stats = cache.stats();
    assert!(stats.passes_critical > 0);
    assert_eq!(stats.passes_background, 0);
    cache.verify_residency().expect("consistent");
}

#[test]
fn test_daemon_brings_memory_back_under_budget() {
    // Arrange
    let config = NodeCacheConfig::default()
        .with_max_memory(8 * 1024)
        .with_batch_bytes(0)
        .with_critical_overage(64 * 1024 * 1024);
    let cache = cache_with(config);
    assert!(cache.daemon().is_some_and(crate::EvictorDaemon::is_running));

    // Act
    for id in 0..500 {
        load(&cache, clean_leaf(id));
    }

    // Assert
    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.memory_used() > cache.max_memory() {
        assert!(
            Instant::now() < deadline,
            "daemon did not converge: {} > {}",
            cache.memory_used(),
            cache.max_memory()
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = cache.stats();
    assert!(stats.passes_background > 0);
    assert_eq!(stats.passes_critical, 0);
}

#[test]
fn test_daemon_stop_is_idempotent() {
    let cache = cache_with(NodeCacheConfig::default());
    let daemon = cache.daemon().expect("background evictor enabled");

    daemon.stop();
    daemon.stop();
    daemon.wake();

    assert!(!daemon.is_running());
}
