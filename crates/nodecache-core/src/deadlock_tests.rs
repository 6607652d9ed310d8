//! Deadlock detection tests for the node cache.
//!
//! Validates lock ordering between node latches, the registry and the LRU
//! shards under concurrent operations and eviction passes. Uses timeouts to
//! detect potential deadlocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    CacheMode, ContainerOutcome, LeafSlot, NodeCache, NodeCacheConfig, NodeId, NodeSpec, OpEffect,
};

/// Timeout for deadlock detection (if operation takes longer, likely deadlocked)
const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(5);

const MODES: [CacheMode; 4] = [
    CacheMode::Default,
    CacheMode::Unchanged,
    CacheMode::EvictLn,
    CacheMode::EvictBin,
];

fn leaf(id: u64, parent: u64) -> NodeSpec {
    NodeSpec::leaf(
        NodeId(id),
        Some(NodeId(parent)),
        (0u8..4)
            .map(|i| LeafSlot::new(vec![i; 8], 32).with_resident_record())
            .collect(),
    )
}

/// Runs `work` on a helper thread and panics if it does not finish in time.
fn assert_completes(what: &'static str, work: impl FnOnce() + Send + 'static) {
    let completed = Arc::new(AtomicBool::new(false));
    let completed_clone = Arc::clone(&completed);

    let handle = thread::spawn(move || {
        work();
        completed_clone.store(true, Ordering::SeqCst);
    });

    let start = Instant::now();
    while !completed.load(Ordering::SeqCst) {
        if start.elapsed() > DEADLOCK_TIMEOUT {
            panic!("DEADLOCK DETECTED: {what} did not complete within timeout");
        }
        if handle.is_finished() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    handle.join().expect("Main thread panicked");
}

// ========== Operations vs inline passes ==========

#[test]
fn test_no_deadlock_concurrent_loads_under_pressure() {
    let config = NodeCacheConfig::default()
        .with_background_evictor(false)
        .with_max_memory(16 * 1024)
        .with_batch_bytes(1024);
    let cache = Arc::new(NodeCache::new(config).expect("valid config"));
    cache.load_node(NodeSpec::internal(NodeId(0), None, 100), CacheMode::Default);

    let shared = Arc::clone(&cache);
    assert_completes("loads with inline eviction", move || {
        let mut handles = vec![];

        // Children of one shared parent, every mode interleaved
        for t in 0..4u64 {
            let cache = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    let mode = MODES[((t + i) % 4) as usize];
                    let node = cache.load_pinned(leaf(1 + t * 1000 + i % 50, 0), mode).handle;
                    // A compacted node may have fewer slots than it was loaded with.
                    let slots = node.snapshot().slot_count;
                    let effect = match (slots, i % 7 == 0) {
                        (0, dirtied) => OpEffect {
                            dirtied,
                            ..OpEffect::container_only()
                        },
                        (n, true) => OpEffect::write((i as usize) % n),
                        (n, false) => OpEffect::read((i as usize) % n),
                    };
                    cache
                        .finish_op(&node, mode, effect)
                        .expect("operation on a pinned node");
                    if i % 11 == 0 {
                        cache.on_node_flushed(&node).expect("flush of a pinned node");
                    }
                    cache.unpin(&node);
                    // Once unpinned the mode may discard the container.
                    cache
                        .touch(&node, mode, false)
                        .expect("touch never fails for a container");
                    let _ = cache.stats();
                }
            }));
        }

        for h in handles {
            h.join().expect("Thread panicked");
        }
    });

    cache.verify_residency().expect("consistent after concurrent loads");
}

#[test]
fn test_no_deadlock_manual_passes_during_touches() {
    let config = NodeCacheConfig::default()
        .with_background_evictor(false)
        .with_lru_shards(2);
    let cache = Arc::new(NodeCache::new(config).expect("valid config"));
    cache.load_node(NodeSpec::internal(NodeId(0), None, 100), CacheMode::Default);
    for id in 1..=100 {
        cache.load_node(leaf(id, 0), CacheMode::Default);
    }
    cache.inner().budget.set_max(cache.memory_used() / 3);

    let shared = Arc::clone(&cache);
    assert_completes("passes racing touches", move || {
        let mut handles = vec![];

        // Threads touching and pinning while passes select candidates
        for t in 0..3u64 {
            let cache = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for i in 0..300u64 {
                    let id = NodeId(1 + (t * 37 + i) % 100);
                    if let Some(node) = cache.get(id) {
                        if cache.pin(&node).is_ok() {
                            let outcome = cache
                                .touch(&node, CacheMode::Default, i % 13 == 0)
                                .expect("touch of a pinned node");
                            assert_eq!(outcome.container, ContainerOutcome::Promoted);
                            cache.unpin(&node);
                        }
                    }
                }
            }));
        }

        // Threads running passes
        for _ in 0..2 {
            let cache = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _ = cache.evict_memory();
                }
            }));
        }

        for h in handles {
            h.join().expect("Thread panicked");
        }
    });

    cache.verify_residency().expect("consistent after passes");
}

// ========== Delta replacement ==========

#[test]
fn test_no_deadlock_compaction_racing_operations() {
    let config = NodeCacheConfig::default().with_background_evictor(false);
    let cache = Arc::new(NodeCache::new(config).expect("valid config"));
    for id in 0..20u64 {
        let slots = (0u8..10)
            .map(|i| {
                let slot = LeafSlot::new(vec![i; 16], 100);
                if i == 0 {
                    slot.dirty()
                } else {
                    slot
                }
            })
            .collect();
        cache.load_node(NodeSpec::leaf(NodeId(id), None, slots), CacheMode::Default);
    }

    let shared = Arc::clone(&cache);
    assert_completes("compaction racing operations", move || {
        let mut handles = vec![];

        // Compacting and reconstituting
        let cache = Arc::clone(&shared);
        handles.push(thread::spawn(move || {
            for round in 0..50u64 {
                let Some(node) = cache.get(NodeId(round % 20)) else {
                    continue;
                };
                if node.is_delta() {
                    let stored = (0u8..10).map(|i| LeafSlot::new(vec![i; 16], 100)).collect();
                    let _ = cache.reconstitute(&node, stored);
                } else {
                    let _ = cache.compact(&node);
                }
            }
        }));

        // Operating on the same nodes through stale and fresh handles
        for _ in 0..2 {
            let cache = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for i in 0..200u64 {
                    if let Some(node) = cache.get(NodeId(i % 20)) {
                        cache
                            .finish_op(&node, CacheMode::Default, OpEffect::container_only())
                            .expect("stale handles resolve to their successor");
                        cache
                            .on_node_dirtied(&node, None)
                            .expect("stale handles resolve to their successor");
                    }
                }
            }));
        }

        for h in handles {
            h.join().expect("Thread panicked");
        }
    });

    cache.verify_residency().expect("consistent after compaction");
}

// ========== Background daemon ==========

#[test]
fn test_no_deadlock_daemon_with_cursors() {
    let config = NodeCacheConfig::default()
        .with_max_memory(32 * 1024)
        .with_batch_bytes(4 * 1024)
        .with_critical_overage(8 * 1024);
    let cache = Arc::new(NodeCache::new(config).expect("valid config"));
    cache.load_node(NodeSpec::internal(NodeId(0), None, 100), CacheMode::Default);

    let shared = Arc::clone(&cache);
    assert_completes("daemon with cursors", move || {
        let mut handles = vec![];

        for t in 0..4u64 {
            let cache = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                let mut cursor = cache.cursor(Some(MODES[t as usize]));
                for i in 0..200u64 {
                    let loaded = cache.load_pinned(leaf(1 + t * 1000 + i, 0), MODES[t as usize]);
                    for slot in 0..2 {
                        cursor
                            .finish_op(&loaded.handle, None, None, OpEffect::read(slot))
                            .expect("cursor operation on a pinned node");
                    }
                    cache.unpin(&loaded.handle);
                }
                cursor.close();
            }));
        }

        // Budget changes while the daemon runs
        let cache = Arc::clone(&shared);
        handles.push(thread::spawn(move || {
            for i in 0..20u64 {
                let _ = cache.set_max_memory(16 * 1024 + (i % 4) * 8 * 1024);
                let _ = cache.eligibility(NodeId(0));
                thread::sleep(Duration::from_millis(1));
            }
        }));

        for h in handles {
            h.join().expect("Thread panicked");
        }
    });

    if let Some(daemon) = cache.daemon() {
        daemon.stop();
    }
    cache.verify_residency().expect("consistent after daemon run");
}
