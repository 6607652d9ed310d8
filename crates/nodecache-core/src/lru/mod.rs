//! LRU residency tracking.
//!
//! Resident nodes are spread over several independent [`LruShard`]s so that
//! touches on different nodes rarely contend on the same lock.
//!
//! # Thread-Safety & Lock Ordering
//!
//! **Lock Hierarchy (acquire in this order to prevent deadlocks):**
//! 1. Node latch (`NodeHandle` body)
//! 2. `LruShard.list`
//!
//! A node's membership is only changed while holding its latch and the list
//! lock of its shard, so the position stored in the node and the entry in the
//! list never disagree. Cold-end peeks take the list lock alone.

mod list;
mod shard;

pub use list::{IndexList, ListPosition};
pub use shard::LruShard;

use rustc_hash::FxHasher;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use crate::node::{NodeBody, NodeHandle, NodeId};

/// Identity of an LRU shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub usize);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Where a tracked node sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListMembership {
    /// Shard holding the node.
    pub shard: ShardId,
    /// Position inside the shard.
    pub position: ListPosition,
}

/// The set of LRU shards of one cache.
#[derive(Debug)]
pub struct LruShards {
    shards: Vec<LruShard>,
}

impl LruShards {
    /// Creates `count` empty shards (at least one).
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            shards: (0..count.max(1)).map(|i| LruShard::new(ShardId(i))).collect(),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false: there is at least one shard.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this set.
    #[must_use]
    pub fn shard(&self, id: ShardId) -> &LruShard {
        &self.shards[id.0]
    }

    /// Iterates over all shards.
    pub fn iter(&self) -> impl Iterator<Item = &LruShard> {
        self.shards.iter()
    }

    /// Shard for a newly tracked node, by stable hash of its identity.
    #[must_use]
    pub fn shard_for(&self, id: NodeId) -> ShardId {
        let mut hasher = FxHasher::default();
        hasher.write_u64(id.0);
        ShardId((hasher.finish() % self.shards.len() as u64) as usize)
    }

    /// Moves `node` to the hot end if `to_hot_end`, tracking it if needed.
    ///
    /// Returns true if the node is tracked after the call. A handle that was
    /// evicted or replaced concurrently is left alone and false is returned.
    pub fn touch(&self, node: &Arc<NodeHandle>, to_hot_end: bool) -> bool {
        let mut body = node.latch();
        self.touch_locked(node, &mut body, to_hot_end)
    }

    /// Removes `node` from its shard. Idempotent.
    pub fn untrack(&self, node: &NodeHandle) -> bool {
        let mut body = node.latch();
        self.untrack_locked(node, &mut body)
    }

    /// Coldest tracked node of a shard.
    #[must_use]
    pub fn peek_cold(&self, shard: ShardId) -> Option<Arc<NodeHandle>> {
        self.shard(shard).peek_cold()
    }

    /// Total tracked handles.
    #[must_use]
    pub fn tracked_nodes(&self) -> usize {
        self.shards.iter().map(LruShard::len).sum()
    }

    /// Total tracked bytes.
    #[must_use]
    pub fn tracked_bytes(&self) -> u64 {
        self.shards.iter().map(LruShard::tracked_bytes).sum()
    }

    pub(crate) fn touch_locked(
        &self,
        node: &Arc<NodeHandle>,
        body: &mut NodeBody,
        to_hot_end: bool,
    ) -> bool {
        if !body.is_resident() {
            return false;
        }
        let shard = self.shard(node.shard());
        match body.membership {
            Some(m) => {
                if to_hot_end {
                    shard.move_to_hot(node, m.position);
                }
            }
            None => {
                let position = shard.insert_hot(Arc::clone(node), body.approx_bytes);
                body.membership = Some(ListMembership {
                    shard: node.shard(),
                    position,
                });
            }
        }
        true
    }

    /// Tracks an untracked node at the cold end. A tracked node keeps its
    /// position.
    pub(crate) fn track_cold_locked(&self, node: &Arc<NodeHandle>, body: &mut NodeBody) -> bool {
        if !body.is_resident() {
            return false;
        }
        if body.membership.is_none() {
            let position = self
                .shard(node.shard())
                .insert_cold(Arc::clone(node), body.approx_bytes);
            body.membership = Some(ListMembership {
                shard: node.shard(),
                position,
            });
        }
        true
    }

    pub(crate) fn untrack_locked(&self, node: &NodeHandle, body: &mut NodeBody) -> bool {
        match body.membership.take() {
            Some(m) => {
                let removed = self.shard(m.shard).remove(m.position, body.approx_bytes);
                debug_assert!(removed.is_some_and(|n| n.id() == node.id()));
                true
            }
            None => false,
        }
    }

    /// Keeps the shard byte total in step with a size change of a tracked node.
    pub(crate) fn resize_locked(&self, body: &NodeBody, old_bytes: u64, new_bytes: u64) {
        if let Some(m) = body.membership {
            self.shard(m.shard).resize(old_bytes, new_bytes);
        }
    }

    /// Moves the membership of `old_body` to `new`, at the hot end.
    pub(crate) fn replace_locked(
        &self,
        old_body: &mut NodeBody,
        new: &Arc<NodeHandle>,
        new_body: &mut NodeBody,
    ) {
        match old_body.membership.take() {
            Some(m) => {
                let swapped = self.shard(m.shard).replace_and_promote(
                    m.position,
                    Arc::clone(new),
                    old_body.approx_bytes,
                    new_body.approx_bytes,
                );
                debug_assert!(swapped);
                new_body.membership = Some(m);
            }
            None => {
                self.touch_locked(new, new_body, true);
            }
        }
    }
}
