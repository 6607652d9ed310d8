//! A single LRU shard.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::list::{IndexList, ListPosition};
use super::ShardId;
use crate::node::NodeHandle;

/// Ordered set of tracked node handles, hot end to cold end.
///
/// The list lock is held only for the list operation itself. Generations are
/// advanced under this lock whenever a node moves, so a cold-end peek always
/// returns a generation that matches the position it observed.
#[derive(Debug)]
pub struct LruShard {
    id: ShardId,
    list: Mutex<IndexList<Arc<NodeHandle>>>,
    tracked_bytes: AtomicU64,
}

impl LruShard {
    pub(crate) fn new(id: ShardId) -> Self {
        Self {
            id,
            list: Mutex::new(IndexList::new()),
            tracked_bytes: AtomicU64::new(0),
        }
    }

    /// Shard identity.
    #[must_use]
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Number of tracked handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Returns true if nothing is tracked in this shard.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Bytes of all handles tracked in this shard.
    #[must_use]
    pub fn tracked_bytes(&self) -> u64 {
        self.tracked_bytes.load(Ordering::Acquire)
    }

    /// Coldest tracked handle, without removing it.
    #[must_use]
    pub fn peek_cold(&self) -> Option<Arc<NodeHandle>> {
        self.list.lock().peek_cold().map(|(_, node)| Arc::clone(node))
    }

    /// Coldest handle together with the generation it had at the cold end.
    pub(crate) fn peek_cold_with_generation(&self) -> Option<(Arc<NodeHandle>, u64)> {
        let list = self.list.lock();
        list.peek_cold()
            .map(|(_, node)| (Arc::clone(node), node.generation()))
    }

    pub(crate) fn insert_hot(&self, node: Arc<NodeHandle>, bytes: u64) -> ListPosition {
        let mut list = self.list.lock();
        node.bump_generation();
        let pos = list.push_hot(node);
        self.tracked_bytes.fetch_add(bytes, Ordering::AcqRel);
        pos
    }

    pub(crate) fn insert_cold(&self, node: Arc<NodeHandle>, bytes: u64) -> ListPosition {
        let mut list = self.list.lock();
        node.bump_generation();
        let pos = list.push_cold(node);
        self.tracked_bytes.fetch_add(bytes, Ordering::AcqRel);
        pos
    }

    pub(crate) fn move_to_hot(&self, node: &NodeHandle, pos: ListPosition) -> bool {
        let mut list = self.list.lock();
        debug_assert!(list.get(pos).is_some_and(|n| n.id() == node.id()));
        node.bump_generation();
        list.move_to_hot(pos)
    }

    pub(crate) fn remove(&self, pos: ListPosition, bytes: u64) -> Option<Arc<NodeHandle>> {
        let mut list = self.list.lock();
        let removed = list.remove(pos);
        if removed.is_some() {
            self.sub_bytes(bytes);
        }
        removed
    }

    /// Swaps the handle at `pos` for `node` and moves it to the hot end.
    pub(crate) fn replace_and_promote(
        &self,
        pos: ListPosition,
        node: Arc<NodeHandle>,
        old_bytes: u64,
        new_bytes: u64,
    ) -> bool {
        let mut list = self.list.lock();
        node.bump_generation();
        if list.replace(pos, node).is_none() {
            return false;
        }
        list.move_to_hot(pos);
        self.sub_bytes(old_bytes);
        self.tracked_bytes.fetch_add(new_bytes, Ordering::AcqRel);
        true
    }

    pub(crate) fn resize(&self, old_bytes: u64, new_bytes: u64) {
        if new_bytes >= old_bytes {
            self.tracked_bytes
                .fetch_add(new_bytes - old_bytes, Ordering::AcqRel);
        } else {
            self.sub_bytes(old_bytes - new_bytes);
        }
    }

    /// Entries from cold to hot, for verification.
    pub(crate) fn entries(&self) -> Vec<(ListPosition, Arc<NodeHandle>)> {
        self.list
            .lock()
            .iter_from_cold()
            .map(|(pos, node)| (pos, Arc::clone(node)))
            .collect()
    }

    fn sub_bytes(&self, bytes: u64) {
        let _ = self
            .tracked_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }
}
