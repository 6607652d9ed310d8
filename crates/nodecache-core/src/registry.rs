//! Arena of resident node handles.
//!
//! Handles refer to parents and children by [`NodeId`]; resolving an id goes
//! through this registry, which owns one strong reference per resident node.
//! A lookup clones the `Arc` and drops the map guard before returning, so no
//! caller ever acquires a node latch while holding a registry shard lock.

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;

use crate::node::{NodeHandle, NodeId};

/// Resident handles keyed by node identity.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Arc<NodeHandle>, FxBuildHasher>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Current handle for `id`.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Arc<NodeHandle>> {
        self.nodes.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns true if a handle is registered for `id`.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no handle is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registers `handle` unless a handle for the same id already exists.
    ///
    /// Returns the existing handle as `Err`.
    pub(crate) fn insert_if_absent(
        &self,
        handle: Arc<NodeHandle>,
    ) -> Result<Arc<NodeHandle>, Arc<NodeHandle>> {
        use dashmap::mapref::entry::Entry;
        match self.nodes.entry(handle.id()) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Swaps `old` for `new` if `old` is still the registered handle.
    pub(crate) fn replace(&self, old: &Arc<NodeHandle>, new: Arc<NodeHandle>) -> bool {
        match self.nodes.get_mut(&old.id()) {
            Some(mut entry) if Arc::ptr_eq(entry.value(), old) => {
                *entry.value_mut() = new;
                true
            }
            _ => false,
        }
    }

    /// Removes `handle` if it is still the registered handle for its id.
    pub(crate) fn remove(&self, handle: &Arc<NodeHandle>) -> bool {
        self.nodes
            .remove_if(&handle.id(), |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Snapshot of all registered handles.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
