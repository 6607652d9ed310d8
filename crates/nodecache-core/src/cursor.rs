//! Cursor-scoped residency.
//!
//! Several operations through one cursor on the same node should not each
//! pay for `Unchanged` or `EvictBin` eviction. A [`CursorResidency`] pins the
//! node it is positioned on and applies the postponed eviction only when it
//! moves to another node or closes.

use std::sync::Arc;

use crate::cache::{ContainerOutcome, NodeCache, OpEffect, OpOutcome};
use crate::cache_mode::CacheMode;
use crate::error::Result;
use crate::node::NodeHandle;

/// Residency state of one open cursor.
#[derive(Debug)]
pub struct CursorResidency<'a> {
    cache: &'a NodeCache,
    default_mode: Option<CacheMode>,
    current: Option<Arc<NodeHandle>>,
    last_mode: CacheMode,
}

impl<'a> CursorResidency<'a> {
    pub(crate) fn new(cache: &'a NodeCache, default_mode: Option<CacheMode>) -> Self {
        Self {
            cache,
            default_mode,
            current: None,
            last_mode: CacheMode::Default,
        }
    }

    /// Node the cursor is positioned on.
    #[must_use]
    pub fn current(&self) -> Option<&Arc<NodeHandle>> {
        self.current.as_ref()
    }

    /// Cursor default mode.
    #[must_use]
    pub fn default_mode(&self) -> Option<CacheMode> {
        self.default_mode
    }

    /// Positions the cursor on `node`, pinning it.
    ///
    /// Moving off the previous node applies its postponed eviction, whose
    /// outcome is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotResident`](crate::Error::NodeNotResident) if
    /// `node` was evicted before the cursor reached it.
    pub fn move_to(&mut self, node: &Arc<NodeHandle>) -> Result<Option<ContainerOutcome>> {
        if self.current.as_ref().is_some_and(|c| c.id() == node.id()) {
            return Ok(None);
        }
        self.cache.pin(node)?;
        let previous = self.current.replace(Arc::clone(node));
        Ok(previous.map(|prev| {
            self.cache.unpin(&prev);
            self.cache.deferred_evict_on_cursor_move(&prev, self.last_mode)
        }))
    }

    /// Finishes one operation on `node` through this cursor.
    ///
    /// The mode is resolved from `op_override`, the cursor default,
    /// `db_default` and the environment default, in that order.
    ///
    /// # Errors
    ///
    /// See [`NodeCache::finish_cursor_op`].
    pub fn finish_op(
        &mut self,
        node: &Arc<NodeHandle>,
        op_override: Option<CacheMode>,
        db_default: Option<CacheMode>,
        effect: OpEffect,
    ) -> Result<OpOutcome> {
        self.move_to(node)?;
        let mode = self
            .cache
            .resolve_cache_mode(op_override, self.default_mode, db_default);
        let outcome = self.cache.finish_cursor_op(node, mode, effect)?;
        self.last_mode = mode;
        Ok(outcome)
    }

    /// Closes the cursor, applying the postponed eviction of its node.
    pub fn close(&mut self) -> Option<ContainerOutcome> {
        let node = self.current.take()?;
        self.cache.unpin(&node);
        Some(
            self.cache
                .deferred_evict_on_cursor_close(&node, self.last_mode),
        )
    }
}

impl Drop for CursorResidency<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
