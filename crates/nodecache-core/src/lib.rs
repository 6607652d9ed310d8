//! # Nodecache Core
//!
//! In-memory node cache and eviction engine for B-tree storage engines.
//!
//! The cache keeps a lightweight handle per resident tree node, tracks
//! recency in sharded LRU lists and keeps accounted memory under a budget by
//! evicting clean nodes, compacting dirty leaf containers to deltas, and
//! flushing dirty nodes as a last resort.
//!
//! ## Features
//!
//! - **Sharded LRU**: O(1) touch, untrack and cold-end peek per shard
//! - **Cache modes**: per-operation `DEFAULT`, `UNCHANGED`, `EVICT_LN`, `EVICT_BIN`
//! - **Race-safe eviction**: generation checks instead of long-held locks
//! - **Delta compaction**: dirty leaf containers shrink to their dirty slots
//! - **Background evictor**: daemon thread plus inline critical passes
//!
//! ## Quick Start
//!
//! ```rust
//! use nodecache_core::{CacheMode, LeafSlot, NodeCache, NodeCacheConfig, NodeId, NodeSpec, OpEffect};
//!
//! let config = NodeCacheConfig::default().with_max_memory(1024 * 1024);
//! let cache = NodeCache::new(config)?;
//!
//! let root = cache.load_node(NodeSpec::internal(NodeId(1), None, 1), CacheMode::Default);
//! let leaf = cache.load_node(
//!     NodeSpec::leaf(NodeId(2), Some(NodeId(1)), vec![LeafSlot::new(&b"apple"[..], 128)]),
//!     CacheMode::Default,
//! );
//!
//! let mode = cache.resolve_cache_mode(None, None, Some(CacheMode::EvictBin));
//! cache.finish_op(&leaf.handle, mode, OpEffect::read(0))?;
//!
//! assert!(cache.get(NodeId(2)).is_none());
//! assert!(root.handle.is_resident());
//! # Ok::<(), nodecache_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]

pub mod budget;
pub mod cache;
pub mod cache_mode;
pub mod collaborators;
pub mod compactor;
pub mod config;
pub mod cursor;
#[cfg(test)]
mod deadlock_tests;
pub mod error;
pub mod evictor;
pub mod failure;
pub mod lru;
pub mod node;
pub mod registry;

pub use budget::MemoryBudget;
pub use cache::{ContainerOutcome, Loaded, NodeCache, NodeCacheBuilder, OpEffect, OpOutcome};
pub use cache_mode::{resolve_cache_mode, CacheMode, ContainerPolicy, RecordPolicy};
pub use collaborators::{DurableLocation, FlushRequest, LogWriter, NullLog, RetainingTree, TreeMutator};
pub use compactor::{DeltaPlan, NodeCompactor, NotEligible};
pub use config::{ConfigError, NodeCacheConfig};
pub use cursor::CursorResidency;
pub use error::{Error, Result};
pub use evictor::{EvictionSource, EvictionStats, EvictionStatsSnapshot, EvictorDaemon, PassReport};
pub use failure::{EnvironmentFailure, FailureChannel, FailureKind};
pub use lru::{ListMembership, LruShard, LruShards, ShardId};
pub use node::{Eligibility, LeafSlot, NodeHandle, NodeId, NodeKind, NodeSnapshot, NodeSpec};
pub use registry::NodeRegistry;
