//! Per-operation cache modes.
//!
//! A cache mode controls whether an operation is allowed to change what is
//! resident and how recently it was used. The effective mode of an operation
//! is resolved from a precedence chain:
//!
//! 1. Operation override
//! 2. Cursor default
//! 3. Database default
//! 4. Environment default
//!
//! The mode is never stored on a node; it is recomputed for every call.
//!
//! | Mode | Leaf record after op | Container after op |
//! |------|----------------------|--------------------|
//! | `Default` | retained / added | moved to hot end |
//! | `Unchanged` | as before the op | position unchanged; evicted if loaded by the op and clean |
//! | `EvictLn` | evicted, never added | moved to hot end |
//! | `EvictBin` | evicted, never added | evicted unless dirty, then moved to hot end |

use serde::{Deserialize, Serialize};

/// Effective cache mode of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Normal recency tracking.
    #[default]
    Default,
    /// The operation must not alter residency or recency.
    Unchanged,
    /// The leaf record is never retained by this operation.
    EvictLn,
    /// The containing node is evicted after the operation unless dirty.
    EvictBin,
}

/// What happens to the container node once an operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPolicy {
    /// Move to the hot end of its shard, tracking it if needed.
    Promote,
    /// Leave the LRU position alone; discard the node if the operation
    /// loaded it and left it clean.
    KeepPosition,
    /// Discard the node unless it is dirty, in which case promote it.
    EvictUnlessDirty,
}

/// What happens to the leaf record an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPolicy {
    /// Keep the record resident, adding it if absent.
    Retain,
    /// Keep whatever residency the record had before the operation.
    Preserve,
    /// Drop the record if present and never add it.
    Evict,
}

impl CacheMode {
    /// All modes, in declaration order.
    pub const ALL: [CacheMode; 4] = [
        CacheMode::Default,
        CacheMode::Unchanged,
        CacheMode::EvictLn,
        CacheMode::EvictBin,
    ];

    /// Record residency rule for this mode.
    #[must_use]
    pub const fn record_policy(self) -> RecordPolicy {
        match self {
            Self::Default => RecordPolicy::Retain,
            Self::Unchanged => RecordPolicy::Preserve,
            Self::EvictLn | Self::EvictBin => RecordPolicy::Evict,
        }
    }

    /// Container LRU rule for this mode.
    #[must_use]
    pub const fn container_policy(self) -> ContainerPolicy {
        match self {
            Self::Default | Self::EvictLn => ContainerPolicy::Promote,
            Self::Unchanged => ContainerPolicy::KeepPosition,
            Self::EvictBin => ContainerPolicy::EvictUnlessDirty,
        }
    }

    /// Whether a node loaded under this mode goes to the hot end right away.
    ///
    /// Modes that may discard the container at the end of the operation park
    /// a freshly loaded node at the cold end until then.
    #[must_use]
    pub const fn promotes_on_load(self) -> bool {
        matches!(self.container_policy(), ContainerPolicy::Promote)
    }

    /// Whether the end-of-operation eviction is delayed while a cursor stays
    /// on the node.
    #[must_use]
    pub const fn defers_eviction(self) -> bool {
        !matches!(self.container_policy(), ContainerPolicy::Promote)
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Default => "DEFAULT",
            Self::Unchanged => "UNCHANGED",
            Self::EvictLn => "EVICT_LN",
            Self::EvictBin => "EVICT_BIN",
        };
        f.write_str(name)
    }
}

/// Resolves the effective cache mode of an operation.
///
/// Returns the first present value of `op_override`, `cursor_default`,
/// `db_default`, falling back to `env_default`.
#[must_use]
pub fn resolve_cache_mode(
    op_override: Option<CacheMode>,
    cursor_default: Option<CacheMode>,
    db_default: Option<CacheMode>,
    env_default: CacheMode,
) -> CacheMode {
    op_override
        .or(cursor_default)
        .or(db_default)
        .unwrap_or(env_default)
}
