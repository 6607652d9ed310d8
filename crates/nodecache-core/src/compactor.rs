//! Delta compaction of leaf containers.
//!
//! A dirty leaf container whose changes are small compared to its full
//! content can drop everything that is already durable and keep only its
//! dirty slots. The resulting delta is much smaller and still carries every
//! change that has to reach the log.
//!
//! ```text
//!   full:  [k1 clean][k2 dirty][k3 clean][k4 clean]   ratio = dirty / full
//!   delta: [k2 dirty]                                  if ratio < threshold
//! ```

use thiserror::Error;

use crate::node::{estimate_bytes, LeafSlot, NodeBody, NodeKind, Residency};

/// Why a node cannot be compacted.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum NotEligible {
    /// The handle was evicted or replaced.
    #[error("node is not resident")]
    NotResident,
    /// Only leaf containers have a delta form.
    #[error("node is not a leaf container")]
    NotLeafContainer,
    /// A clean node has nothing to keep.
    #[error("node is not dirty")]
    NotDirty,
    /// The node is a delta already.
    #[error("node is already a delta")]
    AlreadyDelta,
    /// A cursor is positioned on the node.
    #[error("node is pinned")]
    Pinned,
    /// Every slot is dirty, so compaction would save nothing.
    #[error("node has no clean slot")]
    NoCleanSlots,
    /// Dirty slots are too large a share of the node.
    #[error("dirty ratio {ratio:.3} is not below threshold {threshold:.3}")]
    RatioTooHigh {
        /// Dirty-to-full entry byte ratio.
        ratio: f64,
        /// Configured threshold.
        threshold: f64,
    },
}

/// Outcome of a successful eligibility check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaPlan {
    /// Slots carried into the delta.
    pub retained_slots: usize,
    /// Slots dropped from memory.
    pub dropped_slots: usize,
    /// Size of the full node.
    pub bytes_before: u64,
    /// Size of the delta.
    pub bytes_after: u64,
    /// Dirty-to-full entry byte ratio.
    pub ratio: f64,
}

impl DeltaPlan {
    /// Bytes the compaction frees.
    #[must_use]
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Decides on and builds delta representations.
#[derive(Debug, Clone, Copy)]
pub struct NodeCompactor {
    threshold: f64,
}

impl NodeCompactor {
    /// Creates a compactor with a validated threshold in (0, 1).
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Dirty-to-full byte ratio below which compaction happens.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Checks eligibility of a node body.
    ///
    /// Resident leaf records are not required: clean slots are dropped with
    /// or without them.
    pub(crate) fn plan(&self, kind: NodeKind, body: &NodeBody) -> Result<DeltaPlan, NotEligible> {
        if !body.is_resident() {
            return Err(NotEligible::NotResident);
        }
        if kind != NodeKind::LeafContainer {
            return Err(NotEligible::NotLeafContainer);
        }
        if body.is_delta {
            return Err(NotEligible::AlreadyDelta);
        }
        if !body.dirty {
            return Err(NotEligible::NotDirty);
        }
        if body.pins > 0 {
            return Err(NotEligible::Pinned);
        }
        let clean = body.clean_slot_count();
        if clean == 0 {
            return Err(NotEligible::NoCleanSlots);
        }

        // Resident records count on both sides: they stay with dirty slots
        // in the delta and leave with clean ones.
        let full = body.full_entry_bytes();
        let dirty = body.dirty_entry_bytes();
        #[allow(clippy::cast_precision_loss)]
        let ratio = dirty as f64 / full as f64;
        if ratio >= self.threshold {
            return Err(NotEligible::RatioTooHigh {
                ratio,
                threshold: self.threshold,
            });
        }

        let retained = body.slots.len() - clean;
        let bytes_after = estimate_bytes(
            NodeKind::LeafContainer,
            true,
            &delta_slots(&body.slots),
            0,
        );
        Ok(DeltaPlan {
            retained_slots: retained,
            dropped_slots: clean,
            bytes_before: body.approx_bytes,
            bytes_after,
            ratio,
        })
    }

    /// Builds the body of the delta that replaces `body`.
    ///
    /// The returned body is resident, dirty, flagged as a delta and not yet
    /// tracked; installing it is up to the caller.
    pub(crate) fn build_delta(
        &self,
        kind: NodeKind,
        body: &NodeBody,
    ) -> Result<(NodeBody, DeltaPlan), NotEligible> {
        let plan = self.plan(kind, body)?;
        let slots = delta_slots(&body.slots);
        let delta = NodeBody {
            residency: Residency::Resident,
            dirty: true,
            is_delta: true,
            approx_bytes: plan.bytes_after,
            slots,
            entries: 0,
            resident_children: 0,
            pins: 0,
            parent_counted: body.parent_counted,
            membership: None,
            fresh: body.fresh,
        };
        Ok((delta, plan))
    }
}

fn delta_slots(slots: &[LeafSlot]) -> Vec<LeafSlot> {
    slots.iter().filter(|s| s.dirty).cloned().collect()
}

/// Merges durable slots with the dirty slots of a delta, by key.
///
/// Slots of the delta win over stored slots with the same key. The result is
/// sorted by key.
pub(crate) fn merge_slots(stored: Vec<LeafSlot>, delta: &[LeafSlot]) -> Vec<LeafSlot> {
    let mut merged: Vec<LeafSlot> = stored
        .into_iter()
        .filter(|s| !delta.iter().any(|d| d.key == s.key))
        .collect();
    merged.extend(delta.iter().cloned());
    merged.sort_by(|a, b| a.key.cmp(&b.key));
    merged
}
