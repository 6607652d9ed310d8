//! Process-wide memory accounting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running total of accounted bytes against a configurable maximum.
///
/// Every registered node contributes its approximate size, tracked or not.
#[derive(Debug)]
pub struct MemoryBudget {
    max_bytes: AtomicU64,
    used_bytes: AtomicU64,
}

impl MemoryBudget {
    /// Creates a budget with nothing accounted.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes: AtomicU64::new(max_bytes),
            used_bytes: AtomicU64::new(0),
        }
    }

    /// Configured maximum.
    #[must_use]
    pub fn max(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Accounted bytes.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Changes the maximum.
    pub fn set_max(&self, bytes: u64) {
        self.max_bytes.store(bytes, Ordering::Release);
    }

    /// Adds `bytes`, returning the new total.
    pub fn add(&self, bytes: u64) -> u64 {
        self.used_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Subtracts `bytes`, saturating at zero.
    pub fn sub(&self, bytes: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Applies a size change from `old` to `new` bytes.
    pub fn apply_delta(&self, old: u64, new: u64) {
        if new >= old {
            self.add(new - old);
        } else {
            self.sub(old - new);
        }
    }

    /// Bytes above the maximum, zero when within budget.
    #[must_use]
    pub fn excess(&self) -> u64 {
        self.used().saturating_sub(self.max())
    }

    /// Returns true if accounted bytes exceed the maximum.
    #[must_use]
    pub fn is_over(&self) -> bool {
        self.used() > self.max()
    }

    /// Returns true once `headroom` bytes are free below the maximum.
    #[must_use]
    pub fn has_headroom(&self, headroom: u64) -> bool {
        self.used().saturating_add(headroom) <= self.max()
    }
}
