//! Serializable bookkeeping for one allocator.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::Slot;

/// Snapshot of a [`SlotAllocator`](super::SlotAllocator)'s range and sets.
///
/// Sets are ordered so the persisted state file is stable between saves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    pub min: Slot,
    pub max: Slot,
    #[serde(default)]
    pub allocated: BTreeSet<Slot>,
    #[serde(default)]
    pub blacklisted: BTreeSet<Slot>,
}

impl SlotState {
    pub fn empty(min: Slot, max: Slot) -> Self {
        Self {
            min,
            max,
            allocated: BTreeSet::new(),
            blacklisted: BTreeSet::new(),
        }
    }

    /// Number of values in `[min, max]`. Assumes `min <= max`.
    pub fn size(&self) -> u64 {
        u64::from(self.max) - u64::from(self.min) + 1
    }

    pub fn contains(&self, slot: Slot) -> bool {
        (self.min..=self.max).contains(&slot)
    }

    pub fn is_available(&self, slot: Slot) -> bool {
        !self.allocated.contains(&slot) && !self.blacklisted.contains(&slot)
    }

    /// True when no value in the range can be handed out without amnesty.
    pub fn is_saturated(&self) -> bool {
        (self.allocated.len() + self.blacklisted.len()) as u64 >= self.size()
    }

    /// Restrict the state to `[min, max]`, dropping members outside it.
    ///
    /// A value present in both sets stays blacklisted. Returns how many
    /// entries were discarded.
    pub(crate) fn rebase(&mut self, min: Slot, max: Slot) -> usize {
        let before = self.allocated.len() + self.blacklisted.len();

        self.min = min;
        self.max = max;
        self.allocated.retain(|n| (min..=max).contains(n));
        self.blacklisted.retain(|n| (min..=max).contains(n));

        let blacklisted = &self.blacklisted;
        self.allocated.retain(|n| !blacklisted.contains(n));

        before - (self.allocated.len() + self.blacklisted.len())
    }
}
