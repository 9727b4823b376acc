use crate::bitset::IndexBitset;
use crate::types::InternalIndex;

use super::global_registry::GlobalDirtyPoller;

// DirtyTracker
/// Local per-system dirty state. "Dirty this frame" is transient;
/// "accumulated" persists until the object has actually been sampled.
/// Cross-thread writers never touch this - they go through the global
/// registry, which the owning system drains once per tick.
pub struct DirtyTracker {
    dirty_this_frame: IndexBitset,
    accumulated: IndexBitset,
    force_update: IndexBitset,
    /// Debug-only external access guard. The lock window is confined to the
    /// tick thread, so this is an assertion, not a runtime lock.
    locked: bool,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self {
            dirty_this_frame: IndexBitset::new(),
            accumulated: IndexBitset::new(),
            force_update: IndexBitset::new(),
            locked: false,
        }
    }

    pub fn mark_dirty(&mut self, index: InternalIndex) {
        debug_assert!(
            !self.locked,
            "mark_dirty called inside the external access lock window"
        );
        self.dirty_this_frame.set_bit(index);
    }

    /// Marks dirty and requests a poll that bypasses the poll period.
    pub fn force_update(&mut self, index: InternalIndex) {
        debug_assert!(
            !self.locked,
            "force_update called inside the external access lock window"
        );
        self.dirty_this_frame.set_bit(index);
        self.force_update.set_bit(index);
    }

    /// Drains the cross-thread registry into the accumulated set. Called at
    /// the start of the tick, before the poll list is built.
    pub fn absorb_global(&mut self, poller: &GlobalDirtyPoller) {
        poller.poll_into(&mut self.accumulated, &mut self.force_update);
    }

    /// Merges this tick's newly dirtied objects into the accumulated set and
    /// locks out further marking until [`Self::reconcile`].
    pub fn update_and_lock(&mut self) {
        debug_assert!(!self.locked, "update_and_lock called twice without reconcile");
        self.accumulated.or(&self.dirty_this_frame);
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Clears dirty and force bits only for the objects actually sampled
    /// this tick. Objects filtered out of scope keep their accumulated bit
    /// so their changes are not silently lost once back in scope.
    pub fn reconcile(&mut self, sampled: &IndexBitset) {
        self.accumulated.and_not(sampled);
        self.force_update.and_not(sampled);
        self.dirty_this_frame.and_not(sampled);
        self.locked = false;
    }

    /// Drops all state for a destroyed index so a recycled slot starts clean.
    pub fn clear_index(&mut self, index: InternalIndex) {
        self.dirty_this_frame.clear_bit(index);
        self.accumulated.clear_bit(index);
        self.force_update.clear_bit(index);
    }

    pub fn accumulated_bits(&self) -> &IndexBitset {
        &self.accumulated
    }

    pub fn force_update_bits(&self) -> &IndexBitset {
        &self.force_update
    }

    pub fn force_update_bits_mut(&mut self) -> &mut IndexBitset {
        &mut self.force_update
    }

    pub fn dirty_this_frame_bits(&self) -> &IndexBitset {
        &self.dirty_this_frame
    }
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self::new()
    }
}
