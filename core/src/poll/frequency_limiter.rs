use crate::bitset::IndexBitset;
use crate::types::{InternalIndex, INVALID_INTERNAL_INDEX};

// PollFrequencyLimiter
/// Per-object frame counters that throttle how often an in-scope object is
/// sampled. A poll period of 0 means "sample every tick when dirty". An
/// object coupled to another via [`Self::set_poll_with_object`] consults the
/// owner's counter instead of its own, so subobjects always poll when their
/// root does.
pub struct PollFrequencyLimiter {
    poll_periods: Vec<u16>,
    frame_counters: Vec<u16>,
    /// Counter redirection; INVALID_INTERNAL_INDEX means "use own slot".
    poll_with: Vec<InternalIndex>,
    due_scratch: IndexBitset,
}

impl PollFrequencyLimiter {
    pub fn new() -> Self {
        Self {
            poll_periods: Vec::new(),
            frame_counters: Vec::new(),
            poll_with: Vec::new(),
            due_scratch: IndexBitset::new(),
        }
    }

    pub fn on_index_ceiling_increased(&mut self, new_ceiling: u32) {
        let len = new_ceiling as usize;
        if len > self.poll_periods.len() {
            self.poll_periods.resize(len, 0);
            self.frame_counters.resize(len, 0);
            self.poll_with.resize(len, INVALID_INTERNAL_INDEX);
        }
    }

    pub fn set_poll_period(&mut self, index: InternalIndex, frames: u16) {
        self.on_index_ceiling_increased(index + 1);
        self.poll_periods[index as usize] = frames;
        self.frame_counters[index as usize] = frames;
    }

    pub fn poll_period(&self, index: InternalIndex) -> u16 {
        self.poll_periods
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Couples `index`'s schedule to `owner`'s.
    pub fn set_poll_with_object(&mut self, owner: InternalIndex, index: InternalIndex) {
        self.on_index_ceiling_increased(owner.max(index) + 1);
        self.poll_with[index as usize] = owner;
    }

    /// Returns `index` to its own schedule slot.
    pub fn clear_poll_with(&mut self, index: InternalIndex) {
        if let Some(owner) = self.poll_with.get_mut(index as usize) {
            *owner = INVALID_INTERNAL_INDEX;
        }
    }

    /// Resets all schedule state for a recycled index.
    pub fn clear_index(&mut self, index: InternalIndex) {
        if (index as usize) < self.poll_periods.len() {
            self.poll_periods[index as usize] = 0;
            self.frame_counters[index as usize] = 0;
            self.poll_with[index as usize] = INVALID_INTERNAL_INDEX;
        }
    }

    fn counter_slot(&self, index: InternalIndex) -> InternalIndex {
        match self.poll_with.get(index as usize) {
            Some(owner) if *owner != INVALID_INTERNAL_INDEX => *owner,
            _ => index,
        }
    }

    /// Selects the relevant objects due this frame: forced objects bypass
    /// the counter entirely; everything else is selected when its counter
    /// slot has elapsed AND it carries accumulated dirtiness. Counters of
    /// selected slots restart at their period.
    pub fn update(
        &mut self,
        relevant: &IndexBitset,
        accumulated_dirty: &IndexBitset,
        forced: &IndexBitset,
        out: &mut IndexBitset,
    ) {
        self.due_scratch.clear_all();
        self.due_scratch.ensure_bit_capacity(relevant.bit_capacity());

        // Phase 1: tick down the counters of slots that own their schedule.
        relevant.for_each_set_bit(|index| {
            if self.counter_slot(index) != index {
                return;
            }
            let slot = index as usize;
            if slot >= self.frame_counters.len() {
                self.due_scratch.set_bit(index);
                return;
            }
            if self.frame_counters[slot] > 0 {
                self.frame_counters[slot] -= 1;
            }
            if self.frame_counters[slot] == 0 {
                self.due_scratch.set_bit(index);
            }
        });

        // Phase 2: select. Coupled objects look at their owner's slot so a
        // whole group becomes due on the same frame.
        relevant.for_each_set_bit(|index| {
            if forced.get_bit(index) {
                out.set_bit(index);
                return;
            }
            let slot = self.counter_slot(index);
            if self.due_scratch.get_bit(slot) && accumulated_dirty.get_bit(index) {
                out.set_bit(index);
            }
        });

        // Restart the counters of every slot that got sampled.
        out.for_each_set_bit(|index| {
            let slot = self.counter_slot(index) as usize;
            if slot < self.frame_counters.len() {
                self.frame_counters[slot] = self.poll_periods[slot];
            }
        });
    }
}

impl Default for PollFrequencyLimiter {
    fn default() -> Self {
        Self::new()
    }
}
