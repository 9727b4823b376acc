use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::bitset::IndexBitset;
use crate::types::InternalIndex;

use super::error::GlobalDirtyError;

const MAX_POLLERS: u32 = 32;

struct CycleSnapshot {
    dirty: IndexBitset,
    force: IndexBitset,
}

struct GlobalDirtyState {
    dirty: IndexBitset,
    force: IndexBitset,
    /// Bits captured when the first poller of the current cycle drained.
    /// Only these are cleared once every poller has consumed - marks landing
    /// mid-cycle survive into the next cycle so no poller ever loses them.
    cycle: Option<CycleSnapshot>,
    poller_mask: u32,
    consumed_mask: u32,
    reset_pending: bool,
}

// GlobalDirtyRegistry
/// Cross-thread dirty registry. Any game-logic thread may mark objects dirty
/// here at any time; each replication system registers as a poller and
/// drains the set once per tick. The reset is deferred until every
/// registered poller has consumed the cycle, so one system's early drain
/// cannot drop dirty bits a second system still needs.
#[derive(Clone)]
pub struct GlobalDirtyRegistry {
    state: Arc<Mutex<GlobalDirtyState>>,
}

impl GlobalDirtyRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GlobalDirtyState {
                dirty: IndexBitset::new(),
                force: IndexBitset::new(),
                cycle: None,
                poller_mask: 0,
                consumed_mask: 0,
                reset_pending: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalDirtyState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Safe to call from any thread, at any point in the tick.
    pub fn mark_dirty(&self, index: InternalIndex) {
        self.lock().dirty.set_bit(index);
    }

    /// Marks dirty and flags the object to bypass its poll period.
    pub fn mark_force_update(&self, index: InternalIndex) {
        let mut state = self.lock();
        state.dirty.set_bit(index);
        state.force.set_bit(index);
    }

    pub fn register_poller(&self) -> Result<GlobalDirtyPoller, GlobalDirtyError> {
        let mut state = self.lock();
        let free = !state.poller_mask;
        if free == 0 || state.poller_mask.count_ones() >= MAX_POLLERS {
            return Err(GlobalDirtyError::PollerLimitReached { limit: MAX_POLLERS });
        }
        let id_bit = free & free.wrapping_neg();
        state.poller_mask |= id_bit;
        info!(
            "GlobalDirtyRegistry: registered poller {} ({} active)",
            id_bit.trailing_zeros(),
            state.poller_mask.count_ones()
        );
        Ok(GlobalDirtyPoller {
            state: Arc::clone(&self.state),
            id_bit,
        })
    }

    pub fn poller_count(&self) -> u32 {
        self.lock().poller_mask.count_ones()
    }

    pub fn is_marked_dirty(&self, index: InternalIndex) -> bool {
        self.lock().dirty.get_bit(index)
    }
}

impl Default for GlobalDirtyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// GlobalDirtyPoller
/// One replication system's consumption handle on the global registry.
pub struct GlobalDirtyPoller {
    state: Arc<Mutex<GlobalDirtyState>>,
    id_bit: u32,
}

impl GlobalDirtyPoller {
    /// Copies the global dirty and force sets into the caller's accumulated
    /// sets and requests the deferred reset. The shared sets are cleared of
    /// the cycle snapshot only when every registered poller has consumed.
    pub fn poll_into(&self, dirty_out: &mut IndexBitset, force_out: &mut IndexBitset) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.cycle.is_none() {
            state.cycle = Some(CycleSnapshot {
                dirty: state.dirty.clone(),
                force: state.force.clone(),
            });
        }

        dirty_out.or(&state.dirty);
        force_out.or(&state.force);

        state.consumed_mask |= self.id_bit;
        state.reset_pending = true;
        Self::try_complete_reset(&mut state);
    }

    fn try_complete_reset(state: &mut GlobalDirtyState) {
        if !state.reset_pending || state.consumed_mask != state.poller_mask {
            return;
        }
        if let Some(snapshot) = state.cycle.take() {
            state.dirty.and_not(&snapshot.dirty);
            state.force.and_not(&snapshot.force);
        }
        state.consumed_mask = 0;
        state.reset_pending = false;
    }
}

impl Drop for GlobalDirtyPoller {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.poller_mask &= !self.id_bit;
        state.consumed_mask &= !self.id_bit;
        if state.poller_mask == 0 {
            state.consumed_mask = 0;
            state.cycle = None;
            state.reset_pending = false;
        } else {
            // a departing poller must not hold up everyone else's reset
            Self::try_complete_reset(&mut state);
        }
    }
}
