//! Queue popping a uniformly random unit

use super::WorkQueue;
use crate::scheduler::work::WorkUnit;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct State {
    units: Vec<WorkUnit>,
    rng: StdRng,
}

/// Push appends; pop swaps a random unit with the last one and removes it
pub(crate) struct RandomQueue {
    state: Mutex<State>,
}

impl RandomQueue {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(State {
                units: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }
}

impl WorkQueue for RandomQueue {
    fn push(&self, unit: WorkUnit) {
        self.state.lock().units.push(unit);
    }

    fn pop(&self) -> Option<WorkUnit> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.units.is_empty() {
            return None;
        }
        let index = state.rng.gen_range(0..state.units.len());
        Some(state.units.swap_remove(index))
    }

    fn len(&self) -> usize {
        self.state.lock().units.len()
    }
}
