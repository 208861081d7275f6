//! Queue favouring (table, client) pairs with the least queued work

use super::WorkQueue;
use crate::scheduler::work::WorkUnit;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

struct Entry {
    /// Negated count of units already queued for the same pair at push time
    priority: i64,
    seq: u64,
    unit: WorkUnit,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    // max-heap: higher priority first, then FIFO
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    outstanding: HashMap<(String, String), usize>,
    seq: u64,
}

/// Max-heap of units.
///
/// Each push is ranked below every unit already queued for the same pair, so
/// one pair with many child rows cannot starve the others.
#[derive(Default)]
pub(crate) struct PriorityQueue {
    state: Mutex<State>,
}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

fn pair_key(unit: &WorkUnit) -> (String, String) {
    (unit.table.name.clone(), unit.client.id().to_string())
}

impl WorkQueue for PriorityQueue {
    fn push(&self, unit: WorkUnit) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let outstanding = state.outstanding.entry(pair_key(&unit)).or_insert(0);
        let priority = -(*outstanding as i64);
        *outstanding += 1;
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            unit,
        });
    }

    fn pop(&self) -> Option<WorkUnit> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state.heap.pop()?;
        let key = pair_key(&entry.unit);
        if let Some(count) = state.outstanding.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                state.outstanding.remove(&key);
            }
        }
        Some(entry.unit)
    }

    fn len(&self) -> usize {
        self.state.lock().heap.len()
    }
}
