//! Counter Aggregator: per-task delivered counts plus a global running total.
//!
//! The write path takes a read lock on the cell map and bumps two atomics.
//! Readers never block writers for longer than the map lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::TaskId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub per_task: HashMap<TaskId, u64>,
    pub global: u64,
}

#[derive(Debug, Default)]
pub struct CounterAggregator {
    cells: RwLock<HashMap<TaskId, Arc<AtomicU64>>>,
    global: AtomicU64,
}

impl CounterAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, task_id: TaskId) -> Arc<AtomicU64> {
        {
            let cells = self.cells.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cell) = cells.get(&task_id) {
                return Arc::clone(cell);
            }
        }
        let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(cells.entry(task_id).or_default())
    }

    /// Count one delivered message. Returns `(task_count, global_total)`.
    pub fn increment_on_success(&self, task_id: TaskId) -> (u64, u64) {
        let task_count = self.cell(task_id).fetch_add(1, Ordering::AcqRel) + 1;
        let global = self.global.fetch_add(1, Ordering::AcqRel) + 1;
        (task_count, global)
    }

    /// Seed a task's count from a persisted record. Never lowers an existing count.
    pub fn restore(&self, task_id: TaskId, count: u64) {
        let cell = self.cell(task_id);
        let previous = cell.fetch_max(count, Ordering::AcqRel);
        if count > previous {
            self.global.fetch_add(count - previous, Ordering::AcqRel);
        }
    }

    /// Forget a deleted task. The global total keeps its deliveries.
    pub fn remove(&self, task_id: TaskId) {
        let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
        cells.remove(&task_id);
    }

    pub fn get(&self, task_id: TaskId) -> u64 {
        let cells = self.cells.read().unwrap_or_else(|e| e.into_inner());
        cells
            .get(&task_id)
            .map_or(0, |cell| cell.load(Ordering::Acquire))
    }

    pub fn global(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let cells = self.cells.read().unwrap_or_else(|e| e.into_inner());
        let per_task = cells
            .iter()
            .map(|(id, cell)| (*id, cell.load(Ordering::Acquire)))
            .collect();
        CounterSnapshot {
            per_task,
            global: self.global(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[test]
    fn increments_task_and_global() {
        let counters = CounterAggregator::new();
        let (a, b) = (id(), id());
        assert_eq!(counters.increment_on_success(a), (1, 1));
        assert_eq!(counters.increment_on_success(b), (1, 2));
        assert_eq!(counters.increment_on_success(a), (2, 3));

        let snap = counters.snapshot();
        assert_eq!(snap.per_task[&a], 2);
        assert_eq!(snap.per_task[&b], 1);
        assert_eq!(snap.global, 3);
    }

    #[test]
    fn restore_seeds_counts_and_never_lowers_them() {
        let counters = CounterAggregator::new();
        let a = id();
        counters.restore(a, 7);
        assert_eq!(counters.get(a), 7);
        assert_eq!(counters.global(), 7);

        counters.restore(a, 3);
        assert_eq!(counters.get(a), 7);
        assert_eq!(counters.global(), 7);

        assert_eq!(counters.increment_on_success(a), (8, 8));
    }

    #[test]
    fn remove_keeps_global_total() {
        let counters = CounterAggregator::new();
        let a = id();
        counters.increment_on_success(a);
        counters.remove(a);
        assert_eq!(counters.get(a), 0);
        assert_eq!(counters.global(), 1);
        assert!(!counters.snapshot().per_task.contains_key(&a));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counters = Arc::new(CounterAggregator::new());
        let tasks: Vec<TaskId> = (0..4).map(|_| id()).collect();
        let handles: Vec<_> = tasks
            .iter()
            .map(|&task| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.increment_on_success(task);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.global(), 4000);
        for task in tasks {
            assert_eq!(counters.get(task), 1000);
        }
    }
}
