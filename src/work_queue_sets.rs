use std::collections::BTreeMap;

use crate::task::EnqueueOrder;
use crate::task_queue::{QueuePriority, TaskQueue};

/// Priority-bucketed index over work queues. Each bucket is an ordered map
/// keyed by the enqueue order of a queue's front task, so the oldest
/// runnable task in a bucket is the map's first entry.
///
/// Invariant: at most one entry per work queue across the whole structure.
/// The selector enforces it by removing a queue's recorded slot before
/// inserting a new one.
pub(crate) struct WorkQueueSets {
    sets: [BTreeMap<EnqueueOrder, TaskQueue>; QueuePriority::COUNT],
}

impl WorkQueueSets {
    pub(crate) fn new() -> Self {
        Self {
            sets: Default::default(),
        }
    }

    pub(crate) fn insert(&mut self, priority: QueuePriority, key: EnqueueOrder, queue: TaskQueue) {
        let prev = self.sets[priority.index()].insert(key, queue);
        debug_assert!(prev.is_none(), "duplicate work queue key {key}");
    }

    pub(crate) fn remove(&mut self, priority: QueuePriority, key: EnqueueOrder) {
        let removed = self.sets[priority.index()].remove(&key);
        debug_assert!(removed.is_some(), "no work queue under key {key}");
    }

    /// Queue holding the oldest selectable task in the bucket, with that
    /// task's enqueue order.
    pub(crate) fn oldest_in(&self, priority: QueuePriority) -> Option<(EnqueueOrder, &TaskQueue)> {
        self.sets[priority.index()]
            .first_key_value()
            .map(|(order, queue)| (*order, queue))
    }

    pub(crate) fn has_work_in(&self, priority: QueuePriority) -> bool {
        !self.sets[priority.index()].is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sets.iter().all(|s| s.is_empty())
    }
}
