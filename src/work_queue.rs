use std::collections::VecDeque;

use crate::task::{EnqueueOrder, Task};
use crate::task_queue::QueuePriority;

/// Which of a queue's two work queues a task lives in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum WorkQueueKind {
    Immediate,
    Delayed,
}

/// Ready-to-run tasks for one (queue, kind) pair, FIFO by enqueue order.
///
/// A fence is an enqueue-order threshold: tasks with order >= fence are
/// invisible to selection until the fence moves or is removed. `slot`
/// remembers the WorkQueueSets entry this queue currently occupies so the
/// selector can re-key it without a lookup.
pub(crate) struct WorkQueue {
    tasks: VecDeque<Task>,
    fence: EnqueueOrder,
    slot: Option<(QueuePriority, EnqueueOrder)>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            fence: EnqueueOrder::NONE,
            slot: None,
        }
    }

    // Tasks arrive strictly in enqueue order: immediate tasks are drained in
    // the order they were posted, delayed tasks take a fresh order when they
    // become ready. Fence checks rely on the front being the oldest.
    pub(crate) fn push(&mut self, task: Task) {
        debug_assert!(self
            .tasks
            .back()
            .map_or(true, |back| back.enqueue_order < task.enqueue_order));
        self.tasks.push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub(crate) fn front(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
    }

    pub(crate) fn fence(&self) -> EnqueueOrder {
        self.fence
    }

    pub(crate) fn set_fence(&mut self, fence: EnqueueOrder) {
        self.fence = fence;
    }

    /// True iff a fence is in place and it hides the whole queue: either the
    /// queue is empty (any future task would land past the fence) or the
    /// front task already sits at or past it.
    pub(crate) fn blocked_by_fence(&self) -> bool {
        if self.fence.is_none() {
            return false;
        }
        match self.tasks.front() {
            None => true,
            Some(front) => front.enqueue_order >= self.fence,
        }
    }

    /// Enqueue order of the front task if it is selectable, i.e. present and
    /// not hidden behind the fence.
    pub(crate) fn eligible_front(&self) -> Option<EnqueueOrder> {
        let front = self.tasks.front()?;
        if !self.fence.is_none() && front.enqueue_order >= self.fence {
            return None;
        }
        Some(front.enqueue_order)
    }

    pub(crate) fn slot(&self) -> Option<(QueuePriority, EnqueueOrder)> {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: Option<(QueuePriority, EnqueueOrder)>) {
        self.slot = slot;
    }
}
