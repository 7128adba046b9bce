use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Global ordering key assigned when a task is posted. Strictly increasing
/// and unique across every queue owned by one manager; it is the only thing
/// that decides "oldest" between tasks from different queues.
///
/// `NONE` (zero) doubles as the "no fence" sentinel, so real orders start
/// at 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EnqueueOrder(pub(crate) u64);

impl EnqueueOrder {
    pub const NONE: EnqueueOrder = EnqueueOrder(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EnqueueOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Shared monotonic counter behind `EnqueueOrder`. The manager owns one and
/// hands a clone to every queue it creates; there is no process-wide global.
#[derive(Clone, Debug)]
pub struct EnqueueOrderGenerator(Arc<AtomicU64>);

impl EnqueueOrderGenerator {
    pub(crate) fn new() -> Self {
        // 0 is reserved for EnqueueOrder::NONE
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub(crate) fn next(&self) -> EnqueueOrder {
        EnqueueOrder(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether a task may run while the host loop is nested inside a task that
/// is itself being run by the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Nestability {
    Nestable,
    NonNestable,
}

/// Cancels a delayed task posted with `post_cancellable_delayed_task`.
/// Cancelling after the task has run is a no-op.
#[derive(Clone, Debug)]
pub struct TaskCanceller {
    flag: Arc<AtomicBool>,
}

impl TaskCanceller {
    pub(crate) fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Read-only task metadata handed to observers.
#[derive(Clone, Copy, Debug)]
pub struct TaskMetadata {
    pub posted_from: &'static Location<'static>,
    pub enqueue_order: EnqueueOrder,
    pub sequence_num: u64,
    pub delayed_run_time: Option<Instant>,
}

/// A unit of work plus the metadata the scheduler orders it by.
pub(crate) struct Task {
    closure: Box<dyn FnOnce() + Send>,
    pub(crate) posted_from: &'static Location<'static>,
    pub(crate) delayed_run_time: Option<Instant>,
    pub(crate) enqueue_order: EnqueueOrder,
    pub(crate) sequence_num: u64,
    pub(crate) nestability: Nestability,
    cancel: Option<Arc<AtomicBool>>,
}

impl Task {
    pub(crate) fn new(
        closure: Box<dyn FnOnce() + Send>,
        posted_from: &'static Location<'static>,
        enqueue_order: EnqueueOrder,
        sequence_num: u64,
        nestability: Nestability,
    ) -> Self {
        Self {
            closure,
            posted_from,
            delayed_run_time: None,
            enqueue_order,
            sequence_num,
            nestability,
            cancel: None,
        }
    }

    pub(crate) fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |f| f.load(Ordering::Acquire))
    }

    pub(crate) fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            posted_from: self.posted_from,
            enqueue_order: self.enqueue_order,
            sequence_num: self.sequence_num,
            delayed_run_time: self.delayed_run_time,
        }
    }

    pub(crate) fn run(self) {
        (self.closure)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &self.posted_from)
            .field("enqueue_order", &self.enqueue_order)
            .field("sequence_num", &self.sequence_num)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("nestability", &self.nestability)
            .finish()
    }
}
