use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::host::HostRuntime;
use crate::manager::WakeRequester;
use crate::task::{
    EnqueueOrder, EnqueueOrderGenerator, Nestability, Task, TaskCanceller, TaskMetadata,
};
use crate::time_domain::TimeDomain;
use crate::work_queue::{WorkQueue, WorkQueueKind};

pub(crate) type QueueId = usize;

/// Fixed priority levels, strongest first. Control is reserved for the
/// scheduler's own plumbing and preempts everything, every time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub enum QueuePriority {
    Control,
    High,
    Normal,
    BestEffort,
}

impl QueuePriority {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        match self {
            QueuePriority::Control => 0,
            QueuePriority::High => 1,
            QueuePriority::Normal => 2,
            QueuePriority::BestEffort => 3,
        }
    }
}

/// Where a fence lands relative to already-posted tasks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FencePosition {
    /// Tasks already posted still run; everything posted later blocks.
    Now,
    /// Everything blocks, including tasks already queued.
    AllTasks,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct QueueFlags {
    pub(crate) priority: QueuePriority,
    pub(crate) should_monitor_quiescence: bool,
    pub(crate) should_report_blocked: bool,
}

impl Default for QueueFlags {
    fn default() -> Self {
        Self {
            priority: QueuePriority::Normal,
            should_monitor_quiescence: false,
            should_report_blocked: false,
        }
    }
}

/// What producers append under the any-thread lock. Delayed posts from
/// other threads cannot touch the main-thread heap, so they travel through
/// here as a deferred re-post carrying enough to re-base the run time into
/// the queue's domain when drained.
enum IncomingItem {
    Immediate(Task),
    Delayed {
        task: Task,
        posted_at: Instant,
        delay: Duration,
    },
}

/// Min-heap entry ordered by (run time, sequence number). Enqueue orders
/// do not exist yet at this stage; delayed tasks take theirs at activation.
struct DelayedEntry {
    run_time: Instant,
    task: Task,
}

impl DelayedEntry {
    fn key(&self) -> (Instant, u64) {
        (self.run_time, self.task.sequence_num)
    }
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    // reversed so BinaryHeap's max is the soonest entry
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

/// Producer-facing side, locked, touched from any thread.
pub(crate) struct AnyThread {
    incoming: VecDeque<IncomingItem>,
    /// Mirror of "enabled and unfenced" so producers can decide whether a
    /// post warrants a wake-up without taking the main-side lock.
    selectable_hint: bool,
    unregistered: bool,
}

impl AnyThread {
    fn front_immediate_order(&self) -> Option<EnqueueOrder> {
        self.incoming.iter().find_map(|item| match item {
            IncomingItem::Immediate(task) => Some(task.enqueue_order),
            IncomingItem::Delayed { .. } => None,
        })
    }
}

/// Consumer-thread side. Behind a mutex only so handles stay Send + Sync;
/// in steady state nothing but the consumer thread takes it.
pub(crate) struct MainSide {
    pub(crate) immediate_work: WorkQueue,
    pub(crate) delayed_work: WorkQueue,
    delayed_incoming: BinaryHeap<DelayedEntry>,
    time_domain: Arc<TimeDomain>,
    /// Run time this queue currently has registered with its domain.
    scheduled_wakeup: Option<Instant>,
    pub(crate) priority: QueuePriority,
    pub(crate) enabled: bool,
    pub(crate) unregistered: bool,
}

pub(crate) struct TaskQueueImpl {
    id: QueueId,
    name: String,
    main_thread: ThreadId,
    flags: QueueFlags,
    generator: EnqueueOrderGenerator,
    sequence: AtomicU64,
    wake: Arc<WakeRequester>,
    any_thread: Mutex<AnyThread>,
    pub(crate) main: Mutex<MainSide>,
}

/// Cloneable posting handle for one logical task queue. Post operations are
/// callable from any thread; everything else the queue can do is driven by
/// its manager on the consumer thread.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueImpl>,
}

impl TaskQueueImpl {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: QueueId,
        name: String,
        main_thread: ThreadId,
        generator: EnqueueOrderGenerator,
        wake: Arc<WakeRequester>,
        time_domain: Arc<TimeDomain>,
        flags: QueueFlags,
    ) -> TaskQueue {
        TaskQueue {
            inner: Arc::new(TaskQueueImpl {
                id,
                name,
                main_thread,
                flags,
                generator,
                sequence: AtomicU64::new(0),
                wake,
                any_thread: Mutex::new(AnyThread {
                    incoming: VecDeque::new(),
                    selectable_hint: true,
                    unregistered: false,
                }),
                main: Mutex::new(MainSide {
                    immediate_work: WorkQueue::new(),
                    delayed_work: WorkQueue::new(),
                    delayed_incoming: BinaryHeap::new(),
                    time_domain,
                    scheduled_wakeup: None,
                    priority: flags.priority,
                    enabled: true,
                    unregistered: false,
                }),
            }),
        }
    }
}

impl TaskQueue {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn id(&self) -> QueueId {
        self.inner.id
    }

    pub(crate) fn inner(&self) -> &TaskQueueImpl {
        &self.inner
    }

    pub(crate) fn should_monitor_quiescence(&self) -> bool {
        self.inner.flags.should_monitor_quiescence
    }

    pub(crate) fn should_report_blocked(&self) -> bool {
        self.inner.flags.should_report_blocked
    }

    pub(crate) fn ptr_eq(&self, other: &TaskQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Post a task to run as soon as the scheduler gets to it. Returns
    /// false, dropping the task, if the queue has been unregistered.
    #[track_caller]
    pub fn post_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(
            Box::new(f),
            Location::caller(),
            Duration::ZERO,
            Nestability::Nestable,
            None,
        )
    }

    /// Like `post_task`, but the task is deferred rather than run if the
    /// host loop is nested when its turn comes.
    #[track_caller]
    pub fn post_non_nestable_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(
            Box::new(f),
            Location::caller(),
            Duration::ZERO,
            Nestability::NonNestable,
            None,
        )
    }

    #[track_caller]
    pub fn post_delayed_task<F>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(
            Box::new(f),
            Location::caller(),
            delay,
            Nestability::Nestable,
            None,
        )
    }

    #[track_caller]
    pub fn post_non_nestable_delayed_task<F>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(
            Box::new(f),
            Location::caller(),
            delay,
            Nestability::NonNestable,
            None,
        )
    }

    /// Post a delayed task that can be cancelled up until it runs. A
    /// cancelled task is dropped without running and without provoking any
    /// wake-up of its own.
    #[track_caller]
    pub fn post_cancellable_delayed_task<F>(&self, delay: Duration, f: F) -> Option<TaskCanceller>
    where
        F: FnOnce() + Send + 'static,
    {
        let canceller = TaskCanceller::new();
        let posted = self.post(
            Box::new(f),
            Location::caller(),
            delay,
            Nestability::Nestable,
            Some(canceller.clone()),
        );
        posted.then_some(canceller)
    }

    fn post(
        &self,
        closure: Box<dyn FnOnce() + Send>,
        posted_from: &'static Location<'static>,
        delay: Duration,
        nestability: Nestability,
        cancel: Option<TaskCanceller>,
    ) -> bool {
        let inner = self.inner();
        let sequence_num = inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        // the enqueue order is assigned later: under the incoming lock for
        // immediate tasks, at activation for delayed ones
        let mut task = Task::new(
            closure,
            posted_from,
            EnqueueOrder::NONE,
            sequence_num,
            nestability,
        );
        if let Some(canceller) = &cancel {
            task.set_cancel_flag(canceller.flag());
        }
        if delay.is_zero() {
            self.post_immediate(task)
        } else {
            self.post_delayed(task, delay)
        }
    }

    fn post_immediate(&self, mut task: Task) -> bool {
        let inner = self.inner();
        let wake = {
            let mut any = inner.any_thread.lock();
            if any.unregistered {
                return false;
            }
            // assigned under the lock so racing producers cannot leave the
            // incoming side out of enqueue order
            task.enqueue_order = inner.generator.next();
            let was_empty = any.incoming.is_empty();
            any.incoming.push_back(IncomingItem::Immediate(task));
            was_empty && any.selectable_hint
        };
        if wake {
            inner.wake.schedule_immediate();
        }
        true
    }

    fn post_delayed(&self, mut task: Task, delay: Duration) -> bool {
        let inner = self.inner();
        if thread::current().id() == inner.main_thread {
            let mut main = inner.main.lock();
            if main.unregistered || inner.any_thread.lock().unregistered {
                return false;
            }
            let run_time = main.time_domain.now() + delay;
            task.delayed_run_time = Some(run_time);
            self.push_delayed_entry(&mut main, task, run_time);
            true
        } else {
            let posted_at = inner.wake.host_now();
            {
                let mut any = inner.any_thread.lock();
                if any.unregistered {
                    return false;
                }
                any.incoming.push_back(IncomingItem::Delayed {
                    task,
                    posted_at,
                    delay,
                });
            }
            // the heap push and domain arming must happen on the consumer
            // thread, so always ask for a pass
            inner.wake.schedule_immediate();
            true
        }
    }

    /// Heap insert plus domain re-arm when the soonest entry changed.
    /// Caller holds the main lock; the domain lock nests inside it.
    fn push_delayed_entry(&self, main: &mut MainSide, task: Task, run_time: Instant) {
        let is_new_soonest = main
            .scheduled_wakeup
            .map_or(true, |scheduled| run_time < scheduled);
        main.delayed_incoming.push(DelayedEntry { run_time, task });
        if is_new_soonest {
            let domain = main.time_domain.clone();
            domain.schedule_wakeup(self.id(), self, main.scheduled_wakeup, run_time);
            main.scheduled_wakeup = Some(run_time);
        }
    }

    /// Drain the incoming side into the work side. Immediate tasks land in
    /// the immediate work queue; cross-thread delayed posts get their run
    /// time re-based into this queue's domain and go to the heap.
    pub(crate) fn reload_incoming(&self, host: &dyn HostRuntime) {
        let inner = self.inner();
        let mut main = inner.main.lock();
        let drained: Vec<IncomingItem> = {
            let mut any = inner.any_thread.lock();
            any.incoming.drain(..).collect()
        };
        for item in drained {
            match item {
                IncomingItem::Immediate(task) => main.immediate_work.push(task),
                IncomingItem::Delayed {
                    mut task,
                    posted_at,
                    delay,
                } => {
                    let elapsed = host.now().saturating_duration_since(posted_at);
                    let remaining = delay.saturating_sub(elapsed);
                    let run_time = main.time_domain.now() + remaining;
                    task.delayed_run_time = Some(run_time);
                    self.push_delayed_entry(&mut main, task, run_time);
                }
            }
        }
    }

    /// Promote due delayed tasks into the delayed work queue and re-arm the
    /// domain for the oldest non-cancelled remainder. Called after this
    /// queue's wake-up fired, so the domain no longer holds an entry for it.
    pub(crate) fn move_ready_delayed_tasks(&self) {
        let inner = self.inner();
        let mut main = inner.main.lock();
        main.scheduled_wakeup = None;
        let domain = main.time_domain.clone();
        let mut lazy_now = domain.create_lazy_now();
        loop {
            while main
                .delayed_incoming
                .peek()
                .map_or(false, |e| e.task.is_cancelled())
            {
                main.delayed_incoming.pop();
            }
            let Some(front) = main.delayed_incoming.peek() else {
                break;
            };
            let run_time = front.run_time;
            if run_time <= lazy_now.now() {
                if let Some(entry) = main.delayed_incoming.pop() {
                    let mut task = entry.task;
                    // activation point: the order a fence is compared against
                    task.enqueue_order = inner.generator.next();
                    main.delayed_work.push(task);
                }
            } else {
                domain.schedule_wakeup(self.id(), self, None, run_time);
                main.scheduled_wakeup = Some(run_time);
                break;
            }
        }
    }

    pub(crate) fn pop_task(&self, kind: WorkQueueKind) -> Option<Task> {
        let mut main = self.inner().main.lock();
        match kind {
            WorkQueueKind::Immediate => main.immediate_work.pop(),
            WorkQueueKind::Delayed => main.delayed_work.pop(),
        }
    }

    /// True iff a fence is present and it currently hides every task the
    /// queue could offer, counting tasks still on the incoming side.
    pub fn blocked_by_fence(&self) -> bool {
        let inner = self.inner();
        let main = inner.main.lock();
        let fence = main.immediate_work.fence();
        if fence.is_none() {
            return false;
        }
        if main.immediate_work.eligible_front().is_some()
            || main.delayed_work.eligible_front().is_some()
        {
            return false;
        }
        let any = inner.any_thread.lock();
        match any.front_immediate_order() {
            Some(order) => order >= fence,
            None => true,
        }
    }

    pub fn has_pending_immediate_work(&self) -> bool {
        let inner = self.inner();
        let main = inner.main.lock();
        if !main.immediate_work.is_empty() {
            return true;
        }
        let any = inner.any_thread.lock();
        any.front_immediate_order().is_some()
    }

    pub fn is_unregistered(&self) -> bool {
        self.inner().any_thread.lock().unregistered
    }

    /// Tear the queue down. Pending tasks are dropped, not run; posting
    /// fails from this point on. Idempotent, callable from any thread,
    /// including from inside a task running on this very queue. Main-side
    /// detachment happens at the manager's next scheduling point.
    pub fn unregister(&self) {
        let inner = self.inner();
        {
            let mut any = inner.any_thread.lock();
            if any.unregistered {
                return;
            }
            any.unregistered = true;
            any.incoming.clear();
            any.selectable_hint = false;
        }
        debug!(queue = %inner.name, "task queue unregistered");
        inner.wake.push_pending_unregister(self.clone());
        inner.wake.schedule_immediate();
    }

    /// Main-side half of unregistration. Returns false if already done.
    pub(crate) fn teardown_main_side(&self) -> bool {
        let inner = self.inner();
        let mut main = inner.main.lock();
        if main.unregistered {
            return false;
        }
        main.unregistered = true;
        main.immediate_work.clear();
        main.delayed_work.clear();
        main.delayed_incoming.clear();
        if let Some(run_time) = main.scheduled_wakeup.take() {
            let domain = main.time_domain.clone();
            domain.cancel_wakeup(inner.id, run_time);
        }
        true
    }

    pub(crate) fn set_enabled_impl(&self, enabled: bool) {
        let inner = self.inner();
        let wake = {
            let mut main = inner.main.lock();
            main.enabled = enabled;
            let fence_free = main.immediate_work.fence().is_none();
            let has_work = main.immediate_work.eligible_front().is_some()
                || main.delayed_work.eligible_front().is_some();
            let mut any = inner.any_thread.lock();
            any.selectable_hint = enabled && fence_free && !main.unregistered;
            enabled && (has_work || any.front_immediate_order().is_some())
        };
        if wake {
            inner.wake.schedule_immediate();
        }
    }

    pub(crate) fn set_priority_impl(&self, priority: QueuePriority) {
        self.inner().main.lock().priority = priority;
    }

    /// Install or replace the fence. Replacing can unblock tasks that sat
    /// behind the old fence, which warrants a wake-up.
    pub(crate) fn insert_fence_impl(&self, position: FencePosition) {
        let inner = self.inner();
        let wake = {
            let mut main = inner.main.lock();
            let fence = match position {
                FencePosition::Now => inner.generator.next(),
                FencePosition::AllTasks => EnqueueOrder(1),
            };
            let previously_eligible = main.immediate_work.eligible_front().is_some()
                || main.delayed_work.eligible_front().is_some();
            main.immediate_work.set_fence(fence);
            main.delayed_work.set_fence(fence);
            let now_eligible = main.immediate_work.eligible_front().is_some()
                || main.delayed_work.eligible_front().is_some();
            let mut any = inner.any_thread.lock();
            // every future post lands at or past the fence
            any.selectable_hint = false;
            // an undrained post below the new fence needs a pass to surface
            let incoming_released = any
                .front_immediate_order()
                .map_or(false, |order| order < fence);
            main.enabled && ((now_eligible && !previously_eligible) || incoming_released)
        };
        if wake {
            inner.wake.schedule_immediate();
        }
    }

    pub(crate) fn remove_fence_impl(&self) {
        let inner = self.inner();
        let wake = {
            let mut main = inner.main.lock();
            main.immediate_work.set_fence(EnqueueOrder::NONE);
            main.delayed_work.set_fence(EnqueueOrder::NONE);
            let has_work = !main.immediate_work.is_empty() || !main.delayed_work.is_empty();
            let mut any = inner.any_thread.lock();
            any.selectable_hint = main.enabled && !main.unregistered;
            main.enabled && (has_work || !any.incoming.is_empty())
        };
        if wake {
            inner.wake.schedule_immediate();
        }
    }

    /// Rebind the queue to another time domain, moving its pending wake-up
    /// along with it.
    pub(crate) fn set_time_domain_impl(&self, domain: Arc<TimeDomain>) {
        let inner = self.inner();
        let mut main = inner.main.lock();
        if let Some(run_time) = main.scheduled_wakeup.take() {
            main.time_domain.cancel_wakeup(inner.id, run_time);
        }
        main.time_domain = domain.clone();
        let next = main
            .delayed_incoming
            .peek()
            .filter(|e| !e.task.is_cancelled())
            .map(|e| e.run_time);
        if let Some(run_time) = next {
            domain.schedule_wakeup(inner.id, self, None, run_time);
            main.scheduled_wakeup = Some(run_time);
        }
    }

    pub(crate) fn time_domain(&self) -> Arc<TimeDomain> {
        self.inner().main.lock().time_domain.clone()
    }

    /// Metadata of a ready task that selection is currently not allowed to
    /// run, because the queue is disabled or fenced.
    pub(crate) fn blocked_runnable_task(&self) -> Option<TaskMetadata> {
        let main = self.inner().main.lock();
        if main.unregistered {
            return None;
        }
        let disabled = !main.enabled;
        let blocked_front = |wq: &WorkQueue| {
            let front = wq.front()?;
            if disabled || wq.eligible_front().is_none() {
                Some(front.metadata())
            } else {
                None
            }
        };
        blocked_front(&main.immediate_work).or_else(|| blocked_front(&main.delayed_work))
    }

    pub(crate) fn snapshot_parts(&self) -> QueueSnapshotParts {
        let inner = self.inner();
        let main = inner.main.lock();
        let incoming_len = inner.any_thread.lock().incoming.len();
        QueueSnapshotParts {
            name: inner.name.clone(),
            priority: main.priority,
            enabled: main.enabled,
            fenced: !main.immediate_work.fence().is_none(),
            immediate_work_len: main.immediate_work.len(),
            delayed_work_len: main.delayed_work.len(),
            incoming_len,
            delayed_incoming_len: main.delayed_incoming.len(),
            next_delayed_run_time: main.scheduled_wakeup,
        }
    }
}

pub(crate) struct QueueSnapshotParts {
    pub(crate) name: String,
    pub(crate) priority: QueuePriority,
    pub(crate) enabled: bool,
    pub(crate) fenced: bool,
    pub(crate) immediate_work_len: usize,
    pub(crate) delayed_work_len: usize,
    pub(crate) incoming_len: usize,
    pub(crate) delayed_incoming_len: usize,
    pub(crate) next_delayed_run_time: Option<Instant>,
}
