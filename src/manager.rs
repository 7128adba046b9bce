use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use static_assertions::assert_not_impl_any;
use thiserror::Error;
use tracing::{debug, trace};

use crate::host::HostRuntime;
use crate::selector::{SelectorConfig, TaskQueueSelector};
use crate::task::{EnqueueOrderGenerator, Nestability, Task, TaskMetadata};
use crate::task_queue::{
    FencePosition, QueueFlags, QueuePriority, TaskQueue, TaskQueueImpl,
};
use crate::time_domain::TimeDomain;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task queue `{0}` is unregistered")]
    QueueUnregistered(String),
}

/// Cross-thread wake-up plumbing shared between the manager and every
/// queue it owns. "At most one pending immediate pass" lives here: the
/// first requester since the last pass actually posts to the host,
/// everyone else finds the flag already set.
pub(crate) struct WakeRequester {
    host: Arc<dyn HostRuntime>,
    immediate_pending: AtomicBool,
    alive: AtomicBool,
    pending_unregister: Mutex<Vec<TaskQueue>>,
}

impl WakeRequester {
    pub(crate) fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self {
            host,
            immediate_pending: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            pending_unregister: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn schedule_immediate(&self) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        if !self.immediate_pending.swap(true, Ordering::AcqRel) {
            self.host.schedule_work();
        }
    }

    pub(crate) fn host_now(&self) -> Instant {
        self.host.now()
    }

    pub(crate) fn push_pending_unregister(&self, queue: TaskQueue) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        self.pending_unregister.lock().push(queue);
    }

    fn take_pending_unregister(&self) -> Vec<TaskQueue> {
        std::mem::take(&mut *self.pending_unregister.lock())
    }

    fn begin_work_pass(&self) {
        self.immediate_pending.store(false, Ordering::Release);
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Requests scheduler shutdown from any thread, including from inside a
/// task the scheduler is currently running. The manager checks the flag
/// after every task and abandons the rest of the batch.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<WakeRequester>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        self.wake.schedule_immediate();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub type TaskObserverId = u64;

/// Pre/post hooks around every executed task.
pub trait TaskObserver {
    fn will_process_task(&self, queue: &TaskQueue, task: &TaskMetadata);
    fn did_process_task(&self, queue: &TaskQueue, task: &TaskMetadata);
}

/// Queue lifecycle callbacks.
pub trait SchedulerObserver {
    /// Fired exactly once when a queue is torn down.
    fn on_unregister_task_queue(&self, queue: &TaskQueue);
    /// A task was ready to run but its queue was disabled or fenced. Fired
    /// at most once per work pass, and only for queues that opted in.
    fn on_tried_to_execute_blocked_task(&self, queue: &TaskQueue, task: &TaskMetadata);
}

/// Builder for `TaskQueueManager::new_task_queue`.
pub struct QueueSpec {
    name: String,
    priority: QueuePriority,
    should_monitor_quiescence: bool,
    should_report_blocked: bool,
    time_domain: Option<Arc<TimeDomain>>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: QueuePriority::Normal,
            should_monitor_quiescence: false,
            should_report_blocked: false,
            time_domain: None,
        }
    }

    pub fn priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Tasks on this queue count against the system quiescence bit.
    pub fn monitor_quiescence(mut self) -> Self {
        self.should_monitor_quiescence = true;
        self
    }

    /// Report through the scheduler observer when this queue has a ready
    /// task that selection is not allowed to run.
    pub fn report_when_execution_blocked(mut self) -> Self {
        self.should_report_blocked = true;
        self
    }

    /// Bind the queue to a domain other than the manager's real-time one.
    pub fn time_domain(mut self, domain: Arc<TimeDomain>) -> Self {
        self.time_domain = Some(domain);
        self
    }
}

/// Read-only diagnostics snapshot; not part of the scheduling contract.
#[derive(Debug, Serialize)]
pub struct ManagerSnapshot {
    pub queues: Vec<QueueSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub priority: QueuePriority,
    pub enabled: bool,
    pub fenced: bool,
    pub immediate_work: usize,
    pub delayed_work: usize,
    pub incoming: usize,
    pub delayed_incoming: usize,
    pub next_delayed_task_in_ms: Option<u64>,
}

/// The top-level driver: owns every task queue and time domain, schedules
/// itself onto the host loop, and runs a bounded batch of tasks per
/// `do_work` invocation.
///
/// Lives on the consumer thread and is deliberately neither Send nor Sync;
/// cross-thread interaction goes through `TaskQueue` and `ShutdownHandle`.
pub struct TaskQueueManager {
    host: Arc<dyn HostRuntime>,
    wake: Arc<WakeRequester>,
    generator: EnqueueOrderGenerator,
    selector_config: SelectorConfig,
    registry: RefCell<Slab<TaskQueue>>,
    /// Unregistered queues parked here so handles stay valid until the end
    /// of the pass that removed them.
    queues_to_delete: RefCell<Vec<TaskQueue>>,
    selector: RefCell<TaskQueueSelector>,
    real_time_domain: Arc<TimeDomain>,
    extra_time_domains: RefCell<Vec<Arc<TimeDomain>>>,
    deferred_non_nestable: RefCell<VecDeque<(TaskQueue, Task)>>,
    task_observers: RefCell<AHashMap<TaskObserverId, Rc<dyn TaskObserver>>>,
    next_task_observer_id: Cell<TaskObserverId>,
    observer: RefCell<Option<Rc<dyn SchedulerObserver>>>,
    currently_executing: RefCell<Option<TaskQueue>>,
    work_batch_size: Cell<usize>,
    task_ran_on_monitored_queue: Cell<bool>,
    shutdown: Arc<AtomicBool>,
    main_thread: ThreadId,
    _not_send: PhantomData<Rc<()>>,
}
assert_not_impl_any!(TaskQueueManager: Send, Sync);

impl TaskQueueManager {
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self::with_selector_config(host, SelectorConfig::default())
    }

    pub fn with_selector_config(host: Arc<dyn HostRuntime>, config: SelectorConfig) -> Self {
        let wake = Arc::new(WakeRequester::new(host.clone()));
        let real_time_domain = TimeDomain::new_real(host.clone());
        Self {
            host,
            wake,
            generator: EnqueueOrderGenerator::new(),
            selector_config: config,
            registry: RefCell::new(Slab::new()),
            queues_to_delete: RefCell::new(Vec::new()),
            selector: RefCell::new(TaskQueueSelector::new(config)),
            real_time_domain,
            extra_time_domains: RefCell::new(Vec::new()),
            deferred_non_nestable: RefCell::new(VecDeque::new()),
            task_observers: RefCell::new(AHashMap::new()),
            next_task_observer_id: Cell::new(0),
            observer: RefCell::new(None),
            currently_executing: RefCell::new(None),
            work_batch_size: Cell::new(1),
            task_ran_on_monitored_queue: Cell::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            main_thread: thread::current().id(),
            _not_send: PhantomData,
        }
    }

    pub fn new_task_queue(&self, spec: QueueSpec) -> TaskQueue {
        let flags = QueueFlags {
            priority: spec.priority,
            should_monitor_quiescence: spec.should_monitor_quiescence,
            should_report_blocked: spec.should_report_blocked,
        };
        let domain = spec
            .time_domain
            .unwrap_or_else(|| self.real_time_domain.clone());
        let mut registry = self.registry.borrow_mut();
        let entry = registry.vacant_entry();
        let queue = TaskQueueImpl::new(
            entry.key(),
            spec.name,
            self.main_thread,
            self.generator.clone(),
            self.wake.clone(),
            domain,
            flags,
        );
        entry.insert(queue.clone());
        debug!(queue = queue.name(), "created task queue");
        queue
    }

    pub fn real_time_domain(&self) -> &Arc<TimeDomain> {
        &self.real_time_domain
    }

    pub fn register_time_domain(&self, domain: Arc<TimeDomain>) {
        self.extra_time_domains.borrow_mut().push(domain);
    }

    pub fn unregister_time_domain(&self, domain: &Arc<TimeDomain>) {
        self.extra_time_domains
            .borrow_mut()
            .retain(|d| !Arc::ptr_eq(d, domain));
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            wake: self.wake.clone(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Batch limit per `do_work` pass. Forced back to one while the host
    /// loop is nested.
    pub fn set_work_batch_size(&self, size: usize) {
        self.work_batch_size.set(size.max(1));
    }

    /// True iff no task from a quiescence-monitored queue ran since the
    /// last call. Clears the bit.
    pub fn get_and_clear_system_is_quiescent_bit(&self) -> bool {
        !self.task_ran_on_monitored_queue.replace(false)
    }

    pub fn currently_executing_task_queue(&self) -> Option<TaskQueue> {
        self.currently_executing.borrow().clone()
    }

    pub fn set_observer(&self, observer: Option<Rc<dyn SchedulerObserver>>) {
        *self.observer.borrow_mut() = observer;
    }

    pub fn add_task_observer(&self, observer: Rc<dyn TaskObserver>) -> TaskObserverId {
        let id = self.next_task_observer_id.get();
        self.next_task_observer_id.set(id + 1);
        self.task_observers.borrow_mut().insert(id, observer);
        id
    }

    pub fn remove_task_observer(&self, id: TaskObserverId) {
        self.task_observers.borrow_mut().remove(&id);
    }

    pub fn set_queue_enabled(&self, queue: &TaskQueue, enabled: bool) -> Result<(), SchedulerError> {
        self.check_registered(queue)?;
        queue.set_enabled_impl(enabled);
        self.selector.borrow_mut().refresh_queue(queue);
        Ok(())
    }

    pub fn set_queue_priority(
        &self,
        queue: &TaskQueue,
        priority: QueuePriority,
    ) -> Result<(), SchedulerError> {
        self.check_registered(queue)?;
        queue.set_priority_impl(priority);
        self.selector.borrow_mut().refresh_queue(queue);
        Ok(())
    }

    pub fn insert_fence(
        &self,
        queue: &TaskQueue,
        position: FencePosition,
    ) -> Result<(), SchedulerError> {
        self.check_registered(queue)?;
        queue.insert_fence_impl(position);
        self.selector.borrow_mut().refresh_queue(queue);
        Ok(())
    }

    pub fn remove_fence(&self, queue: &TaskQueue) -> Result<(), SchedulerError> {
        self.check_registered(queue)?;
        queue.remove_fence_impl();
        self.selector.borrow_mut().refresh_queue(queue);
        Ok(())
    }

    pub fn set_queue_time_domain(
        &self,
        queue: &TaskQueue,
        domain: Arc<TimeDomain>,
    ) -> Result<(), SchedulerError> {
        self.check_registered(queue)?;
        queue.set_time_domain_impl(domain);
        Ok(())
    }

    /// Synchronous teardown of one queue: pending tasks are dropped, the
    /// lifecycle observer fires, and further operations on the handle fail.
    pub fn unregister_task_queue(&self, queue: &TaskQueue) -> Result<(), SchedulerError> {
        self.check_registered(queue)?;
        queue.unregister();
        self.process_pending_unregistrations();
        Ok(())
    }

    fn check_registered(&self, queue: &TaskQueue) -> Result<(), SchedulerError> {
        if queue.is_unregistered() {
            return Err(SchedulerError::QueueUnregistered(queue.name().to_string()));
        }
        Ok(())
    }

    /// One scheduling pass. Invoked by the host in response to
    /// `schedule_work`/`schedule_delayed_work` requests.
    pub fn do_work(&self) {
        debug_assert_eq!(thread::current().id(), self.main_thread);
        self.wake.begin_work_pass();
        if self.is_shutdown() {
            self.teardown();
            return;
        }
        trace!("work pass");
        self.process_pending_unregistrations();
        self.update_queues();

        let nested = self.host.is_nested();
        let batch = if nested { 1 } else { self.work_batch_size.get() };
        for _ in 0..batch {
            let next = self
                .take_deferred(nested)
                .or_else(|| self.select_and_pop());
            let Some((queue, task)) = next else {
                break;
            };
            if task.is_cancelled() {
                continue;
            }
            if task.nestability == Nestability::NonNestable && nested {
                // run it on a later, non-nested pass, in post order
                self.deferred_non_nestable.borrow_mut().push_back((queue, task));
                self.wake.schedule_immediate();
                continue;
            }
            self.run_task(&queue, task);
            if self.is_shutdown() {
                self.teardown();
                return;
            }
            self.process_pending_unregistrations();
            // a task may have entered a nested loop mid-batch
            if nested || self.host.is_nested() {
                break;
            }
        }

        self.queues_to_delete.borrow_mut().clear();

        let more = self.selector.borrow().has_queued_work()
            || !self.deferred_non_nestable.borrow().is_empty()
            || self.any_domain_advanced();
        if more {
            self.wake.schedule_immediate();
        }
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let queues = self
            .registry
            .borrow()
            .iter()
            .map(|(_, queue)| {
                let parts = queue.snapshot_parts();
                let next_delayed_task_in_ms = parts.next_delayed_run_time.map(|t| {
                    t.saturating_duration_since(queue.time_domain().now())
                        .as_millis() as u64
                });
                QueueSnapshot {
                    name: parts.name,
                    priority: parts.priority,
                    enabled: parts.enabled,
                    fenced: parts.fenced,
                    immediate_work: parts.immediate_work_len,
                    delayed_work: parts.delayed_work_len,
                    incoming: parts.incoming_len,
                    delayed_incoming: parts.delayed_incoming_len,
                    next_delayed_task_in_ms,
                }
            })
            .collect();
        ManagerSnapshot { queues }
    }

    pub fn snapshot_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_default()
    }

    fn all_domains(&self) -> Vec<Arc<TimeDomain>> {
        let mut domains = vec![self.real_time_domain.clone()];
        domains.extend(self.extra_time_domains.borrow().iter().cloned());
        domains
    }

    /// Drain producer sides, promote due delayed tasks, re-sync the
    /// selector, and spot blocked-but-runnable work.
    fn update_queues(&self) {
        let queues: Vec<TaskQueue> = self
            .registry
            .borrow()
            .iter()
            .map(|(_, q)| q.clone())
            .collect();
        for queue in &queues {
            queue.reload_incoming(&*self.host);
        }
        for domain in self.all_domains() {
            for queue in domain.take_ready_queues() {
                queue.move_ready_delayed_tasks();
            }
        }
        let mut blocked: Option<(TaskQueue, TaskMetadata)> = None;
        {
            let mut selector = self.selector.borrow_mut();
            for queue in &queues {
                selector.refresh_queue(queue);
                if blocked.is_none() && queue.should_report_blocked() {
                    if let Some(meta) = queue.blocked_runnable_task() {
                        blocked = Some((queue.clone(), meta));
                    }
                }
            }
        }
        if let Some((queue, meta)) = blocked {
            let observer = self.observer.borrow().clone();
            if let Some(observer) = observer {
                observer.on_tried_to_execute_blocked_task(&queue, &meta);
            }
        }
    }

    fn take_deferred(&self, nested: bool) -> Option<(TaskQueue, Task)> {
        if nested {
            return None;
        }
        self.deferred_non_nestable.borrow_mut().pop_front()
    }

    fn select_and_pop(&self) -> Option<(TaskQueue, Task)> {
        let picked = self.selector.borrow_mut().select_work_queue();
        let (queue, kind) = picked?;
        let task = queue.pop_task(kind);
        self.selector.borrow_mut().refresh_queue(&queue);
        task.map(|task| (queue, task))
    }

    fn run_task(&self, queue: &TaskQueue, task: Task) {
        let meta = task.metadata();
        trace!(queue = queue.name(), posted_from = %meta.posted_from, "running task");
        if queue.should_monitor_quiescence() {
            self.task_ran_on_monitored_queue.set(true);
        }
        *self.currently_executing.borrow_mut() = Some(queue.clone());
        let observers: Vec<Rc<dyn TaskObserver>> =
            self.task_observers.borrow().values().cloned().collect();
        for observer in &observers {
            observer.will_process_task(queue, &meta);
        }
        task.run();
        for observer in &observers {
            observer.did_process_task(queue, &meta);
        }
        *self.currently_executing.borrow_mut() = None;
    }

    fn process_pending_unregistrations(&self) {
        for queue in self.wake.take_pending_unregister() {
            if !queue.teardown_main_side() {
                continue;
            }
            self.selector.borrow_mut().refresh_queue(&queue);
            self.deferred_non_nestable
                .borrow_mut()
                .retain(|(q, _)| !q.ptr_eq(&queue));
            let removed = {
                let mut registry = self.registry.borrow_mut();
                let matches = registry
                    .get(queue.id())
                    .map_or(false, |q| q.ptr_eq(&queue));
                matches.then(|| registry.remove(queue.id()))
            };
            let observer = self.observer.borrow().clone();
            if let Some(observer) = observer {
                observer.on_unregister_task_queue(&queue);
            }
            if let Some(queue) = removed {
                // keep the handle alive until the end of this pass
                self.queues_to_delete.borrow_mut().push(queue);
            }
        }
    }

    /// Fast-forward any auto-advancing virtual domain; only consulted once
    /// the pass is otherwise out of work.
    fn any_domain_advanced(&self) -> bool {
        self.all_domains().iter().any(|d| d.maybe_advance_time())
    }

    fn teardown(&self) {
        debug!("scheduler teardown");
        self.shutdown.store(true, Ordering::Release);
        self.wake.kill();
        let queues: Vec<TaskQueue> = {
            let mut registry = self.registry.borrow_mut();
            let queues = registry.iter().map(|(_, q)| q.clone()).collect();
            registry.clear();
            queues
        };
        for queue in &queues {
            queue.unregister();
            queue.teardown_main_side();
            let observer = self.observer.borrow().clone();
            if let Some(observer) = observer {
                observer.on_unregister_task_queue(queue);
            }
        }
        for domain in self.all_domains() {
            domain.clear();
        }
        self.wake.take_pending_unregister();
        self.deferred_non_nestable.borrow_mut().clear();
        self.queues_to_delete.borrow_mut().clear();
        *self.selector.borrow_mut() = TaskQueueSelector::new(self.selector_config);
        *self.currently_executing.borrow_mut() = None;
    }
}

impl Drop for TaskQueueManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::test_util::TestHost;
    use crate::task_queue::FencePosition;
    use std::time::Duration;

    struct Fixture {
        host: Arc<TestHost>,
        manager: TaskQueueManager,
    }

    impl Fixture {
        fn new() -> Self {
            let host = Arc::new(TestHost::new());
            let manager = TaskQueueManager::new(host.clone());
            Fixture { host, manager }
        }

        fn queue(&self, name: &str) -> TaskQueue {
            self.manager.new_task_queue(QueueSpec::new(name))
        }

        /// Run only the immediate passes that are pending right now.
        fn run_pending_tasks(&self) {
            let n = self.host.take_pending_immediate();
            for _ in 0..n {
                self.manager.do_work();
            }
        }

        /// Run immediate passes, sleeping to the next delayed wake-up when
        /// there are none, until fully idle.
        fn run_until_idle(&self) {
            loop {
                let n = self.host.take_pending_immediate();
                if n > 0 {
                    for _ in 0..n {
                        self.manager.do_work();
                    }
                    continue;
                }
                if self.host.pop_earliest_delayed().is_some() {
                    self.manager.do_work();
                    continue;
                }
                break;
            }
        }
    }

    type RunLog = Arc<Mutex<Vec<u64>>>;

    fn run_log() -> RunLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn log_task(log: &RunLog, value: u64) -> impl FnOnce() + Send + 'static {
        let log = log.clone();
        move || log.lock().push(value)
    }

    #[test]
    fn single_queue_runs_fifo() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        for i in 1..=3 {
            assert!(queue.post_task(log_task(&log, i)));
        }
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn equal_priority_queues_interleave_by_post_order() {
        let fx = Fixture::new();
        let queues = [fx.queue("a"), fx.queue("b"), fx.queue("c")];
        let log = run_log();
        for i in 0..9u64 {
            assert!(queues[(i % 3) as usize].post_task(log_task(&log, i)));
        }
        fx.run_until_idle();
        assert_eq!(*log.lock(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn control_queue_preempts_on_the_next_selection() {
        let fx = Fixture::new();
        let best_effort = fx
            .manager
            .new_task_queue(QueueSpec::new("bg").priority(QueuePriority::BestEffort));
        let control = fx
            .manager
            .new_task_queue(QueueSpec::new("control").priority(QueuePriority::Control));
        let log = run_log();
        for i in 0..20 {
            assert!(best_effort.post_task(log_task(&log, i)));
        }
        assert!(control.post_task(log_task(&log, 100)));
        fx.run_until_idle();
        assert_eq!(log.lock()[0], 100);
        assert_eq!(log.lock().len(), 21);
    }

    #[test]
    fn work_batching_runs_batch_size_tasks_per_pass() {
        let fx = Fixture::new();
        fx.manager.set_work_batch_size(2);
        let queue = fx.queue("test");
        let log = run_log();
        for i in 0..4 {
            assert!(queue.post_task(log_task(&log, i)));
        }
        fx.run_pending_tasks();
        assert_eq!(log.lock().len(), 2);
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn a_self_reposting_task_keeps_one_pending_pass() {
        let fx = Fixture::new();
        let queue = fx.queue("test");

        fn repost(queue: TaskQueue, countdown: u32) {
            if countdown == 0 {
                return;
            }
            let q = queue.clone();
            queue.post_task(move || repost(q, countdown - 1));
        }

        repost(queue, 5);
        for _ in 0..5 {
            assert_eq!(fx.host.pending_immediate_count(), 1);
            fx.run_pending_tasks();
        }
        assert_eq!(fx.host.pending_immediate_count(), 0);
    }

    #[test]
    fn delayed_tasks_run_in_run_time_order() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_millis(30), log_task(&log, 30)));
        assert!(queue.post_delayed_task(Duration::from_millis(20), log_task(&log, 20)));
        assert!(queue.post_delayed_task(Duration::from_millis(10), log_task(&log, 10)));

        fx.run_pending_tasks();
        assert!(log.lock().is_empty());

        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![10, 20, 30]);
    }

    #[test]
    fn cancelled_delayed_tasks_produce_no_extra_wakeups() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let start = fx.host.now();
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_secs(10), log_task(&log, 10)));
        let cancel = queue
            .post_cancellable_delayed_task(Duration::from_secs(20), log_task(&log, 20))
            .unwrap();
        assert!(queue.post_delayed_task(Duration::from_secs(30), log_task(&log, 30)));
        cancel.cancel();

        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![10, 30]);
        // the 20s slot is never armed
        assert_eq!(
            fx.host.delayed_wakeup_log(),
            vec![start + Duration::from_secs(10), start + Duration::from_secs(30)]
        );
    }

    #[test]
    fn deny_running_until_enabled() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        fx.manager.set_queue_enabled(&queue, false).unwrap();
        assert!(queue.post_task(log_task(&log, 1)));
        fx.run_until_idle();
        assert!(log.lock().is_empty());

        fx.manager.set_queue_enabled(&queue, true).unwrap();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn insert_and_remove_fence() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        assert!(queue.post_task(log_task(&log, 1)));
        fx.run_until_idle();

        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        assert!(queue.post_task(log_task(&log, 2)));
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);

        fx.manager.remove_fence(&queue).unwrap();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn replacing_a_fence_releases_tasks_behind_the_old_one() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        assert!(queue.post_task(log_task(&log, 1)));
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        assert!(queue.post_task(log_task(&log, 2)));
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn fence_insert_then_remove_is_an_execution_noop() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        fx.manager.remove_fence(&queue).unwrap();
        assert!(queue.post_task(log_task(&log, 1)));
        assert!(queue.post_task(log_task(&log, 2)));
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn fence_prevents_delayed_tasks_from_running() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_millis(10), log_task(&log, 1)));
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        // the task becomes ready behind the fence and stays there
        fx.run_until_idle();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn removing_a_fence_releases_a_due_delayed_task() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        assert!(queue.post_delayed_task(Duration::from_millis(10), log_task(&log, 1)));
        fx.run_until_idle();
        assert!(log.lock().is_empty());

        fx.manager.remove_fence(&queue).unwrap();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn removing_a_fence_releases_multiple_due_delayed_tasks() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        assert!(queue.post_delayed_task(Duration::from_millis(1), log_task(&log, 1)));
        assert!(queue.post_delayed_task(Duration::from_millis(10), log_task(&log, 10)));
        assert!(queue.post_delayed_task(Duration::from_millis(20), log_task(&log, 20)));

        fx.host.advance_clock(Duration::from_millis(15));
        fx.manager.do_work();
        assert!(log.lock().is_empty());

        // only the two tasks that were already due come out; with a work
        // batch size of 1 each pass schedules a continuation, so drain them
        fx.manager.remove_fence(&queue).unwrap();
        while fx.host.pending_immediate_count() > 0 {
            fx.run_pending_tasks();
        }
        assert_eq!(*log.lock(), vec![1, 10]);

        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1, 10, 20]);
    }

    #[test]
    fn fence_gates_delayed_tasks_by_activation_not_post_order() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_millis(30), log_task(&log, 30)));
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();
        assert!(queue.post_delayed_task(Duration::from_millis(10), log_task(&log, 10)));

        // both become ready after the fence went in, so both are held
        fx.run_until_idle();
        assert!(log.lock().is_empty());

        fx.manager.remove_fence(&queue).unwrap();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![10, 30]);
    }

    #[test]
    fn non_nestable_tasks_are_deferred_out_of_nested_passes() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        assert!(queue.post_task(log_task(&log, 1)));
        assert!(queue.post_task(log_task(&log, 2)));
        assert!(queue.post_non_nestable_task(log_task(&log, 3)));
        assert!(queue.post_task(log_task(&log, 4)));
        assert!(queue.post_task(log_task(&log, 5)));

        fx.host.set_nested(true);
        // nested passes run one task each; the non-nestable task defers
        for _ in 0..6 {
            fx.run_pending_tasks();
        }
        assert_eq!(*log.lock(), vec![1, 2, 4, 5]);

        fx.host.set_nested(false);
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1, 2, 4, 5, 3]);
    }

    #[test]
    fn unregister_drops_pending_work() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        assert!(queue.post_task(log_task(&log, 1)));
        assert!(queue.post_delayed_task(Duration::from_millis(5), log_task(&log, 2)));
        fx.manager.unregister_task_queue(&queue).unwrap();
        fx.run_until_idle();
        assert!(log.lock().is_empty());
        assert!(matches!(
            fx.manager.unregister_task_queue(&queue),
            Err(SchedulerError::QueueUnregistered(_))
        ));
    }

    #[test]
    fn unregister_from_inside_a_task_drops_the_other_queues_work() {
        let fx = Fixture::new();
        let queue_a = fx.queue("a");
        let queue_b = fx.queue("b");
        let log = run_log();
        let victim = queue_b.clone();
        assert!(queue_a.post_task(move || victim.unregister()));
        assert!(queue_b.post_task(log_task(&log, 1)));
        fx.run_until_idle();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn unregistering_a_queue_from_its_own_task_is_safe() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        let me = queue.clone();
        let log2 = log.clone();
        assert!(queue.post_task(move || {
            log2.lock().push(1);
            me.unregister();
        }));
        assert!(queue.post_task(log_task(&log, 2)));
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    struct RecordingObserver {
        unregistered: Cell<u32>,
        blocked: Cell<u32>,
    }

    impl RecordingObserver {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                unregistered: Cell::new(0),
                blocked: Cell::new(0),
            })
        }
    }

    impl SchedulerObserver for RecordingObserver {
        fn on_unregister_task_queue(&self, _queue: &TaskQueue) {
            self.unregistered.set(self.unregistered.get() + 1);
        }
        fn on_tried_to_execute_blocked_task(&self, _queue: &TaskQueue, _task: &TaskMetadata) {
            self.blocked.set(self.blocked.get() + 1);
        }
    }

    #[test]
    fn unregister_observer_fires_once() {
        let fx = Fixture::new();
        let observer = RecordingObserver::new();
        fx.manager.set_observer(Some(observer.clone()));
        let queue = fx.queue("test");
        fx.manager.unregister_task_queue(&queue).unwrap();
        fx.run_until_idle();
        assert_eq!(observer.unregistered.get(), 1);
        fx.manager.set_observer(None);
    }

    #[test]
    fn blocked_task_is_reported_once_per_pass() {
        let fx = Fixture::new();
        let observer = RecordingObserver::new();
        fx.manager.set_observer(Some(observer.clone()));
        let queue = fx
            .manager
            .new_task_queue(QueueSpec::new("test").report_when_execution_blocked());
        fx.manager.set_queue_enabled(&queue, false).unwrap();
        assert!(queue.post_task(|| {}));
        // posting to a disabled queue does not wake the scheduler; toggling
        // the queue does
        fx.manager.set_queue_enabled(&queue, true).unwrap();
        fx.manager.set_queue_enabled(&queue, false).unwrap();

        fx.run_pending_tasks();
        assert_eq!(observer.blocked.get(), 1);
        fx.manager.set_observer(None);
    }

    #[test]
    fn runnable_tasks_are_not_reported_as_blocked() {
        let fx = Fixture::new();
        let observer = RecordingObserver::new();
        fx.manager.set_observer(Some(observer.clone()));
        let queue = fx
            .manager
            .new_task_queue(QueueSpec::new("test").report_when_execution_blocked());
        assert!(queue.post_task(|| {}));
        fx.run_until_idle();
        assert_eq!(observer.blocked.get(), 0);
        fx.manager.set_observer(None);
    }

    struct CountingTaskObserver {
        will: Cell<u32>,
        did: Cell<u32>,
    }

    impl TaskObserver for CountingTaskObserver {
        fn will_process_task(&self, _queue: &TaskQueue, _task: &TaskMetadata) {
            self.will.set(self.will.get() + 1);
        }
        fn did_process_task(&self, _queue: &TaskQueue, _task: &TaskMetadata) {
            self.did.set(self.did.get() + 1);
        }
    }

    #[test]
    fn task_observers_wrap_every_task() {
        let fx = Fixture::new();
        let observer = Rc::new(CountingTaskObserver {
            will: Cell::new(0),
            did: Cell::new(0),
        });
        let id = fx.manager.add_task_observer(observer.clone());
        let queue = fx.queue("test");
        assert!(queue.post_task(|| {}));
        assert!(queue.post_task(|| {}));
        fx.run_until_idle();
        assert_eq!(observer.will.get(), 2);
        assert_eq!(observer.did.get(), 2);

        fx.manager.remove_task_observer(id);
        assert!(queue.post_task(|| {}));
        fx.run_until_idle();
        assert_eq!(observer.will.get(), 2);
    }

    #[test]
    fn quiescence_bit_tracks_monitored_queues() {
        let fx = Fixture::new();
        let monitored = fx
            .manager
            .new_task_queue(QueueSpec::new("monitored").monitor_quiescence());
        let plain = fx.queue("plain");

        assert!(fx.manager.get_and_clear_system_is_quiescent_bit());

        assert!(plain.post_task(|| {}));
        fx.run_until_idle();
        assert!(fx.manager.get_and_clear_system_is_quiescent_bit());

        assert!(monitored.post_task(|| {}));
        fx.run_until_idle();
        assert!(!fx.manager.get_and_clear_system_is_quiescent_bit());
        assert!(fx.manager.get_and_clear_system_is_quiescent_bit());
    }

    #[test]
    fn shutdown_from_inside_a_task_abandons_the_batch() {
        let fx = Fixture::new();
        fx.manager.set_work_batch_size(4);
        let queue = fx.queue("test");
        let log = run_log();
        let handle = fx.manager.shutdown_handle();
        let log2 = log.clone();
        assert!(queue.post_task(move || {
            log2.lock().push(1);
            handle.shutdown();
        }));
        assert!(queue.post_task(log_task(&log, 2)));
        assert!(queue.post_task(log_task(&log, 3)));
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
        assert!(fx.manager.is_shutdown());
        assert!(!queue.post_task(|| {}));
    }

    #[test]
    fn posting_after_the_manager_is_dropped_fails() {
        let host = Arc::new(TestHost::new());
        let manager = TaskQueueManager::new(host.clone());
        let queue = manager.new_task_queue(QueueSpec::new("test"));
        drop(manager);
        assert!(!queue.post_task(|| {}));
        assert!(queue.is_unregistered());
    }

    #[test]
    fn cross_thread_posts_run_in_post_order() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        let log = run_log();
        let producer = {
            let queue = queue.clone();
            let log = log.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    let log = log.clone();
                    assert!(queue.post_task(move || log.lock().push(i)));
                }
            })
        };
        producer.join().unwrap();
        fx.run_until_idle();
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn virtual_time_domain_orders_by_run_time() {
        let fx = Fixture::new();
        let domain = TimeDomain::new_virtual(fx.host.now());
        fx.manager.register_time_domain(domain.clone());
        let queue = fx
            .manager
            .new_task_queue(QueueSpec::new("virtual").time_domain(domain.clone()));
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_millis(30), log_task(&log, 30)));
        assert!(queue.post_delayed_task(Duration::from_millis(20), log_task(&log, 20)));
        assert!(queue.post_delayed_task(Duration::from_millis(10), log_task(&log, 10)));

        domain.advance_to(fx.host.now() + Duration::from_millis(30));
        fx.manager.do_work();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![10, 20, 30]);
    }

    #[test]
    fn time_domains_are_independent() {
        let fx = Fixture::new();
        let start = fx.host.now();
        let domain_a = TimeDomain::new_virtual(start);
        let domain_b = TimeDomain::new_virtual(start);
        fx.manager.register_time_domain(domain_a.clone());
        fx.manager.register_time_domain(domain_b.clone());
        let queue_a = fx
            .manager
            .new_task_queue(QueueSpec::new("a").time_domain(domain_a.clone()));
        let queue_b = fx
            .manager
            .new_task_queue(QueueSpec::new("b").time_domain(domain_b));
        let log = run_log();
        assert!(queue_a.post_delayed_task(Duration::from_secs(1), log_task(&log, 1)));
        assert!(queue_b.post_delayed_task(Duration::from_secs(1), log_task(&log, 2)));

        domain_a.advance_to(start + Duration::from_secs(5));
        fx.manager.do_work();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn queues_can_migrate_between_time_domains() {
        let fx = Fixture::new();
        let start = fx.host.now();
        let domain_a = TimeDomain::new_virtual(start);
        let domain_b = TimeDomain::new_virtual(start);
        fx.manager.register_time_domain(domain_a.clone());
        fx.manager.register_time_domain(domain_b.clone());
        let queue = fx
            .manager
            .new_task_queue(QueueSpec::new("q").time_domain(domain_a.clone()));
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_secs(1), log_task(&log, 1)));

        fx.manager.set_queue_time_domain(&queue, domain_b.clone()).unwrap();
        domain_a.advance_to(start + Duration::from_secs(5));
        fx.manager.do_work();
        assert!(log.lock().is_empty());

        domain_b.advance_to(start + Duration::from_secs(5));
        fx.manager.do_work();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn auto_advancing_domain_fast_forwards_when_idle() {
        let fx = Fixture::new();
        let domain = TimeDomain::new_auto_advancing(fx.host.now());
        fx.manager.register_time_domain(domain.clone());
        let queue = fx
            .manager
            .new_task_queue(QueueSpec::new("auto").time_domain(domain));
        let log = run_log();
        assert!(queue.post_delayed_task(Duration::from_secs(60), log_task(&log, 1)));

        // no clock manipulation: the idle pass advances virtual time itself
        fx.manager.do_work();
        fx.run_until_idle();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn currently_executing_queue_is_visible_to_task_observers() {
        struct QueueNameObserver {
            names: RefCell<Vec<String>>,
        }
        impl TaskObserver for QueueNameObserver {
            fn will_process_task(&self, queue: &TaskQueue, _task: &TaskMetadata) {
                self.names.borrow_mut().push(queue.name().to_string());
            }
            fn did_process_task(&self, _queue: &TaskQueue, _task: &TaskMetadata) {}
        }

        let fx = Fixture::new();
        let observer = Rc::new(QueueNameObserver {
            names: RefCell::new(Vec::new()),
        });
        fx.manager.add_task_observer(observer.clone());
        let queue = fx.queue("observed");
        assert!(fx.manager.currently_executing_task_queue().is_none());
        assert!(queue.post_task(|| {}));
        fx.run_until_idle();
        assert_eq!(*observer.names.borrow(), vec!["observed".to_string()]);
        assert!(fx.manager.currently_executing_task_queue().is_none());
    }

    #[test]
    fn sequence_numbers_are_assigned_at_post_time() {
        struct SeqObserver {
            seqs: RefCell<Vec<u64>>,
        }
        impl TaskObserver for SeqObserver {
            fn will_process_task(&self, _queue: &TaskQueue, task: &TaskMetadata) {
                self.seqs.borrow_mut().push(task.sequence_num);
            }
            fn did_process_task(&self, _queue: &TaskQueue, _task: &TaskMetadata) {}
        }

        let fx = Fixture::new();
        let observer = Rc::new(SeqObserver {
            seqs: RefCell::new(Vec::new()),
        });
        fx.manager.add_task_observer(observer.clone());
        let queue = fx.queue("test");
        assert!(queue.post_task(|| {}));
        assert!(queue.post_task(|| {}));
        fx.run_until_idle();
        assert_eq!(*observer.seqs.borrow(), vec![1, 2]);
    }

    #[test]
    fn control_ops_on_an_unregistered_queue_fail() {
        let fx = Fixture::new();
        let queue = fx.queue("test");
        fx.manager.unregister_task_queue(&queue).unwrap();
        assert!(fx.manager.set_queue_enabled(&queue, false).is_err());
        assert!(fx
            .manager
            .set_queue_priority(&queue, QueuePriority::High)
            .is_err());
        assert!(fx.manager.insert_fence(&queue, FencePosition::Now).is_err());
        assert!(fx.manager.remove_fence(&queue).is_err());
    }

    #[test]
    fn snapshot_reflects_queue_state() {
        let fx = Fixture::new();
        let queue = fx
            .manager
            .new_task_queue(QueueSpec::new("snap").priority(QueuePriority::High));
        assert!(queue.post_task(|| {}));
        assert!(queue.post_delayed_task(Duration::from_secs(2), || {}));
        fx.manager.insert_fence(&queue, FencePosition::Now).unwrap();

        let snapshot = fx.manager.snapshot();
        assert_eq!(snapshot.queues.len(), 1);
        let q = &snapshot.queues[0];
        assert_eq!(q.name, "snap");
        assert_eq!(q.priority, QueuePriority::High);
        assert!(q.enabled);
        assert!(q.fenced);
        assert_eq!(q.incoming, 1);
        assert_eq!(q.delayed_incoming, 1);
        assert_eq!(q.next_delayed_task_in_ms, Some(2000));

        let json = fx.manager.snapshot_json();
        assert!(json.contains("\"snap\""));
    }

    #[test]
    fn handles_are_send() {
        fn assert_send_sync<T: Send + Sync>() {}
        fn assert_send<T: Send>() {}
        assert_send_sync::<TaskQueue>();
        assert_send::<ShutdownHandle>();
    }
}
