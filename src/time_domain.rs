use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::host::HostRuntime;
use crate::task_queue::{QueueId, TaskQueue};

/// Samples a domain's clock at most once, however often it is asked.
/// One scheduling pass shares a single LazyNow so every readiness decision
/// in the pass agrees on what "now" is.
pub struct LazyNow<'a> {
    domain: &'a TimeDomain,
    value: Option<Instant>,
}

impl LazyNow<'_> {
    pub fn now(&mut self) -> Instant {
        if let Some(value) = self.value {
            return value;
        }
        let value = self.domain.now();
        self.value = Some(value);
        value
    }
}

enum DomainClock {
    /// Reads the host runtime's clock and arms real delayed wake-ups on it.
    Host(Arc<dyn HostRuntime>),
    /// An explicit instant, moved forward by `advance_to` or, when
    /// `auto_advance` is set, by `maybe_advance_time`.
    Virtual {
        now: Mutex<Instant>,
        auto_advance: bool,
    },
}

struct DomainState {
    /// Pending wake-ups, one entry per (run time, queue). The queue id in
    /// the key keeps simultaneous wake-ups of different queues distinct.
    wakeups: BTreeMap<(Instant, QueueId), TaskQueue>,
    /// Earliest host wake-up currently armed. Only meaningful for host
    /// clocks; used to avoid re-arming for times we already cover.
    next_armed: Option<Instant>,
}

/// A notion of "now" plus the delayed-task wake-up bookkeeping for every
/// queue bound to it. Domains are independent: advancing one never makes a
/// task on another domain's queue ready.
pub struct TimeDomain {
    clock: DomainClock,
    inner: Mutex<DomainState>,
}

impl TimeDomain {
    pub(crate) fn new_real(host: Arc<dyn HostRuntime>) -> Arc<Self> {
        Arc::new(Self {
            clock: DomainClock::Host(host),
            inner: Mutex::new(DomainState {
                wakeups: BTreeMap::new(),
                next_armed: None,
            }),
        })
    }

    /// A domain whose clock only moves when told to via `advance_to`.
    pub fn new_virtual(initial: Instant) -> Arc<Self> {
        Self::new_virtual_inner(initial, false)
    }

    /// A virtual domain that the manager may fast-forward to its next
    /// scheduled wake-up whenever the system is otherwise idle.
    pub fn new_auto_advancing(initial: Instant) -> Arc<Self> {
        Self::new_virtual_inner(initial, true)
    }

    fn new_virtual_inner(initial: Instant, auto_advance: bool) -> Arc<Self> {
        Arc::new(Self {
            clock: DomainClock::Virtual {
                now: Mutex::new(initial),
                auto_advance,
            },
            inner: Mutex::new(DomainState {
                wakeups: BTreeMap::new(),
                next_armed: None,
            }),
        })
    }

    pub fn now(&self) -> Instant {
        match &self.clock {
            DomainClock::Host(host) => host.now(),
            DomainClock::Virtual { now, .. } => *now.lock(),
        }
    }

    pub fn create_lazy_now(&self) -> LazyNow<'_> {
        LazyNow {
            domain: self,
            value: None,
        }
    }

    /// Move a virtual clock forward. Never moves it backwards; a no-op with
    /// a warning on a real-time domain.
    pub fn advance_to(&self, instant: Instant) {
        match &self.clock {
            DomainClock::Virtual { now, .. } => {
                let mut now = now.lock();
                if *now < instant {
                    *now = instant;
                }
            }
            DomainClock::Host(_) => {
                warn!("advance_to called on a real-time domain");
            }
        }
    }

    /// Earliest pending wake-up across every queue in this domain.
    pub fn next_scheduled_run_time(&self) -> Option<Instant> {
        self.inner
            .lock()
            .wakeups
            .first_key_value()
            .map(|((t, _), _)| *t)
    }

    /// Record that `queue`'s soonest delayed task now runs at `run_time`,
    /// replacing `previous` if it had one. Arms the host when this becomes
    /// the domain-wide soonest wake-up.
    pub(crate) fn schedule_wakeup(
        &self,
        queue_id: QueueId,
        queue: &TaskQueue,
        previous: Option<Instant>,
        run_time: Instant,
    ) {
        let mut state = self.inner.lock();
        if let Some(previous) = previous {
            state.wakeups.remove(&(previous, queue_id));
        }
        state.wakeups.insert((run_time, queue_id), queue.clone());
        self.arm_host(&mut state);
    }

    pub(crate) fn cancel_wakeup(&self, queue_id: QueueId, run_time: Instant) {
        // an already-armed host timer may still fire; it finds nothing due
        self.inner.lock().wakeups.remove(&(run_time, queue_id));
    }

    /// Remove and return every queue whose wake-up time has arrived, then
    /// re-arm for whatever remains.
    pub(crate) fn take_ready_queues(&self) -> Vec<TaskQueue> {
        let now = self.now();
        let mut state = self.inner.lock();
        let mut ready = Vec::new();
        while let Some(entry) = state.wakeups.first_entry() {
            if entry.key().0 > now {
                break;
            }
            ready.push(entry.remove());
        }
        if state.next_armed.map_or(false, |armed| armed <= now) {
            state.next_armed = None;
        }
        self.arm_host(&mut state);
        ready
    }

    /// Fast-forward an auto-advancing virtual clock to its next wake-up.
    /// Returns whether time moved.
    pub(crate) fn maybe_advance_time(&self) -> bool {
        let DomainClock::Virtual {
            now,
            auto_advance: true,
        } = &self.clock
        else {
            return false;
        };
        let next = match self.inner.lock().wakeups.first_key_value() {
            Some(((t, _), _)) => *t,
            None => return false,
        };
        let mut now = now.lock();
        if *now < next {
            *now = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&self) {
        let mut state = self.inner.lock();
        state.wakeups.clear();
        state.next_armed = None;
    }

    fn arm_host(&self, state: &mut DomainState) {
        let DomainClock::Host(host) = &self.clock else {
            return;
        };
        let Some(((soonest, _), _)) = state.wakeups.first_key_value() else {
            return;
        };
        let soonest = *soonest;
        if state.next_armed.map_or(true, |armed| soonest < armed) {
            host.schedule_delayed_work(soonest.saturating_duration_since(host.now()));
            state.next_armed = Some(soonest);
        }
    }
}
