use tracing::trace;

use crate::task_queue::{QueuePriority, TaskQueue};
use crate::work_queue::WorkQueueKind;
use crate::work_queue_sets::WorkQueueSets;

/// Anti-starvation thresholds. The defaults match long-observed scheduler
/// behavior; they are tunable because neither value has a principled
/// derivation.
#[derive(Clone, Copy, Debug)]
pub struct SelectorConfig {
    /// Consecutive High selections allowed before a runnable Normal queue
    /// is forced to run once.
    pub high_priority_starvation_limit: u32,
    /// Consecutive delayed-over-available-immediate selections allowed
    /// before the oldest immediate task is forced to run once.
    pub immediate_starvation_limit: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            high_priority_starvation_limit: 5,
            immediate_starvation_limit: 3,
        }
    }
}

/// Picks the single work queue whose front task runs next.
///
/// Control queues always win with their globally oldest task. Below
/// Control, priority order holds except when a starvation counter forces a
/// Normal pick, and within a level the older of the immediate and delayed
/// fronts wins (ties to immediate) except when the immediate starvation
/// counter forces an immediate pick.
pub(crate) struct TaskQueueSelector {
    immediate_sets: WorkQueueSets,
    delayed_sets: WorkQueueSets,
    config: SelectorConfig,
    high_priority_starvation: u32,
    immediate_starvation: u32,
}

impl TaskQueueSelector {
    pub(crate) fn new(config: SelectorConfig) -> Self {
        Self {
            immediate_sets: WorkQueueSets::new(),
            delayed_sets: WorkQueueSets::new(),
            config,
            high_priority_starvation: 0,
            immediate_starvation: 0,
        }
    }

    /// Re-derive a queue's membership in both set structures from its
    /// current state. Called after anything that can change a front task,
    /// the priority, the fence, or the enabled flag. Safe to call
    /// redundantly; slots are only touched when they changed.
    pub(crate) fn refresh_queue(&mut self, queue: &TaskQueue) {
        let mut main = queue.inner().main.lock();
        let selectable = main.enabled && !main.unregistered;
        let priority = main.priority;

        let desired_immediate = if selectable {
            main.immediate_work.eligible_front().map(|o| (priority, o))
        } else {
            None
        };
        let desired_delayed = if selectable {
            main.delayed_work.eligible_front().map(|o| (priority, o))
        } else {
            None
        };

        let current = main.immediate_work.slot();
        if current != desired_immediate {
            if let Some((p, o)) = current {
                self.immediate_sets.remove(p, o);
            }
            if let Some((p, o)) = desired_immediate {
                self.immediate_sets.insert(p, o, queue.clone());
            }
            main.immediate_work.set_slot(desired_immediate);
        }

        let current = main.delayed_work.slot();
        if current != desired_delayed {
            if let Some((p, o)) = current {
                self.delayed_sets.remove(p, o);
            }
            if let Some((p, o)) = desired_delayed {
                self.delayed_sets.insert(p, o, queue.clone());
            }
            main.delayed_work.set_slot(desired_delayed);
        }
    }

    pub(crate) fn has_queued_work(&self) -> bool {
        !self.immediate_sets.is_empty() || !self.delayed_sets.is_empty()
    }

    pub(crate) fn select_work_queue(&mut self) -> Option<(TaskQueue, WorkQueueKind)> {
        // Control starves nothing and is never starved; no counter updates.
        if let Some((queue, kind, _)) = self.choose_within(QueuePriority::Control, false) {
            return Some((queue, kind));
        }

        let forced_normal = self.high_priority_starvation
            >= self.config.high_priority_starvation_limit
            && (self.immediate_sets.has_work_in(QueuePriority::Normal)
                || self.delayed_sets.has_work_in(QueuePriority::Normal));

        let mut picked = None;
        if forced_normal {
            trace!("forcing a normal-priority task to bound high-priority starvation");
            picked = self
                .choose_within(QueuePriority::Normal, true)
                .map(|p| (QueuePriority::Normal, p));
        } else {
            for priority in [
                QueuePriority::High,
                QueuePriority::Normal,
                QueuePriority::BestEffort,
            ] {
                if let Some(p) = self.choose_within(priority, true) {
                    picked = Some((priority, p));
                    break;
                }
            }
        }

        let (priority, (queue, kind, delayed_over_immediate)) = picked?;

        match priority {
            QueuePriority::Control => {}
            QueuePriority::High => self.high_priority_starvation += 1,
            QueuePriority::Normal | QueuePriority::BestEffort => self.high_priority_starvation = 0,
        }
        if delayed_over_immediate {
            self.immediate_starvation += 1;
        } else {
            self.immediate_starvation = 0;
        }

        Some((queue, kind))
    }

    /// Choose between the oldest immediate and oldest delayed front within
    /// one priority level. The bool reports whether a delayed task was
    /// picked while an immediate one was available.
    fn choose_within(
        &self,
        priority: QueuePriority,
        apply_starvation: bool,
    ) -> Option<(TaskQueue, WorkQueueKind, bool)> {
        let immediate = self.immediate_sets.oldest_in(priority);
        let delayed = self.delayed_sets.oldest_in(priority);

        if apply_starvation
            && self.immediate_starvation >= self.config.immediate_starvation_limit
        {
            if let Some((_, queue)) = immediate {
                return Some((queue.clone(), WorkQueueKind::Immediate, false));
            }
        }

        match (immediate, delayed) {
            (None, None) => None,
            (Some((_, queue)), None) => Some((queue.clone(), WorkQueueKind::Immediate, false)),
            (None, Some((_, queue))) => Some((queue.clone(), WorkQueueKind::Delayed, false)),
            (Some((imm_order, imm_queue)), Some((del_order, del_queue))) => {
                // ties favor immediate
                if del_order < imm_order {
                    Some((del_queue.clone(), WorkQueueKind::Delayed, true))
                } else {
                    Some((imm_queue.clone(), WorkQueueKind::Immediate, false))
                }
            }
        }
    }
}
