use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::manager::TaskQueueManager;

/// What the scheduler needs from the loop that hosts it: a way to get its
/// work pass invoked now or after a delay, the nesting state of that loop,
/// and a clock for the real time domain.
///
/// `schedule_work` must be callable from any thread. One call to either
/// scheduling method must eventually produce one invocation of
/// `TaskQueueManager::do_work`; extra invocations are harmless.
pub trait HostRuntime: Send + Sync {
    fn schedule_work(&self);
    fn schedule_delayed_work(&self, delay: Duration);
    fn is_nested(&self) -> bool {
        false
    }
    fn now(&self) -> Instant;
}

enum HostEvent {
    Immediate,
    Delayed(Instant),
}

/// Host half handed to the manager: forwards wake-up requests into a
/// channel the loop half sleeps on.
pub struct ChannelHost {
    tx: Sender<HostEvent>,
}

impl HostRuntime for ChannelHost {
    fn schedule_work(&self) {
        let _ = self.tx.send(HostEvent::Immediate);
    }

    fn schedule_delayed_work(&self, delay: Duration) {
        let _ = self.tx.send(HostEvent::Delayed(Instant::now() + delay));
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A minimal standalone host loop: parks on the wake-up channel, waking at
/// the earliest requested delayed time, and drives the manager's work pass.
/// Runs until the manager is shut down.
pub struct HostLoop {
    rx: Receiver<HostEvent>,
    timers: BinaryHeap<std::cmp::Reverse<Instant>>,
}

impl HostLoop {
    pub fn new() -> (Arc<ChannelHost>, HostLoop) {
        let (tx, rx) = flume::unbounded();
        (
            Arc::new(ChannelHost { tx }),
            HostLoop {
                rx,
                timers: BinaryHeap::new(),
            },
        )
    }

    pub fn run(mut self, manager: &TaskQueueManager) {
        loop {
            if manager.is_shutdown() {
                debug!("host loop exiting on shutdown");
                return;
            }
            // fire a due timer before parking again
            if let Some(std::cmp::Reverse(deadline)) = self.timers.peek().copied() {
                if deadline <= Instant::now() {
                    self.timers.pop();
                    manager.do_work();
                    continue;
                }
                match self.rx.recv_deadline(deadline) {
                    Ok(event) => self.handle(event, manager),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                match self.rx.recv() {
                    Ok(event) => self.handle(event, manager),
                    Err(_) => return,
                }
            }
        }
    }

    fn handle(&mut self, event: HostEvent, manager: &TaskQueueManager) {
        match event {
            HostEvent::Immediate => manager.do_work(),
            HostEvent::Delayed(deadline) => self.timers.push(std::cmp::Reverse(deadline)),
        }
    }
}
