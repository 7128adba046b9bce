#![doc = include_str!("../README.md")]

mod host;
mod manager;
mod selector;
mod task;
mod task_queue;
mod time_domain;
mod work_queue;
mod work_queue_sets;

pub use host::{ChannelHost, HostLoop, HostRuntime};
pub use manager::{
    ManagerSnapshot, QueueSnapshot, QueueSpec, SchedulerError, SchedulerObserver, ShutdownHandle,
    TaskObserver, TaskObserverId, TaskQueueManager,
};
pub use selector::SelectorConfig;
pub use task::{EnqueueOrder, Nestability, TaskCanceller, TaskMetadata};
pub use task_queue::{FencePosition, QueuePriority, TaskQueue};
pub use time_domain::{LazyNow, TimeDomain};
