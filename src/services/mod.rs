//! Services coordinating the queue, listeners and workers.

pub mod condition_matcher;
pub mod event_processor;
pub mod listener_service;
pub mod rate_limiter;
pub mod system_tasks;
pub mod task_queue;
pub mod task_worker;
pub mod work_signal;

pub use condition_matcher::{lookup_path, matches_conditions};
pub use event_processor::{EventProcessor, ProcessReport};
pub use listener_service::ListenerService;
pub use rate_limiter::RateLimiter;
pub use system_tasks::{register_system_tasks, EventCleanupHandler, EVENT_CLEANUP_TASK_ID, EVENT_CLEANUP_TASK_TYPE};
pub use task_queue::TaskQueue;
pub use task_worker::{HandlerRegistry, RetryPolicy, TaskHandler, TaskWorker, WorkOutcome};
pub use work_signal::WorkSignal;
