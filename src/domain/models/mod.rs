pub mod config;
pub mod event;
pub mod listener;
pub mod recurrence;
pub mod task;

pub use config::{
    ClaimStrategyKind, Config, DatabaseConfig, EventsConfig, LoggingConfig, QueueConfig,
    WorkerConfig,
};
pub use event::StoredEvent;
pub use listener::{
    EventListener, ExecutionCount, ListenerAction, ListenerFilter, ListenerUpdate,
    NewEventListener, RateLimitDecision,
};
pub use recurrence::{
    next_local_midnight, parse_timezone, Frequency, RecurrenceError, RecurrenceRule,
};
pub use task::{
    parse_scheduled_at, NewTask, TaskFilter, TaskRecord, TaskStats, TaskStatus,
};
