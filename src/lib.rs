//! Conduit - durable task queue and event-driven automation engine
//!
//! Conduit stores scheduled and event-triggered work in `SQLite`, hands each
//! due task to exactly one worker at a time, retries failures with
//! exponential backoff and re-enqueues recurring tasks in a configured
//! timezone. Event listeners match incoming payloads by dotted-path
//! conditions and enqueue follow-up tasks under a per-listener daily cap.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and repository ports
//! - **Adapters** (`adapters`): `SQLite` repositories and claim strategies
//! - **Service Layer** (`services`): queue, worker, listeners, event processing
//! - **Application Layer** (`application`): wiring from configuration
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use conduit::application::Conduit;
//! use conduit::domain::models::{Config, NewTask};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let conduit = Conduit::open(Config::default()).await?;
//!     conduit
//!         .queue()
//!         .enqueue(NewTask::new("digest", "llm_callback", serde_json::json!({})))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::Conduit;
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Config, EventListener, ListenerAction, NewEventListener, NewTask, TaskRecord, TaskStatus,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    EventProcessor, HandlerRegistry, ListenerService, ProcessReport, TaskHandler, TaskQueue,
    TaskWorker,
};
