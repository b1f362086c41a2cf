//! Port trait definitions (Hexagonal Architecture)
//!
//! Storage contracts the services depend on:
//! - TaskRepository: durable task rows and atomic claiming
//! - ListenerRepository: event listeners and their daily counters
//! - EventRepository: the received-event log

pub mod event_repository;
pub mod listener_repository;
pub mod task_repository;

pub use event_repository::EventRepository;
pub use listener_repository::ListenerRepository;
pub use task_repository::TaskRepository;
