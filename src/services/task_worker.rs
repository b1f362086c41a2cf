//! Worker loop: claim tasks, run their handlers, report outcomes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::RECURRENCE_MARKER;
use crate::domain::models::{NewTask, RecurrenceRule, TaskRecord, TaskStatus, WorkerConfig};
use crate::services::task_queue::TaskQueue;

/// Executes tasks of one type. Returning `Err` schedules a retry or, once
/// the budget is spent, fails the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()>;
}

/// Handlers keyed by `task_type`. The registered types are exactly what a
/// worker asks the queue for.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

/// Exponential backoff between attempts of a failing task.
///
/// Delay doubles with each retry: 10s → 20s → 40s → ... capped at the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            initial_backoff_ms: config.retry_initial_backoff_ms,
            max_backoff_ms: config.retry_max_backoff_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following a failure at `retry_count`.
    pub fn backoff(&self, retry_count: u32) -> chrono::Duration {
        let ms = 2_u64
            .checked_pow(retry_count)
            .and_then(|factor| self.initial_backoff_ms.checked_mul(factor))
            .map_or(self.max_backoff_ms, |ms| ms.min(self.max_backoff_ms));
        chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }
}

/// Result of one worker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was due.
    Idle,
    Completed {
        task_id: String,
        /// Sibling enqueued for the next occurrence of a recurring task.
        next_task_id: Option<String>,
    },
    Retrying {
        task_id: String,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed { task_id: String, error: String },
    /// The row was cancelled or reclaimed while its handler ran. Its stored
    /// state is kept and no further occurrence is scheduled.
    Superseded { task_id: String },
}

pub struct TaskWorker {
    worker_id: String,
    queue: Arc<TaskQueue>,
    registry: HandlerRegistry,
    retry_policy: RetryPolicy,
    poll_interval: Duration,
    timezone: Tz,
}

impl TaskWorker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<TaskQueue>,
        registry: HandlerRegistry,
        retry_policy: RetryPolicy,
        poll_interval: Duration,
        timezone: Tz,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            registry,
            retry_policy,
            poll_interval,
            timezone,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and run at most one task as of `now`.
    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn process_next(&self, now: DateTime<Utc>) -> DomainResult<WorkOutcome> {
        let task_types = self.registry.task_types();
        let Some(task) = self.queue.dequeue_at(&self.worker_id, &task_types, now).await? else {
            return Ok(WorkOutcome::Idle);
        };

        let result = match self.registry.get(&task.task_type) {
            Some(handler) => handler.handle(&task).await,
            None => Err(anyhow::anyhow!("no handler registered for task type '{}'", task.task_type)),
        };

        match result {
            Ok(()) => {
                let finished = self
                    .queue
                    .finish_claimed(&task.task_id, &self.worker_id, TaskStatus::Completed, None)
                    .await?;
                if !finished {
                    return Ok(WorkOutcome::Superseded { task_id: task.task_id });
                }
                info!(task_id = %task.task_id, task_type = %task.task_type, "Task completed");
                let next_task_id = if task.is_recurring() {
                    self.schedule_next_occurrence(&task, now).await?
                } else {
                    None
                };
                Ok(WorkOutcome::Completed {
                    task_id: task.task_id,
                    next_task_id,
                })
            }
            Err(err) => self.handle_failure(task, &format!("{err:#}"), now).await,
        }
    }

    async fn handle_failure(
        &self,
        task: TaskRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<WorkOutcome> {
        if task.retry_count < task.max_retries {
            let retry_count = task.retry_count + 1;
            let next_attempt_at = now + self.retry_policy.backoff(task.retry_count);
            warn!(
                task_id = %task.task_id,
                retry_count,
                max_retries = task.max_retries,
                %error,
                "Task failed, retrying"
            );
            let rescheduled = self
                .queue
                .reschedule_for_retry(&task.task_id, next_attempt_at, retry_count, error)
                .await?;
            if !rescheduled {
                return Ok(WorkOutcome::Superseded { task_id: task.task_id });
            }
            Ok(WorkOutcome::Retrying {
                task_id: task.task_id,
                retry_count,
                next_attempt_at,
            })
        } else {
            error!(
                task_id = %task.task_id,
                retry_count = task.retry_count,
                %error,
                "Task failed permanently"
            );
            let finished = self
                .queue
                .finish_claimed(&task.task_id, &self.worker_id, TaskStatus::Failed, Some(error))
                .await?;
            if !finished {
                return Ok(WorkOutcome::Superseded { task_id: task.task_id });
            }
            Ok(WorkOutcome::Failed {
                task_id: task.task_id,
                error: error.to_string(),
            })
        }
    }

    /// Enqueue the sibling for the next occurrence of a completed recurring task.
    async fn schedule_next_occurrence(
        &self,
        task: &TaskRecord,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<String>> {
        let Some(raw_rule) = &task.recurrence_rule else {
            return Ok(None);
        };
        let rule = match RecurrenceRule::parse(raw_rule) {
            Ok(rule) => rule,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Stored recurrence rule is invalid, series ends");
                return Ok(None);
            }
        };

        // Retries move scheduled_at, never the slot.
        let dtstart = task.occurrence_at.unwrap_or(task.created_at);
        let after = task.occurrence_at.map_or(now, |at| at.max(now));
        let Some(next) = rule.next_occurrence(dtstart, after, self.timezone) else {
            warn!(task_id = %task.task_id, "Recurrence rule has no further occurrence");
            return Ok(None);
        };

        let series = task.series_id().to_string();
        let sibling_id = format!("{series}{RECURRENCE_MARKER}{}", next.format("%Y%m%dT%H%M%SZ"));
        let sibling = NewTask::new(&sibling_id, &task.task_type, task.payload.clone())
            .scheduled_at(next)
            .with_max_retries(task.max_retries)
            .with_recurrence(raw_rule)
            .in_series(&series);

        match self.queue.enqueue_at(sibling, now).await {
            Ok(_) => {
                info!(task_id = %task.task_id, next_task_id = %sibling_id, %next, "Next occurrence scheduled");
                Ok(Some(sibling_id))
            }
            Err(DomainError::DuplicateTask(_)) => {
                debug!(next_task_id = %sibling_id, "Next occurrence already scheduled");
                Ok(Some(sibling_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Process tasks until `shutdown` is set to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            task_types = ?self.registry.task_types(),
            "Worker started"
        );
        let signal = self.queue.signal().clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next(Utc::now()).await {
                Ok(WorkOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Worker iteration failed");
                    true
                }
            };
            if !idle {
                continue;
            }

            tokio::select! {
                _ = signal.wait(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Worker stopped");
    }
}
