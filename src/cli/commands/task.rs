//! `conduit task` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::commands::open_runtime;
use crate::cli::display::{
    action_failure, action_success, colorize_status, format_timestamp, list_table, output,
    render_list, truncate, CommandOutput, DetailView,
};
use crate::domain::errors::DomainError;
use crate::domain::models::{
    parse_scheduled_at, Config, NewTask, TaskFilter, TaskRecord, TaskStats, TaskStatus,
};

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Add a task to the queue
    Enqueue {
        /// Unique task id
        task_id: String,
        /// Handler type that will run the task
        task_type: String,
        /// JSON payload handed to the handler
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// Earliest run time, RFC3339 with an offset (e.g. 2026-01-10T09:00:00+11:00)
        #[arg(long)]
        at: Option<String>,
        /// Retries allowed after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,
        /// Recurrence rule, e.g. "FREQ=DAILY;BYHOUR=9;BYMINUTE=0"
        #[arg(long)]
        rrule: Option<String>,
        /// Replace an existing task with the same id instead of failing
        #[arg(long)]
        singleton: bool,
    },
    /// List tasks, newest first
    List {
        /// Filter by status (pending, processing, completed, failed)
        #[arg(short, long)]
        status: Option<String>,
        /// Filter by task type
        #[arg(short = 't', long = "type")]
        task_type: Option<String>,
        /// Only rows belonging to this recurring series
        #[arg(long)]
        series: Option<String>,
        /// Maximum number of rows to show
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
    /// Show one task
    Show {
        task_id: String,
    },
    /// Reset a failed task to pending with a fresh retry budget
    Retry {
        /// Internal row id (see `task list`)
        internal_id: i64,
    },
    /// Cancel a pending or processing task
    Cancel {
        task_id: String,
        #[arg(long, default_value = "Cancelled by user")]
        reason: String,
    },
    /// Cancel every unfinished occurrence of a recurring series
    CancelSeries {
        /// The series id (the first occurrence's task id)
        original_task_id: String,
        #[arg(long, default_value = "Series cancelled by user")]
        reason: String,
    },
    /// Row counts per status
    Stats,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailOutput {
    pub task: TaskRecord,
}

impl CommandOutput for TaskDetailOutput {
    fn to_human(&self) -> String {
        let task = &self.task;
        DetailView::new(&format!("Task {}", task.task_id))
            .field("Internal id", task.internal_id)
            .field("Type", &task.task_type)
            .field("Status", colorize_status(task.status.as_str()))
            .field("Scheduled", format_timestamp(task.scheduled_at.as_ref()))
            .field("Retries", format!("{}/{}", task.retry_count, task.max_retries))
            .field_opt("Recurrence", task.recurrence_rule.as_deref())
            .field("Series", task.series_id())
            .field_opt("Locked by", task.locked_by.as_deref())
            .field_opt("Last error", task.last_error.as_deref())
            .field("Created", format_timestamp(Some(&task.created_at)))
            .section("Payload")
            .field("Body", &task.payload)
            .render()
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListOutput {
    pub tasks: Vec<TaskRecord>,
    pub total: usize,
}

impl CommandOutput for TaskListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "task id", "type", "status", "scheduled", "retries"]);
        for task in &self.tasks {
            table.add_row(vec![
                task.internal_id.to_string(),
                truncate(&task.task_id, 48),
                task.task_type.clone(),
                colorize_status(task.status.as_str()).to_string(),
                format_timestamp(task.scheduled_at.as_ref()),
                format!("{}/{}", task.retry_count, task.max_retries),
            ]);
        }
        render_list("task", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskActionOutput {
    pub success: bool,
    pub message: String,
    pub affected: u64,
}

impl CommandOutput for TaskActionOutput {
    fn to_human(&self) -> String {
        if self.success {
            action_success(&self.message)
        } else {
            action_failure(&self.message)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskStatsOutput {
    #[serde(flatten)]
    pub stats: TaskStats,
    pub total: u64,
}

impl CommandOutput for TaskStatsOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["status", "count"]);
        for (status, count) in [
            (TaskStatus::Pending, self.stats.pending),
            (TaskStatus::Processing, self.stats.processing),
            (TaskStatus::Completed, self.stats.completed),
            (TaskStatus::Failed, self.stats.failed),
        ] {
            table.add_row(vec![colorize_status(status.as_str()).to_string(), count.to_string()]);
        }
        table.add_row(vec!["total".to_string(), self.total.to_string()]);
        table.to_string()
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    TaskStatus::from_str(raw).ok_or_else(|| {
        DomainError::Validation(format!(
            "unknown status '{raw}' (expected pending, processing, completed or failed)"
        ))
        .into()
    })
}

fn parse_payload(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| DomainError::Validation(format!("payload is not valid JSON: {e}")).into())
}

pub async fn execute(args: TaskArgs, config: &Config, json_mode: bool) -> Result<()> {
    let conduit = open_runtime(config).await?;
    let queue = conduit.queue();

    match args.command {
        TaskCommands::Enqueue {
            task_id,
            task_type,
            payload,
            at,
            max_retries,
            rrule,
            singleton,
        } => {
            let mut task = NewTask::new(task_id, task_type, parse_payload(&payload)?);
            if let Some(at) = at {
                task = task.scheduled_at(parse_scheduled_at(&at)?);
            }
            if let Some(max_retries) = max_retries {
                task = task.with_max_retries(max_retries);
            }
            if let Some(rule) = rrule {
                task = task.with_recurrence(rule);
            }
            if singleton {
                task = task.singleton();
            }

            let record = queue.enqueue(task).await?;
            output(&TaskDetailOutput { task: record }, json_mode);
        }
        TaskCommands::List {
            status,
            task_type,
            series,
            limit,
        } => {
            let filter = TaskFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                task_type,
                original_task_id: series,
                limit: Some(limit),
            };
            let tasks = queue.get_all(&filter).await.context("Failed to list tasks")?;
            let total = tasks.len();
            output(&TaskListOutput { tasks, total }, json_mode);
        }
        TaskCommands::Show { task_id } => {
            let task = queue
                .get_task(&task_id)
                .await
                .context("Failed to retrieve task")?
                .ok_or(DomainError::TaskNotFound(task_id))?;
            output(&TaskDetailOutput { task }, json_mode);
        }
        TaskCommands::Retry { internal_id } => {
            let retried = queue.manually_retry(internal_id).await?;
            let message = if retried {
                format!("Task #{internal_id} reset to pending")
            } else {
                format!("Task #{internal_id} is not in a failed state; nothing to retry")
            };
            output(
                &TaskActionOutput {
                    success: retried,
                    message,
                    affected: u64::from(retried),
                },
                json_mode,
            );
        }
        TaskCommands::Cancel { task_id, reason } => {
            let cancelled = queue.cancel_task(&task_id, &reason).await?;
            let message = if cancelled {
                format!("Task {task_id} cancelled")
            } else {
                format!("Task {task_id} was not found or already finished")
            };
            output(
                &TaskActionOutput {
                    success: cancelled,
                    message,
                    affected: u64::from(cancelled),
                },
                json_mode,
            );
        }
        TaskCommands::CancelSeries {
            original_task_id,
            reason,
        } => {
            let affected = queue.cancel_series(&original_task_id, &reason).await?;
            output(
                &TaskActionOutput {
                    success: affected > 0,
                    message: format!("Cancelled {affected} task(s) in series {original_task_id}"),
                    affected,
                },
                json_mode,
            );
        }
        TaskCommands::Stats => {
            let stats = queue.count_by_status().await?;
            output(
                &TaskStatsOutput {
                    total: stats.total(),
                    stats,
                },
                json_mode,
            );
        }
    }

    conduit.close().await;
    Ok(())
}
