//! `conduit worker run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::application::LogOnlyHandler;
use crate::cli::commands::open_runtime;
use crate::cli::display::{action_success, output, CommandOutput};
use crate::domain::models::Config;
use crate::services::{TaskWorker, WorkOutcome};

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerCommands,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Claim and run tasks until interrupted
    Run {
        /// Worker id (defaults to worker.worker_id, then a random id)
        #[arg(long)]
        worker_id: Option<String>,
        /// Number of concurrent workers in this process
        #[arg(short = 'n', long, default_value = "1")]
        workers: usize,
        /// Task types to complete by logging them (no executor attached)
        #[arg(long = "log-only", value_name = "TASK_TYPE")]
        log_only: Vec<String>,
        /// Skip registering the built-in maintenance tasks
        #[arg(long)]
        no_system_tasks: bool,
        /// Exit once no task is due instead of waiting for more
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct DrainOutput {
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub superseded: usize,
}

impl DrainOutput {
    fn record(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Idle => {}
            WorkOutcome::Completed { .. } => self.completed += 1,
            WorkOutcome::Retrying { .. } => self.retrying += 1,
            WorkOutcome::Failed { .. } => self.failed += 1,
            WorkOutcome::Superseded { .. } => self.superseded += 1,
        }
    }
}

impl CommandOutput for DrainOutput {
    fn to_human(&self) -> String {
        let mut message = format!(
            "Queue drained: {} completed, {} rescheduled for retry, {} failed",
            self.completed, self.retrying, self.failed
        );
        if self.superseded > 0 {
            message.push_str(&format!(", {} cancelled while running", self.superseded));
        }
        action_success(&message)
    }
}

/// Run `worker` until nothing is due.
async fn drain(worker: &TaskWorker) -> Result<DrainOutput> {
    let mut summary = DrainOutput::default();
    loop {
        let outcome = worker.process_next(Utc::now()).await?;
        if outcome == WorkOutcome::Idle {
            return Ok(summary);
        }
        summary.record(&outcome);
    }
}

pub async fn execute(args: WorkerArgs, config: &Config, json_mode: bool) -> Result<()> {
    let WorkerCommands::Run {
        worker_id,
        workers,
        log_only,
        no_system_tasks,
        once,
    } = args.command;

    let conduit = open_runtime(config).await?;
    if !no_system_tasks {
        conduit.register_system_tasks().await?;
    }

    let mut registry = conduit.system_registry();
    for task_type in &log_only {
        registry.register(task_type.as_str(), Arc::new(LogOnlyHandler));
    }

    if once {
        let worker = conduit.worker(worker_id, registry);
        let summary = drain(&worker).await?;
        output(&summary, json_mode);
        conduit.close().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let count = workers.max(1);
    let handles: Vec<_> = (0..count)
        .map(|i| {
            let id = match (&worker_id, count) {
                (Some(id), 1) => Some(id.clone()),
                (Some(id), _) => Some(format!("{id}-{i}")),
                (None, _) => None,
            };
            let worker = conduit.worker(id, registry.clone());
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect();
    info!(workers = count, "Workers running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for in-flight tasks");
    let _ = shutdown_tx.send(true);

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    conduit.close().await;
    Ok(())
}
