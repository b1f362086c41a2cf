//! `conduit event` commands.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::commands::open_runtime;
use crate::cli::display::{
    action_success, format_timestamp, list_table, output, render_list, truncate, CommandOutput,
    DetailView,
};
use crate::domain::errors::DomainError;
use crate::domain::models::{Config, StoredEvent};
use crate::services::ProcessReport;

#[derive(Args, Debug)]
pub struct EventArgs {
    #[command(subcommand)]
    pub command: EventCommands,
}

#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Feed an event through the listeners
    Emit {
        /// Event source (e.g. github, home_assistant)
        source: String,
        /// Event payload as JSON
        payload: String,
    },
    /// List recently received events
    List {
        /// Filter by source
        #[arg(short, long)]
        source: Option<String>,
        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Show one stored event
    Show { event_id: String },
    /// Delete events older than the retention window
    Purge {
        /// Age threshold in hours (defaults to events.retention_hours)
        #[arg(long)]
        older_than_hours: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
pub struct EmitOutput {
    pub source: String,
    #[serde(flatten)]
    pub report: ProcessReport,
}

impl CommandOutput for EmitOutput {
    fn to_human(&self) -> String {
        let r = &self.report;
        let mut lines = vec![action_success(&format!(
            "Event from {} matched {} listener(s), {} task(s) enqueued",
            self.source,
            r.matched.len(),
            r.triggered()
        ))];
        for task_id in &r.enqueued {
            lines.push(format!("  enqueued      {task_id}"));
        }
        for id in &r.rate_limited {
            lines.push(format!("  rate limited  listener #{id}"));
        }
        for id in &r.disabled {
            lines.push(format!("  disabled      listener #{id} (one time)"));
        }
        for id in &r.failed {
            lines.push(format!("  failed        listener #{id}"));
        }
        if r.degraded > 0 {
            lines.push(format!("  {} degraded step(s), see logs", r.degraded));
        }
        if let Some(event_id) = &r.event_id {
            lines.push(format!("  event id      {event_id}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct EventListOutput {
    pub events: Vec<StoredEvent>,
    pub total: usize,
}

impl CommandOutput for EventListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["event id", "source", "received", "triggered", "data"]);
        for event in &self.events {
            table.add_row(vec![
                event.event_id.clone(),
                event.source_id.clone(),
                format_timestamp(Some(&event.timestamp)),
                event.triggered_listener_ids.len().to_string(),
                truncate(&event.event_data.to_string(), 40),
            ]);
        }
        render_list("event", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct EventDetailOutput {
    pub event: StoredEvent,
}

impl CommandOutput for EventDetailOutput {
    fn to_human(&self) -> String {
        let e = &self.event;
        let triggered = e
            .triggered_listener_ids
            .iter()
            .map(|id| format!("#{id}"))
            .collect::<Vec<_>>()
            .join(", ");
        DetailView::new(&format!("Event {}", e.event_id))
            .field("Source", &e.source_id)
            .field("Received", format_timestamp(Some(&e.timestamp)))
            .field("Triggered", if triggered.is_empty() { "-".to_string() } else { triggered })
            .section("Data")
            .field("Body", &e.event_data)
            .render()
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeOutput {
    pub purged: u64,
    pub older_than_hours: u32,
}

impl CommandOutput for PurgeOutput {
    fn to_human(&self) -> String {
        action_success(&format!(
            "Purged {} event(s) older than {} hour(s)",
            self.purged, self.older_than_hours
        ))
    }
}

pub async fn execute(args: EventArgs, config: &Config, json_mode: bool) -> Result<()> {
    let conduit = open_runtime(config).await?;

    match args.command {
        EventCommands::Emit { source, payload } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| DomainError::Validation(format!("payload is not valid JSON: {e}")))?;
            let report = conduit.processor().process_event(&source, payload).await?;
            output(&EmitOutput { source, report }, json_mode);
        }
        EventCommands::List { source, limit } => {
            let events = conduit
                .events()
                .list_recent(source.as_deref(), limit)
                .await
                .context("Failed to list events")?;
            let total = events.len();
            output(&EventListOutput { events, total }, json_mode);
        }
        EventCommands::Show { event_id } => {
            let event = conduit
                .events()
                .get(&event_id)
                .await
                .context("Failed to retrieve event")?
                .ok_or_else(|| DomainError::Validation(format!("event '{event_id}' not found")))?;
            output(&EventDetailOutput { event }, json_mode);
        }
        EventCommands::Purge { older_than_hours } => {
            let hours = older_than_hours.unwrap_or(config.events.retention_hours);
            let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
            let purged = conduit.events().purge_older_than(cutoff).await?;
            output(
                &PurgeOutput {
                    purged,
                    older_than_hours: hours,
                },
                json_mode,
            );
        }
    }

    conduit.close().await;
    Ok(())
}
