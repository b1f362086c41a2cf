//! `conduit listener` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cli::commands::open_runtime;
use crate::cli::display::{
    action_success, colorize_status, format_timestamp, list_table, output, render_list, truncate,
    CommandOutput, DetailView,
};
use crate::domain::errors::DomainError;
use crate::domain::models::{Config, EventListener, ListenerAction, ListenerFilter, NewEventListener};
use crate::services::ListenerService;

#[derive(Args, Debug)]
pub struct ListenerArgs {
    #[command(subcommand)]
    pub command: ListenerCommands,
}

#[derive(Subcommand, Debug)]
pub enum ListenerCommands {
    /// Create a listener that wakes the conversation or runs a script
    Create {
        /// Name, unique within the conversation
        #[arg(long)]
        name: String,
        /// Event source to listen to (e.g. github, home_assistant)
        #[arg(long)]
        source: String,
        /// Conversation that owns the listener
        #[arg(long)]
        conversation: String,
        /// Interface the conversation lives on (e.g. slack, telegram)
        #[arg(long)]
        interface: String,
        #[arg(long)]
        description: Option<String>,
        /// Match condition as PATH=VALUE; VALUE is parsed as JSON when possible
        #[arg(short = 'w', long = "when", value_name = "PATH=VALUE")]
        conditions: Vec<String>,
        /// Extra context for the wake-up message
        #[arg(long, conflicts_with = "script")]
        context: Option<String>,
        /// Run this script instead of waking the conversation
        #[arg(long)]
        script: Option<String>,
        /// JSON object handed to the script alongside the event
        #[arg(long, requires = "script")]
        script_config: Option<String>,
        /// Disable the listener after it fires once
        #[arg(long)]
        one_time: bool,
        /// Create the listener disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List listeners
    List {
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Only enabled listeners
        #[arg(long)]
        enabled_only: bool,
    },
    /// Show one listener
    Show { id: i64 },
    /// Enable a listener
    Enable { id: i64 },
    /// Disable a listener
    Disable { id: i64 },
    /// Delete a listener
    Delete { id: i64 },
}

#[derive(Debug, Serialize)]
pub struct ListenerDetailOutput {
    pub listener: EventListener,
}

impl CommandOutput for ListenerDetailOutput {
    fn to_human(&self) -> String {
        let l = &self.listener;
        let mut view = DetailView::new(&format!("Listener #{} {}", l.id, l.name))
            .field_opt("Description", l.description.as_deref())
            .field("Source", &l.source_id)
            .field("Conversation", format!("{} ({})", l.conversation_id, l.interface_type))
            .field("State", colorize_status(enabled_label(l.enabled)))
            .field("One time", l.one_time)
            .field(
                "Executions",
                format!("{} today, resets {}", l.daily_executions, format_timestamp(l.daily_reset_at.as_ref())),
            )
            .field("Last fired", format_timestamp(l.last_execution_at.as_ref()))
            .section("Conditions");
        if l.match_conditions.is_empty() {
            view = view.field("(any)", "matches every event from the source");
        }
        for (path, expected) in &l.match_conditions {
            view = view.field(path, expected);
        }
        view = view.section("Action");
        view = match &l.action {
            ListenerAction::WakeLlm { context } => view
                .field("Type", "wake_llm")
                .field_opt("Context", context.as_deref()),
            ListenerAction::Script { code, config } => view
                .field("Type", "script")
                .field("Code", truncate(code, 60))
                .field("Config", config),
        };
        view.render()
    }
}

#[derive(Debug, Serialize)]
pub struct ListenerListOutput {
    pub listeners: Vec<EventListener>,
    pub total: usize,
}

impl CommandOutput for ListenerListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "name", "source", "conversation", "action", "state", "today"]);
        for l in &self.listeners {
            table.add_row(vec![
                l.id.to_string(),
                truncate(&l.name, 32),
                l.source_id.clone(),
                l.conversation_id.clone(),
                l.action.action_type().to_string(),
                colorize_status(enabled_label(l.enabled)).to_string(),
                l.daily_executions.to_string(),
            ]);
        }
        render_list("listener", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct ListenerActionOutput {
    pub id: i64,
    pub message: String,
}

impl CommandOutput for ListenerActionOutput {
    fn to_human(&self) -> String {
        action_success(&self.message)
    }
}

const fn enabled_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Parse `PATH=VALUE` pairs. Values that are not valid JSON are taken as
/// strings, so `state=on` and `state="on"` are equivalent.
fn parse_conditions(raw: &[String]) -> Result<Map<String, Value>> {
    let mut conditions = Map::new();
    for pair in raw {
        let (path, value) = pair.split_once('=').ok_or_else(|| {
            DomainError::Validation(format!("condition '{pair}' must look like PATH=VALUE"))
        })?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        conditions.insert(path.trim().to_string(), value);
    }
    Ok(conditions)
}

fn build_action(context: Option<String>, script: Option<String>, script_config: Option<&str>) -> Result<ListenerAction> {
    match script {
        Some(code) => {
            let config = script_config
                .map(serde_json::from_str::<Value>)
                .transpose()
                .map_err(|e| DomainError::Validation(format!("script config is not valid JSON: {e}")))?
                .unwrap_or_else(|| Value::Object(Map::new()));
            Ok(ListenerAction::Script { code, config })
        }
        None => Ok(ListenerAction::WakeLlm { context }),
    }
}

async fn toggle(service: &ListenerService, id: i64, enable: bool, json_mode: bool) -> Result<()> {
    service.set_enabled(id, enable).await?;
    output(
        &ListenerActionOutput {
            id,
            message: format!("Listener #{id} {}", enabled_label(enable)),
        },
        json_mode,
    );
    Ok(())
}

pub async fn execute(args: ListenerArgs, config: &Config, json_mode: bool) -> Result<()> {
    let conduit = open_runtime(config).await?;
    let service = conduit.listeners();

    match args.command {
        ListenerCommands::Create {
            name,
            source,
            conversation,
            interface,
            description,
            conditions,
            context,
            script,
            script_config,
            one_time,
            disabled,
        } => {
            let action = build_action(context, script, script_config.as_deref())?;
            let mut listener = NewEventListener::new(name, source, action, conversation, interface)
                .with_conditions(parse_conditions(&conditions)?);
            if let Some(description) = description {
                listener = listener.with_description(description);
            }
            if one_time {
                listener = listener.one_time();
            }
            listener.enabled = !disabled;

            let created = service.create_event_listener(listener).await?;
            output(&ListenerDetailOutput { listener: created }, json_mode);
        }
        ListenerCommands::List {
            conversation,
            source,
            enabled_only,
        } => {
            let filter = ListenerFilter {
                conversation_id: conversation,
                source_id: source,
                enabled_only,
            };
            let listeners = service.list(&filter).await.context("Failed to list listeners")?;
            let total = listeners.len();
            output(&ListenerListOutput { listeners, total }, json_mode);
        }
        ListenerCommands::Show { id } => {
            let listener = service.get(id).await?;
            output(&ListenerDetailOutput { listener }, json_mode);
        }
        ListenerCommands::Enable { id } => toggle(&service, id, true, json_mode).await?,
        ListenerCommands::Disable { id } => toggle(&service, id, false, json_mode).await?,
        ListenerCommands::Delete { id } => {
            service.delete(id).await?;
            output(
                &ListenerActionOutput {
                    id,
                    message: format!("Listener #{id} deleted"),
                },
                json_mode,
            );
        }
    }

    conduit.close().await;
    Ok(())
}
