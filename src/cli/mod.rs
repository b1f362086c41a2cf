//! Command-line interface.

pub mod commands;
pub mod display;

use clap::{Parser, Subcommand};

use crate::domain::errors::DomainError;
use commands::event::EventArgs;
use commands::init::InitArgs;
use commands::listener::ListenerArgs;
use commands::task::TaskArgs;
use commands::worker::WorkerArgs;

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Conduit - durable task queue and event-driven automation engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the config directory, default config and database
    Init(InitArgs),
    /// Enqueue, inspect, retry and cancel tasks
    Task(TaskArgs),
    /// Manage event listeners
    Listener(ListenerArgs),
    /// Emit and inspect events
    Event(EventArgs),
    /// Run task workers
    Worker(WorkerArgs),
}

/// Report a command failure and exit non-zero.
///
/// Caller mistakes (validation, duplicates, unknown ids) print their message
/// alone; anything else prints the full context chain.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    let domain_message = err
        .downcast_ref::<DomainError>()
        .filter(|e| e.is_user_facing())
        .map(ToString::to_string);
    let user_facing = domain_message.is_some();
    let message = domain_message.unwrap_or_else(|| format!("{err:#}"));

    if json_mode {
        let body = serde_json::json!({ "error": message, "user_error": user_facing });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else if user_facing {
        eprintln!("{message}");
    } else {
        eprintln!("{}", display::action_failure(&format!("Error: {message}")));
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_json_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["conduit", "task", "stats", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Task(_)));
    }
}
