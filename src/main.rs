//! Conduit CLI entry point.

use clap::Parser;

use conduit::cli::commands::{event, init, listener, task, worker};
use conduit::cli::{handle_error, Cli, Commands};
use conduit::infrastructure::config::ConfigLoader;
use conduit::infrastructure::logging::LoggerImpl;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::load() {
        Ok(config) => config,
        Err(err) => handle_error(err.context("Failed to load configuration"), cli.json),
    };
    let _logger = match LoggerImpl::init(&config.logging) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Init(args) => init::execute(args, cli.json).await,
        Commands::Task(args) => task::execute(args, &config, cli.json).await,
        Commands::Listener(args) => listener::execute(args, &config, cli.json).await,
        Commands::Event(args) => event::execute(args, &config, cli.json).await,
        Commands::Worker(args) => worker::execute(args, &config, cli.json).await,
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
