// Steward personal assistant
// Main entry point for the steward binary

use clap::Parser;
use steward_engine::cli::{Cli, Command};
use steward_engine::commands::{
    handle_ask, handle_chat, handle_doctor, handle_handlers, handle_secret, handle_serve,
    OutputFormat,
};
use steward_engine::config::Config;
use steward_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // RUST_LOG wins over --log, which wins over the config file
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);
    tracing::info!("Steward v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve => handle_serve(config).await,
        Command::Chat { user } => handle_chat(config, user).await,
        Command::Ask { message, user } => handle_ask(config, message, user, format).await,
        Command::Handlers => handle_handlers(&config, format).await,
        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
        Command::Secret { action } => handle_secret(action, format),
    }
}
