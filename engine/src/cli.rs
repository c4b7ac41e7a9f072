//! CLI interface for Steward
//!
//! Command-line surface built with clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Steward personal assistant
///
/// Routes your messages to feature handlers, remembers what you tell it,
/// and answers everything else through a language model.
#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the Telegram bot and the scheduler until Ctrl-C
    Serve,

    /// Chat on the terminal
    Chat {
        /// User to chat as
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Send one message and print the reply
    Ask {
        /// The message to send
        message: String,

        /// User to send as
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// List registered handlers
    Handlers,

    /// Check the store and reasoning providers
    Doctor,

    /// Manage API keys and the bot token in the OS keychain
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

/// Keychain actions
#[derive(Subcommand, Debug)]
pub enum SecretAction {
    /// Store a secret, prompting for its value
    Set {
        /// openai_api_key, anthropic_api_key or telegram_bot_token
        key: String,
    },

    /// Remove a secret
    Delete {
        /// Secret name
        key: String,
    },

    /// Show which secrets are available
    Status,
}
