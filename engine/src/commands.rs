//! Command handlers for CLI operations
//!
//! - serve: Telegram transport and scheduler until Ctrl-C
//! - chat: terminal transport
//! - ask: one message, one reply
//! - handlers: registry listing
//! - doctor: store and provider diagnostics
//! - secret: keychain management

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{error, info};

use crate::app::{build_registry, llm_reasoning, App};
use crate::bot::{LocalChat, TelegramBot};
use crate::cli::SecretAction;
use crate::config::Config;
use crate::db::Database;
use crate::secrets::{
    scrub, SecretManager, ANTHROPIC_API_KEY, OPENAI_API_KEY, SERVICE_NAME, TELEGRAM_BOT_TOKEN,
};
use sdk::errors::EngineErrorExt;
use sdk::types::{InboundMessage, UserId};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

const KNOWN_SECRETS: [&str; 3] = [OPENAI_API_KEY, ANTHROPIC_API_KEY, TELEGRAM_BOT_TOKEN];

/// Run the Telegram bot and scheduler until Ctrl-C
pub async fn handle_serve(config: Config) -> Result<()> {
    if !config.telegram.enabled {
        bail!("Telegram is disabled. Set [telegram] enabled = true in config.toml, or use `steward chat`.");
    }

    let token = SecretManager::new(SERVICE_NAME)
        .get_secret(TELEGRAM_BOT_TOKEN)?;

    let app = App::open(config).await?;
    let telegram = &app.config().telegram;
    let bot = TelegramBot::new(
        token.unsecure().to_string(),
        telegram.allowed_users.clone(),
        std::sync::Arc::clone(app.orchestrator()),
    )
    .with_poll_timeout(Duration::from_secs(telegram.poll_timeout_secs));
    let tick = Duration::from_secs(app.config().scheduler.tick_secs);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = {
        let bot = bot.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bot.start_polling(shutdown).await })
    };
    let scheduler = {
        let bot = bot.clone();
        let shutdown = shutdown_rx;
        tokio::spawn(async move { bot.run_scheduler(tick, shutdown).await })
    };

    println!("Steward is serving Telegram. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    match poller.await {
        Ok(Err(e)) => error!("Telegram polling ended with error: {}", scrub(&e.to_string())),
        Err(e) => error!("Telegram polling task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = scheduler.await {
        error!("Scheduler task failed: {}", e);
    }

    app.close().await?;
    println!("Steward stopped.");
    Ok(())
}

/// Chat on stdin/stdout
pub async fn handle_chat(config: Config, user: String) -> Result<()> {
    let app = App::open(config).await?;
    let chat = LocalChat::new(
        std::sync::Arc::clone(app.orchestrator()),
        UserId::new(user),
        Duration::from_secs(app.config().scheduler.tick_secs),
    );

    println!("Chatting with Steward. Type /help for commands, /quit to leave.");
    chat.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;

    app.close().await
}

/// Send one message and print the reply
pub async fn handle_ask(
    config: Config,
    message: String,
    user: String,
    format: OutputFormat,
) -> Result<()> {
    let app = App::open(config).await?;
    let orchestrator = app.orchestrator();
    let user = UserId::new(user);

    match format {
        OutputFormat::Text => {
            let reply = orchestrator.on_message(&user, &message, Vec::new()).await;
            println!("{}", reply);
        }
        OutputFormat::Json => {
            let output = match orchestrator.builtin_command(&message) {
                Some(text) => json!({ "text": text, "handler": null }),
                None => match orchestrator.submit(user, InboundMessage::new(message)).await {
                    Ok(reply) => serde_json::to_value(&reply)?,
                    Err(e) => json!({ "error": e.user_hint() }),
                },
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    app.close().await
}

/// List registered handlers
pub async fn handle_handlers(config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;
    let registry = build_registry(config, &database)?;
    let infos = registry.list();

    match format {
        OutputFormat::Text => {
            println!("Registered Handlers:");
            println!();
            for info in &infos {
                println!(
                    "  {:<16} v{:<8} {:<9} priority {}",
                    info.name,
                    info.version,
                    if info.enabled { "enabled" } else { "disabled" },
                    info.priority
                );
                if !info.description.is_empty() {
                    println!("    {}", info.description);
                }
                if !info.keywords.is_empty() {
                    println!("    keywords: {}", info.keywords.join(", "));
                }
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "handlers": infos }))?
            );
        }
    }

    database.close().await
}

/// Validate configuration and check the store and providers
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(String, String)> = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration".into(), "Valid".into()));

    if config.core.data_dir.exists() {
        checks.push(("Data directory".into(), "Exists".into()));
    } else {
        checks.push(("Data directory".into(), "Missing".into()));
        issues.push(format!(
            "Data directory does not exist: {:?}",
            config.core.data_dir
        ));
    }

    match Database::new(&config.database_path()).await {
        Ok(database) => {
            match database.ping().await {
                Ok(()) => checks.push(("Database".into(), "OK".into())),
                Err(e) => {
                    checks.push(("Database".into(), "Not answering".into()));
                    issues.push(format!("Database did not answer: {}", e));
                }
            }
            match build_registry(config, &database) {
                Ok(registry) => checks.push((
                    "Handlers".into(),
                    format!("{} registered", registry.iter().count()),
                )),
                Err(e) => {
                    checks.push(("Handlers".into(), "Invalid".into()));
                    issues.push(format!("Handler configuration: {}", e));
                }
            }
            database.close().await.ok();
        }
        Err(e) => {
            checks.push(("Database".into(), "Failed".into()));
            issues.push(format!("Cannot open database: {}", e));
        }
    }

    let (router, _) = llm_reasoning(config);
    let health = router.check_health().await;
    for (provider, healthy) in &health {
        checks.push((
            format!("Provider {}", provider),
            if *healthy { "Available" } else { "Unavailable" }.into(),
        ));
    }
    if !health.iter().any(|(_, healthy)| *healthy) {
        issues.push(
            "No reasoning provider is reachable. Free-form replies will fall back to an apology."
                .to_string(),
        );
    }

    let secrets = SecretManager::new(SERVICE_NAME);
    for key in KNOWN_SECRETS {
        let status = if secrets.has_secret(key) {
            "Configured"
        } else {
            "Not configured"
        };
        checks.push((format!("Secret {}", key), status.into()));
    }
    if config.telegram.enabled && !secrets.has_secret(TELEGRAM_BOT_TOKEN) {
        issues.push(
            "Telegram is enabled but no bot token is set. Run `steward secret set telegram_bot_token`."
                .to_string(),
        );
    }

    match format {
        OutputFormat::Text => {
            println!("Steward Diagnostics");
            println!("===================");
            println!();
            for (check, status) in &checks {
                println!("  {:<28} {}", format!("{}:", check), status);
            }
            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, scrub(issue));
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues.iter().map(|i| scrub(i)).collect::<Vec<_>>(),
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Manage keychain secrets
pub fn handle_secret(action: SecretAction, format: OutputFormat) -> Result<()> {
    let secrets = SecretManager::new(SERVICE_NAME);

    match action {
        SecretAction::Set { key } => {
            ensure_known(&key)?;
            let value = secrets.prompt_for_secret(&key)?;
            secrets.set_secret(&key, &value)?;
            println!("Stored '{}' in the keychain.", key);
        }
        SecretAction::Delete { key } => {
            ensure_known(&key)?;
            secrets.delete_secret(&key)?;
            println!("Deleted '{}' from the keychain.", key);
        }
        SecretAction::Status => {
            let statuses: Vec<(&str, bool)> = KNOWN_SECRETS
                .iter()
                .map(|key| (*key, secrets.has_secret(key)))
                .collect();
            match format {
                OutputFormat::Text => {
                    for (key, present) in &statuses {
                        println!(
                            "  {:<20} {}",
                            key,
                            if *present { "set" } else { "not set" }
                        );
                    }
                }
                OutputFormat::Json => {
                    let output: serde_json::Map<String, serde_json::Value> = statuses
                        .iter()
                        .map(|(key, present)| (key.to_string(), json!(present)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
    }

    Ok(())
}

fn ensure_known(key: &str) -> Result<()> {
    if !KNOWN_SECRETS.contains(&key) {
        bail!(
            "Unknown secret '{}'. Expected one of: {}",
            key,
            KNOWN_SECRETS.join(", ")
        );
    }
    Ok(())
}
