//! Assembles the engine from a loaded `Config`

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::builtins::{RecallHandler, ReminderHandler};
use crate::config::Config;
use crate::context::ContextStore;
use crate::db::Database;
use crate::llm::reasoner::LlmReasoner;
use crate::llm::router::LLMRouter;
use crate::message_bus::MessageBus;
use crate::orchestrator::{Orchestrator, PipelineSettings};
use crate::registry::HandlerRegistry;
use crate::secrets::{SecretCache, SecretManager, SERVICE_NAME};
use crate::store::{SqliteStore, Store};
use sdk::errors::EngineError;
use sdk::handler::ReasoningHandle;

/// A running engine: database, handlers and orchestrator
pub struct App {
    config: Config,
    database: Database,
    orchestrator: Arc<Orchestrator>,
}

/// Feature handlers shipped with the engine, with `[[handlers]]` applied
pub fn build_registry(
    config: &Config,
    database: &Database,
) -> Result<Arc<HandlerRegistry>, EngineError> {
    let registry = HandlerRegistry::builder()
        .completion_timeout(config.reasoning.complete_timeout())
        .intent_threshold(config.dispatch.intent_confidence_threshold)
        .with(Arc::new(ReminderHandler::new(database.reminders())))?
        .with(Arc::new(RecallHandler::new()))?
        .configure(&config.handlers)?
        .build();
    Ok(registry)
}

/// Reasoning backed by the configured LLM providers
pub fn llm_reasoning(config: &Config) -> (Arc<LLMRouter>, ReasoningHandle) {
    let secrets = SecretCache::new(Arc::new(SecretManager::new(SERVICE_NAME)));
    let router = Arc::new(LLMRouter::from_config(&config.reasoning, &secrets));
    let reasoning = ReasoningHandle::new(Arc::new(LlmReasoner::new(Arc::clone(&router))));
    (router, reasoning)
}

impl App {
    /// Open the database and wire the engine to the configured providers
    pub async fn open(config: Config) -> Result<Self> {
        let database = Database::new(&config.database_path())
            .await
            .context("Failed to open database")?;
        let (router, reasoning) = llm_reasoning(&config);
        info!(providers = ?router.provider_names(), "Reasoning providers registered");

        Ok(Self::assemble(config, database, reasoning).await?)
    }

    /// Wire the engine around an existing database and reasoning service
    pub async fn assemble(
        config: Config,
        database: Database,
        reasoning: ReasoningHandle,
    ) -> Result<Self, EngineError> {
        let registry = build_registry(&config, &database)?;
        for (name, error) in registry.initialize_all().await {
            warn!(handler = %name, "Continuing without a clean start: {}", error);
        }

        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(database.clone()));
        let context = Arc::new(ContextStore::new(store, config.context.window_size));
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            context,
            reasoning,
            MessageBus::new(),
            PipelineSettings::from_config(&config),
        ));

        info!(
            handlers = orchestrator.registry().iter().count(),
            "Steward assembled"
        );
        Ok(Self {
            config,
            database,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stop handlers and flush the database
    pub async fn close(self) -> Result<()> {
        self.orchestrator.shutdown().await;
        self.database.close().await
    }
}
