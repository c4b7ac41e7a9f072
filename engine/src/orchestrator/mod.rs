//! Orchestrator
//!
//! Top-level message pipeline. Each message moves through
//!
//! ```text
//! Received → ContextLoaded → Classified → Routed → HandlerExecuted → Persisted → Responded
//! ```
//!
//! or ends in `Failed`. Only store failures end a message in `Failed`;
//! reasoning trouble degrades the classification and handler faults are
//! absorbed by the router.
//!
//! Messages of one user are serialized by the `Sequencer`; different users
//! run in parallel.

pub mod sequencer;

pub use sequencer::{PendingReply, Sequencer};

use crate::config::Config;
use crate::context::{ContextStore, MemoryBudget};
use crate::dispatch::{RouteOutcome, Router};
use crate::message_bus::{Event, MessageBus};
use crate::registry::HandlerRegistry;
use crate::secrets::scrub;
use chrono::Utc;
use futures::FutureExt;
use sdk::errors::{EngineError, EngineErrorExt};
use sdk::handler::{ContextSummary, ConversationContext, ReasoningHandle};
use sdk::types::{
    Attachment, Classification, ConversationTurn, InboundMessage, Role, ScheduledAction, UserId,
};
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Pipeline stage of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    ContextLoaded,
    Classified,
    Routed,
    HandlerExecuted,
    Persisted,
    Responded,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::ContextLoaded => "context_loaded",
            Stage::Classified => "classified",
            Stage::Routed => "routed",
            Stage::HandlerExecuted => "handler_executed",
            Stage::Persisted => "persisted",
            Stage::Responded => "responded",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts and budgets used by the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub classify_timeout: Duration,
    pub complete_timeout: Duration,
    pub handler_timeout: Duration,
    pub lane_idle_timeout: Duration,
    pub memory_budget: MemoryBudget,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            classify_timeout: Duration::from_secs(5),
            complete_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(10),
            lane_idle_timeout: Duration::from_secs(300),
            memory_budget: MemoryBudget::new(10, 400),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            classify_timeout: config.reasoning.classify_timeout(),
            complete_timeout: config.reasoning.complete_timeout(),
            handler_timeout: config.dispatch.handler_timeout(),
            lane_idle_timeout: config.dispatch.lane_idle_timeout(),
            memory_budget: MemoryBudget::new(
                config.context.memory_max_facts,
                config.context.memory_max_tokens,
            ),
        }
    }
}

/// The reply to one message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub message_id: String,
    pub text: String,
    /// Handler credited with the reply
    pub handler: String,
    pub role: Role,
    pub classification: Classification,
    /// True when no handler answered and the fixed fallback was used
    pub fallback: bool,
    pub faults: usize,
}

/// A store failure and the stage it interrupted
struct Failure {
    stage: Stage,
    error: EngineError,
}

impl Failure {
    fn at(stage: Stage) -> impl FnOnce(EngineError) -> Failure {
        move |error| Failure { stage, error }
    }
}

struct Pipeline {
    registry: Arc<HandlerRegistry>,
    context: Arc<ContextStore>,
    router: Router,
    reasoning: ReasoningHandle,
    bus: MessageBus,
    settings: PipelineSettings,
}

impl Pipeline {
    async fn process(&self, user_id: UserId, message: InboundMessage) -> Result<Reply, EngineError> {
        let message_id = message.id.clone();
        self.bus
            .publish(Event::MessageReceived {
                user_id: user_id.to_string(),
                message_id: message_id.clone(),
            })
            .await;

        match self.run(&user_id, message).await {
            Ok(reply) => {
                self.bus
                    .publish(Event::MessageResponded {
                        user_id: user_id.to_string(),
                        message_id,
                        handler: reply.handler.clone(),
                    })
                    .await;
                Ok(reply)
            }
            Err(Failure { stage, error }) => {
                error!(
                    user = %user_id,
                    message_id = %message_id,
                    stage = %stage,
                    "Message failed: {}",
                    error
                );
                self.bus
                    .publish(Event::MessageFailed {
                        user_id: user_id.to_string(),
                        message_id,
                        stage: stage.to_string(),
                        error: error.to_string(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    async fn run(&self, user_id: &UserId, message: InboundMessage) -> Result<Reply, Failure> {
        let text = message.routing_text();
        debug!(user = %user_id, message_id = %message.id, stage = %Stage::Received, "Processing message");

        // Received → ContextLoaded
        let history = self
            .context
            .window(user_id)
            .await
            .map_err(Failure::at(Stage::Received))?;
        let memories = self
            .context
            .relevant_memories(user_id, &text, self.settings.memory_budget)
            .await
            .map_err(Failure::at(Stage::Received))?;
        let handler_names = self.registry.feature_names();
        debug!(
            stage = %Stage::ContextLoaded,
            turns = history.len(),
            memories = memories.len(),
            "Context loaded"
        );

        // ContextLoaded → Classified
        let summary = ContextSummary {
            history: history.iter().map(|t| (t.role, t.text.clone())).collect(),
            memories: memories.iter().map(|f| f.text.clone()).collect(),
            handlers: handler_names.clone(),
        };
        let classification = self.classify(&message.id, &text, &summary).await;
        debug!(stage = %Stage::Classified, intent = ?classification.intent, "Classified");

        // Classified → Routed
        let chain = self.registry.handlers_for_intent(&text, &classification);
        debug!(stage = %Stage::Routed, chain = chain.len(), "Routed");

        // Routed → HandlerExecuted
        let memory_ids: Vec<i64> = memories.iter().map(|f| f.id).collect();
        let conversation = Arc::new(ConversationContext {
            user_id: user_id.clone(),
            message_id: message.id.clone(),
            history,
            memories,
            classification: classification.clone(),
            handler_names,
        });
        let outcome = self
            .router
            .route(&chain, &message, conversation, &self.reasoning)
            .await;
        self.publish_faults(&outcome).await;
        debug!(stage = %Stage::HandlerExecuted, handler = %outcome.responder, "Handler executed");

        // HandlerExecuted → Persisted
        let reply_text = scrub(&outcome.reply);
        let now = Utc::now();
        let turns = vec![
            ConversationTurn::user(user_id.clone(), text, now),
            ConversationTurn::reply(
                user_id.clone(),
                outcome.role,
                outcome.responder.clone(),
                reply_text.clone(),
                now,
            ),
        ];
        self.context
            .append_turns(user_id, turns)
            .await
            .map_err(Failure::at(Stage::HandlerExecuted))?;
        // The turns are committed and the reply is owed to the user. Fact
        // and recency writes are upserts, so a failure here is only logged.
        let mut remembered = 0;
        for note in &outcome.notes {
            match self.context.remember(user_id, note, now).await {
                Ok(_) => remembered += 1,
                Err(e) => warn!(
                    message_id = %message.id,
                    category = %note.category,
                    "Fact not stored: {}",
                    e
                ),
            }
        }
        if !memory_ids.is_empty() {
            if let Err(e) = self.context.mark_used(user_id, &memory_ids, now).await {
                warn!(message_id = %message.id, "Memory recency not refreshed: {}", e);
            }
        }
        debug!(stage = %Stage::Persisted, notes = remembered, "Persisted");

        // Persisted → Responded
        info!(
            user = %user_id,
            message_id = %message.id,
            handler = %outcome.responder,
            stage = %Stage::Responded,
            "Responded"
        );
        Ok(Reply {
            message_id: message.id,
            text: reply_text,
            handler: outcome.responder,
            role: outcome.role,
            classification,
            fallback: outcome.fallback,
            faults: outcome.faults.len(),
        })
    }

    async fn classify(&self, message_id: &str, text: &str, summary: &ContextSummary) -> Classification {
        let reason = match timeout(
            self.settings.classify_timeout,
            self.reasoning.classify(text, summary),
        )
        .await
        {
            Ok(Ok(classification)) => return classification,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "classification timed out after {}ms",
                self.settings.classify_timeout.as_millis()
            ),
        };

        warn!(message_id = %message_id, "Classification degraded: {}", reason);
        self.bus
            .publish(Event::ClassificationDegraded {
                message_id: message_id.to_string(),
                reason,
            })
            .await;
        Classification::degraded()
    }

    async fn publish_faults(&self, outcome: &RouteOutcome) {
        for fault in &outcome.faults {
            self.bus
                .publish(Event::HandlerFaulted {
                    handler: fault.handler.clone(),
                    message_id: fault.message_id.clone(),
                    reason: fault.reason.clone(),
                })
                .await;
        }
    }
}

/// Turn a submission result into the text shown to the user
pub fn render(result: Result<Reply, EngineError>) -> String {
    match result {
        Ok(reply) => reply.text,
        Err(e) => {
            if !matches!(e, EngineError::Cancelled) {
                warn!("Returning error hint to user: {}", e);
            }
            e.user_hint().to_string()
        }
    }
}

/// Entry point for transports
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    sequencer: Sequencer<Reply>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        context: Arc<ContextStore>,
        reasoning: ReasoningHandle,
        bus: MessageBus,
        settings: PipelineSettings,
    ) -> Self {
        // The catch-all gets the completion deadline plus a margin so it can
        // answer with its own apology before the router gives up on it
        let router = Router::new(settings.handler_timeout)
            .with_catch_all_timeout(settings.complete_timeout + Duration::from_secs(1));
        let idle = settings.lane_idle_timeout;

        let pipeline = Arc::new(Pipeline {
            registry,
            context,
            router,
            reasoning,
            bus,
            settings,
        });

        let worker = Arc::clone(&pipeline);
        let sequencer = Sequencer::new(
            Arc::new(move |user_id, message| {
                let pipeline = Arc::clone(&worker);
                async move { pipeline.process(user_id, message).await }.boxed()
            }),
            idle,
        );

        Self {
            pipeline,
            sequencer,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.pipeline.registry
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.pipeline.context
    }

    pub fn bus(&self) -> &MessageBus {
        &self.pipeline.bus
    }

    /// Queue a message behind the user's earlier messages
    ///
    /// The returned future resolves to the reply, `StoreUnavailable`, or
    /// `Cancelled` if the user disconnected before the message ran.
    pub fn submit(&self, user_id: UserId, message: InboundMessage) -> PendingReply<Reply> {
        self.sequencer.submit(user_id, message)
    }

    /// Transport entry point: always returns one user-facing string
    pub async fn on_message(
        &self,
        user_id: &UserId,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> String {
        if let Some(reply) = self.builtin_command(text) {
            return reply;
        }

        let message = InboundMessage::new(text).with_attachments(attachments);
        render(self.submit(user_id.clone(), message).await)
    }

    /// Answer `/start`, `/help` and `/handlers`; None for anything else
    pub fn builtin_command(&self, text: &str) -> Option<String> {
        let word = text.split_whitespace().next()?;
        if !word.starts_with('/') {
            return None;
        }
        // Telegram appends the bot name in groups: /help@steward_bot
        let command = word.split('@').next().unwrap_or(word).to_lowercase();

        match command.as_str() {
            "/start" => Some(self.start_text()),
            "/help" => Some(self.help_text()),
            "/handlers" => Some(self.handlers_text()),
            _ => None,
        }
    }

    pub fn start_text(&self) -> String {
        "Hi! I'm Steward, your personal assistant. Tell me about yourself, ask me to remind you of things, or just chat. Send /help to see what I can do.".to_string()
    }

    /// Aggregated `commands()` of all enabled handlers
    pub fn help_text(&self) -> String {
        let mut text = String::from("Here's what I can do:\n");
        for command in self.pipeline.registry.commands() {
            text.push_str(&format!("\n• {} - {}", command.usage, command.description));
        }
        text.push_str("\n\n/handlers - list installed handlers\n/help - show this message");
        text
    }

    /// Registry listing with status and priority
    pub fn handlers_text(&self) -> String {
        let mut text = String::from("Installed handlers:\n");
        for info in self.pipeline.registry.list() {
            let status = if info.enabled { "enabled" } else { "disabled" };
            text.push_str(&format!(
                "\n• {} v{} ({}, priority {})",
                info.name, info.version, status, info.priority
            ));
            if !info.description.is_empty() {
                text.push_str(&format!(" - {}", info.description));
            }
        }
        text
    }

    /// Collect periodic actions from every enabled handler
    ///
    /// Called by the transport's timer. A handler that panics or overruns the
    /// handler deadline contributes nothing.
    pub async fn on_schedule(&self) -> Vec<ScheduledAction> {
        let deadline = self.pipeline.settings.handler_timeout;
        let mut actions = Vec::new();

        for registration in self.pipeline.registry.enabled() {
            let call = AssertUnwindSafe(registration.handler().on_schedule()).catch_unwind();
            match timeout(deadline, call).await {
                Ok(Ok(mut produced)) => {
                    for action in &mut produced {
                        action.text = scrub(&action.text);
                    }
                    actions.extend(produced);
                }
                Ok(Err(_)) => {
                    warn!(handler = %registration.name(), "on_schedule panicked");
                }
                Err(_) => {
                    warn!(handler = %registration.name(), "on_schedule timed out");
                }
            }
        }

        if !actions.is_empty() {
            debug!(count = actions.len(), "Scheduled actions ready");
        }
        actions
    }

    /// Drop the user's pending messages and cached window
    pub fn disconnect(&self, user_id: &UserId) -> bool {
        self.pipeline.context.evict(user_id);
        self.sequencer.disconnect(user_id)
    }

    pub fn active_lanes(&self) -> usize {
        self.sequencer.active_lanes()
    }

    /// Stop accepting queued work and shut handlers down
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.sequencer.shutdown();
        self.pipeline.registry.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::message_bus::EventType;
    use crate::store::{SqliteStore, Store};
    use async_trait::async_trait;
    use sdk::handler::ReasoningService;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl ReasoningService for Echo {
        async fn classify(
            &self,
            _text: &str,
            _summary: &ContextSummary,
        ) -> Result<Classification, EngineError> {
            Err(EngineError::ReasoningDegraded("offline".to_string()))
        }

        async fn complete(&self, text: &str, summary: &ContextSummary) -> Result<String, EngineError> {
            Ok(format!("echo: {} ({} turns)", text, summary.history.len()))
        }
    }

    async fn orchestrator() -> (TempDir, Orchestrator) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("steward.db"))
            .await
            .unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(db));
        let context = Arc::new(ContextStore::new(store, 10));
        let registry = HandlerRegistry::builder().build();
        let orchestrator = Orchestrator::new(
            registry,
            context,
            ReasoningHandle::new(Arc::new(Echo)),
            MessageBus::new(),
            PipelineSettings::default(),
        );
        (temp_dir, orchestrator)
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::ContextLoaded.as_str(), "context_loaded");
        assert_eq!(Stage::HandlerExecuted.to_string(), "handler_executed");
    }

    #[tokio::test]
    async fn test_builtin_commands() {
        let (_dir, orchestrator) = orchestrator().await;

        assert!(orchestrator.builtin_command("/start").is_some());
        let help = orchestrator.builtin_command("/help@steward_bot").unwrap();
        assert!(help.contains("anything!"));
        let handlers = orchestrator.builtin_command("/handlers").unwrap();
        assert!(handlers.contains("conversation"));
        assert!(handlers.contains("memory-capture"));
        assert!(orchestrator.builtin_command("/unknown").is_none());
        assert!(orchestrator.builtin_command("hello").is_none());
    }

    #[tokio::test]
    async fn test_message_is_answered_and_persisted() {
        let (_dir, orchestrator) = orchestrator().await;
        let mut degraded = orchestrator
            .bus()
            .subscribe(EventType::ClassificationDegraded)
            .await;
        let user = UserId::new("42");

        let reply = orchestrator
            .submit(user.clone(), InboundMessage::new("hello"))
            .await
            .unwrap();
        assert_eq!(reply.text, "echo: hello (0 turns)");
        assert_eq!(reply.handler, "conversation");
        assert_eq!(reply.role, Role::Agent);
        assert!(reply.classification.degraded);
        assert!(!reply.fallback);
        assert!(degraded.try_recv().is_ok());

        let second = orchestrator.on_message(&user, "again", Vec::new()).await;
        assert_eq!(second, "echo: again (2 turns)");

        let window = orchestrator.context().window(&user).await.unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].role, Role::User);
        assert_eq!(window[1].handler_name.as_deref(), Some("conversation"));
    }

    #[tokio::test]
    async fn test_disclosure_is_remembered() {
        let (_dir, orchestrator) = orchestrator().await;
        let user = UserId::new("7");

        orchestrator
            .on_message(&user, "my name is Ada and I like tea", Vec::new())
            .await;

        let facts = orchestrator
            .context()
            .relevant_memories(&user, "name", MemoryBudget::facts(5))
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].text.contains("Ada"));
    }

    #[test]
    fn test_render_hides_error_detail() {
        let text = render(Err(EngineError::StoreUnavailable(
            "sqlite: /home/me/.steward/steward.db locked".to_string(),
        )));
        assert!(!text.contains("sqlite"));
    }
}
