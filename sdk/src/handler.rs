//! Handler trait and context types
//!
//! This module defines the `Handler` trait that every feature module implements,
//! and the `HandlerContext` that gives a handler controlled access to the
//! conversation, long-term memory, and the reasoning service.

use crate::errors::EngineError;
use crate::types::{
    Classification, ConversationTurn, FactNote, InboundMessage, MemoryFact, Role,
    ScheduledAction, UserId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Static description of a handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Trigger keywords, matched against the tokenized lowercase message
    pub keywords: Vec<String>,
    /// Higher runs earlier
    pub priority: i32,
    /// Intent labels this handler serves when the classifier is confident
    pub intents: Vec<String>,
}

impl HandlerMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: "1.0.0".to_string(),
            keywords: Vec::new(),
            priority: 0,
            intents: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn intents(mut self, intents: &[&str]) -> Self {
        self.intents = intents.iter().map(|i| i.to_string()).collect();
        self
    }
}

/// Result of a single `Handler::handle` invocation
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The handler produced the user-visible reply
    Claimed(String),

    /// The handler does not respond to this message; routing continues
    Declined,

    /// The handler failed; routing continues and the fault is recorded
    Faulted(String),
}

impl HandlerOutcome {
    pub fn claimed(text: impl Into<String>) -> Self {
        Self::Claimed(text.into())
    }

    pub fn faulted(reason: impl Into<String>) -> Self {
        Self::Faulted(reason.into())
    }
}

impl<E: std::fmt::Display> From<Result<String, E>> for HandlerOutcome {
    fn from(result: Result<String, E>) -> Self {
        match result {
            Ok(text) => Self::Claimed(text),
            Err(e) => Self::Faulted(e.to_string()),
        }
    }
}

/// A command advertised in the help listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandHelp {
    pub usage: String,
    pub description: String,
}

impl CommandHelp {
    pub fn new(usage: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            usage: usage.into(),
            description: description.into(),
        }
    }
}

/// Trait that all feature handlers must implement
#[async_trait]
pub trait Handler: Send + Sync {
    /// Static metadata (name, keywords, default priority)
    fn metadata(&self) -> &HandlerMetadata;

    /// Returns the name of the handler
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Pure, non-blocking routing predicate consulted in addition to keywords
    fn identify(&self, _message: &str) -> bool {
        false
    }

    /// Handle a message routed to this handler
    async fn handle(&self, message: &InboundMessage, ctx: &HandlerContext) -> HandlerOutcome;

    /// Periodic work triggered by the transport's scheduler
    async fn on_schedule(&self) -> Vec<ScheduledAction> {
        Vec::new()
    }

    /// Commands shown in the help listing
    fn commands(&self) -> Vec<CommandHelp> {
        Vec::new()
    }

    /// Called once at startup after registration
    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called once when the engine stops
    async fn shutdown(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Compact view of the conversation handed to the reasoning service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextSummary {
    /// Recent turns, oldest first
    pub history: Vec<(Role, String)>,
    /// Relevant long-term facts, most relevant first
    pub memories: Vec<String>,
    /// Names of the registered handlers
    pub handlers: Vec<String>,
}

/// Trait for the reasoning service (to be implemented by engine)
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Classify the intent of a message
    async fn classify(
        &self,
        text: &str,
        summary: &ContextSummary,
    ) -> Result<Classification, EngineError>;

    /// Produce a free-text reply to a message
    async fn complete(&self, text: &str, summary: &ContextSummary) -> Result<String, EngineError>;
}

/// Handle for reasoning operations
#[derive(Clone)]
pub struct ReasoningHandle {
    inner: Arc<dyn ReasoningService>,
}

impl ReasoningHandle {
    /// Create a new ReasoningHandle with the given implementation
    pub fn new(inner: Arc<dyn ReasoningService>) -> Self {
        Self { inner }
    }

    pub async fn classify(
        &self,
        text: &str,
        summary: &ContextSummary,
    ) -> Result<Classification, EngineError> {
        self.inner.classify(text, summary).await
    }

    pub async fn complete(&self, text: &str, summary: &ContextSummary) -> Result<String, EngineError> {
        self.inner.complete(text, summary).await
    }
}

/// Per-message context shared by every handler in the chain
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub user_id: UserId,
    pub message_id: String,
    /// Context window, oldest first
    pub history: Vec<ConversationTurn>,
    /// Relevant memories, most relevant first
    pub memories: Vec<MemoryFact>,
    pub classification: Classification,
    pub handler_names: Vec<String>,
}

impl ConversationContext {
    /// Build the summary passed to the reasoning service
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            history: self
                .history
                .iter()
                .map(|turn| (turn.role, turn.text.clone()))
                .collect(),
            memories: self.memories.iter().map(|fact| fact.text.clone()).collect(),
            handlers: self.handler_names.clone(),
        }
    }
}

/// Context provided to a single handler invocation.
///
/// The conversation is shared by the whole chain; settings and noted facts
/// belong to this invocation only.
pub struct HandlerContext {
    conversation: Arc<ConversationContext>,
    settings: Arc<serde_json::Value>,
    reasoning: ReasoningHandle,
    notes: Mutex<Vec<FactNote>>,
}

impl HandlerContext {
    pub fn new(
        conversation: Arc<ConversationContext>,
        settings: Arc<serde_json::Value>,
        reasoning: ReasoningHandle,
    ) -> Self {
        Self {
            conversation,
            settings,
            reasoning,
            notes: Mutex::new(Vec::new()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.conversation.user_id
    }

    pub fn message_id(&self) -> &str {
        &self.conversation.message_id
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.conversation.history
    }

    pub fn memories(&self) -> &[MemoryFact] {
        &self.conversation.memories
    }

    pub fn classification(&self) -> &Classification {
        &self.conversation.classification
    }

    pub fn conversation(&self) -> &ConversationContext {
        &self.conversation
    }

    pub fn reasoning(&self) -> &ReasoningHandle {
        &self.reasoning
    }

    /// Get a handler setting by key
    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }

    /// Get a handler setting as a string
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key).and_then(|v| v.as_str())
    }

    /// Get a handler setting as an integer
    pub fn setting_i64(&self, key: &str) -> Option<i64> {
        self.setting(key).and_then(|v| v.as_i64())
    }

    /// Ask the orchestrator to upsert a long-term fact after the exchange
    pub fn remember(&self, note: FactNote) {
        self.notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(note);
    }

    /// Drain the facts noted during this invocation
    pub fn take_notes(&self) -> Vec<FactNote> {
        std::mem::take(
            &mut *self
                .notes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Importance;
    use chrono::Utc;

    struct EchoReasoner;

    #[async_trait]
    impl ReasoningService for EchoReasoner {
        async fn classify(
            &self,
            _text: &str,
            _summary: &ContextSummary,
        ) -> Result<Classification, EngineError> {
            Ok(Classification::new("general", 0.5))
        }

        async fn complete(
            &self,
            text: &str,
            summary: &ContextSummary,
        ) -> Result<String, EngineError> {
            Ok(format!("{} ({} turns)", text, summary.history.len()))
        }
    }

    fn context(settings: serde_json::Value) -> HandlerContext {
        let user = UserId::new("u1");
        let conversation = ConversationContext {
            user_id: user.clone(),
            message_id: "m1".to_string(),
            history: vec![ConversationTurn::user(user, "earlier", Utc::now())],
            memories: Vec::new(),
            classification: Classification::degraded(),
            handler_names: vec!["conversation".to_string()],
        };
        HandlerContext::new(
            Arc::new(conversation),
            Arc::new(settings),
            ReasoningHandle::new(Arc::new(EchoReasoner)),
        )
    }

    #[test]
    fn test_metadata_builder() {
        let metadata = HandlerMetadata::new("reminders")
            .description("Reminders")
            .keywords(&["remind", "don't forget"])
            .priority(20)
            .intents(&["reminder"]);

        assert_eq!(metadata.name, "reminders");
        assert_eq!(metadata.keywords.len(), 2);
        assert_eq!(metadata.priority, 20);
        assert_eq!(metadata.version, "1.0.0");
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<String, EngineError> = Ok("done".to_string());
        assert_eq!(HandlerOutcome::from(ok), HandlerOutcome::Claimed("done".into()));

        let err: Result<String, EngineError> = Err(EngineError::Network("down".into()));
        assert!(matches!(HandlerOutcome::from(err), HandlerOutcome::Faulted(_)));
    }

    #[test]
    fn test_notes_are_drained() {
        let ctx = context(serde_json::Value::Null);
        ctx.remember(FactNote::new("personal", "name is Sam", Importance::High));
        ctx.remember(FactNote::new("work", "works at a bakery", Importance::Normal));

        assert_eq!(ctx.take_notes().len(), 2);
        assert!(ctx.take_notes().is_empty());
    }

    #[test]
    fn test_settings_access() {
        let ctx = context(serde_json::json!({"timezone": "UTC", "lead_minutes": 15}));
        assert_eq!(ctx.setting_str("timezone"), Some("UTC"));
        assert_eq!(ctx.setting_i64("lead_minutes"), Some(15));
        assert_eq!(ctx.setting_str("missing"), None);
    }

    #[tokio::test]
    async fn test_reasoning_handle_delegates() {
        let ctx = context(serde_json::Value::Null);
        let summary = ctx.conversation().summary();
        let reply = ctx.reasoning().complete("hi", &summary).await.unwrap();
        assert_eq!(reply, "hi (1 turns)");
    }
}
