//! Reasoning service backed by the LLM router
//!
//! Builds prompts from the context summary. Deadlines are imposed by the
//! caller; any provider failure surfaces as `ReasoningDegraded`.

use super::{parse_classification, LLMRouter, Message};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::handler::{ContextSummary, ReasoningService};
use sdk::types::{Classification, Role};
use std::sync::Arc;

const PERSONA: &str = "You are Steward, a concise and friendly personal assistant. \
Answer in plain text. Use what you know about the user when it helps, and never \
invent facts about them.";

/// `ReasoningService` implementation over an `LLMRouter`
pub struct LlmReasoner {
    router: Arc<LLMRouter>,
}

impl LlmReasoner {
    pub fn new(router: Arc<LLMRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &LLMRouter {
        &self.router
    }
}

fn classify_prompt(summary: &ContextSummary) -> String {
    let labels = if summary.handlers.is_empty() {
        "general".to_string()
    } else {
        summary.handlers.join(", ")
    };
    format!(
        "Classify the intent of the user's message. Known handlers: {}. \
         Reply with JSON only: {{\"intent\": \"<one lowercase word>\", \"confidence\": <0.0-1.0>}}. \
         Use \"general\" when nothing specific applies.",
        labels
    )
}

fn completion_messages(text: &str, summary: &ContextSummary) -> Vec<Message> {
    let mut system = PERSONA.to_string();
    if !summary.memories.is_empty() {
        system.push_str("\n\nWhat you know about the user:");
        for fact in &summary.memories {
            system.push_str("\n- ");
            system.push_str(fact);
        }
    }
    if !summary.handlers.is_empty() {
        system.push_str("\n\nAvailable features: ");
        system.push_str(&summary.handlers.join(", "));
    }

    let mut messages = vec![Message::system(system)];
    for (role, content) in &summary.history {
        messages.push(match role {
            Role::User => Message::user(content.as_str()),
            Role::Agent | Role::Handler => Message::assistant(content.as_str()),
        });
    }
    messages.push(Message::user(text));
    messages
}

#[async_trait]
impl ReasoningService for LlmReasoner {
    async fn classify(
        &self,
        text: &str,
        summary: &ContextSummary,
    ) -> Result<Classification, EngineError> {
        let messages = [Message::system(classify_prompt(summary)), Message::user(text)];
        let (reply, provider) = self
            .router
            .call(&messages)
            .await
            .map_err(|e| EngineError::ReasoningDegraded(e.to_string()))?;

        parse_classification(&reply).ok_or_else(|| {
            EngineError::ReasoningDegraded(format!(
                "Unparseable classification from {}",
                provider
            ))
        })
    }

    async fn complete(&self, text: &str, summary: &ContextSummary) -> Result<String, EngineError> {
        let (reply, provider) = self
            .router
            .call(&completion_messages(text, summary))
            .await
            .map_err(|e| EngineError::ReasoningDegraded(e.to_string()))?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(EngineError::ReasoningDegraded(format!(
                "Empty completion from {}",
                provider
            )));
        }
        Ok(reply.to_string())
    }
}
