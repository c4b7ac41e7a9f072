//! Answers "what do you know about me" with the facts the context store
//! ranked for this message.

use async_trait::async_trait;
use sdk::handler::{CommandHelp, Handler, HandlerContext, HandlerMetadata, HandlerOutcome};
use sdk::types::InboundMessage;

use crate::registry::tokenize;

pub struct RecallHandler {
    metadata: HandlerMetadata,
}

impl RecallHandler {
    pub fn new() -> Self {
        Self {
            metadata: HandlerMetadata::new("recall")
                .description("Tells you what I remember about you")
                .keywords(&["recall", "what do you know", "remember me", "forget"])
                .priority(10)
                .intents(&["memory", "recall"]),
        }
    }
}

impl Default for RecallHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for RecallHandler {
    fn metadata(&self) -> &HandlerMetadata {
        &self.metadata
    }

    async fn handle(&self, message: &InboundMessage, ctx: &HandlerContext) -> HandlerOutcome {
        if tokenize(&message.text).iter().any(|t| t == "forget") {
            return HandlerOutcome::claimed(
                "What specifically would you like me to forget? You can say things like 'forget my old address'.",
            );
        }

        let memories = ctx.memories();
        if memories.is_empty() {
            return HandlerOutcome::claimed(
                "I don't have anything stored about you yet. Tell me about yourself!",
            );
        }

        let mut reply = String::from("Here's what I remember about you:\n");
        for fact in memories {
            reply.push_str(&format!("\n• {} ({})", fact.text, fact.category));
        }
        HandlerOutcome::Claimed(reply)
    }

    fn commands(&self) -> Vec<CommandHelp> {
        vec![
            CommandHelp::new("what do you know about me", "Show what I remember"),
            CommandHelp::new("remember that ...", "Store something about you"),
            CommandHelp::new("forget ...", "Remove stored information"),
        ]
    }
}
