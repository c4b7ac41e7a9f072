//! Catch-all handler: answers with a free-text completion from the reasoning
//! service. Always claims.

use super::CONVERSATION;
use async_trait::async_trait;
use sdk::handler::{CommandHelp, Handler, HandlerContext, HandlerMetadata, HandlerOutcome};
use sdk::types::InboundMessage;
use std::time::Duration;
use tracing::warn;

/// Reply used when the reasoning service cannot answer
pub const APOLOGY: &str =
    "I'm having trouble processing that right now. Could you try rephrasing?";

pub struct ConversationHandler {
    metadata: HandlerMetadata,
    timeout: Duration,
}

impl ConversationHandler {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Bound the completion call by `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            metadata: HandlerMetadata::new(CONVERSATION)
                .description("General conversation and questions")
                .priority(i32::MIN),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ConversationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ConversationHandler {
    fn metadata(&self) -> &HandlerMetadata {
        &self.metadata
    }

    fn identify(&self, _message: &str) -> bool {
        true
    }

    async fn handle(&self, message: &InboundMessage, ctx: &HandlerContext) -> HandlerOutcome {
        let summary = ctx.conversation().summary();
        let text = message.routing_text();
        let completion = ctx.reasoning().complete(&text, &summary);

        match tokio::time::timeout(self.timeout, completion).await {
            Ok(Ok(text)) if !text.trim().is_empty() => HandlerOutcome::Claimed(text),
            Ok(Ok(_)) => HandlerOutcome::claimed(APOLOGY),
            Ok(Err(e)) => {
                warn!(error = %e, "Completion failed");
                HandlerOutcome::claimed(APOLOGY)
            }
            Err(_) => {
                warn!("Completion timed out after {:?}", self.timeout);
                HandlerOutcome::claimed(APOLOGY)
            }
        }
    }

    fn commands(&self) -> Vec<CommandHelp> {
        vec![CommandHelp::new(
            "anything!",
            "I can handle general conversation and questions",
        )]
    }
}
