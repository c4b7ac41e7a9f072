//! Router
//!
//! Invokes a handler chain strictly in order and stops at the first handler
//! that claims the message with non-empty text. Every invocation runs under
//! a deadline and with panics caught; a timeout, panic, or `Faulted` outcome
//! counts as a decline and is recorded as a `FaultRecord`.
//!
//! The router always yields exactly one reply. When the catch-all itself
//! fails, a fixed fallback text is used.

use crate::registry::Registration;
use futures::FutureExt;
use sdk::errors::EngineError;
use sdk::handler::{ConversationContext, HandlerContext, HandlerOutcome, ReasoningHandle};
use sdk::types::{FactNote, InboundMessage, Role};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Reply used when no handler, not even the catch-all, produced text
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't come up with an answer to that. Please try again in a moment.";

/// How a handler invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Faulted,
    Panicked,
    TimedOut,
}

/// A handler failure, isolated from the rest of the chain
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    pub handler: String,
    pub message_id: String,
    pub kind: FaultKind,
    pub reason: String,
}

impl From<FaultRecord> for EngineError {
    fn from(fault: FaultRecord) -> Self {
        EngineError::HandlerFault {
            handler: fault.handler,
            message_id: fault.message_id,
            reason: fault.reason,
        }
    }
}

/// Outcome of one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub handler_name: String,
    pub response_text: Option<String>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Everything the orchestrator needs after routing
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub reply: String,
    /// Name of the handler credited with the reply
    pub responder: String,
    /// `Agent` for the catch-all and the fallback, `Handler` otherwise
    pub role: Role,
    /// True when the fixed fallback text was used
    pub fallback: bool,
    /// One entry per invoked handler, in invocation order
    pub results: Vec<DispatchResult>,
    pub faults: Vec<FaultRecord>,
    /// Facts noted by handlers that did not fault
    pub notes: Vec<FactNote>,
}

/// Invokes handler chains
#[derive(Debug, Clone)]
pub struct Router {
    handler_timeout: Duration,
    catch_all_timeout: Duration,
}

impl Router {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handler_timeout,
            catch_all_timeout: handler_timeout,
        }
    }

    /// Deadline for the catch-all, which usually waits on a completion
    pub fn with_catch_all_timeout(mut self, timeout: Duration) -> Self {
        self.catch_all_timeout = timeout;
        self
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    /// Route `message` through `chain`
    pub async fn route(
        &self,
        chain: &[&Registration],
        message: &InboundMessage,
        conversation: Arc<ConversationContext>,
        reasoning: &ReasoningHandle,
    ) -> RouteOutcome {
        let mut results = Vec::with_capacity(chain.len());
        let mut faults = Vec::new();
        let mut notes = Vec::new();

        for registration in chain {
            let ctx = HandlerContext::new(
                Arc::clone(&conversation),
                Arc::clone(registration.settings()),
                reasoning.clone(),
            );
            let deadline = if registration.is_catch_all() {
                self.catch_all_timeout
            } else {
                self.handler_timeout
            };

            let started = Instant::now();
            let outcome = invoke(registration, message, &ctx, deadline).await;
            let elapsed = started.elapsed();

            let claimed = match outcome {
                Invocation::Completed(HandlerOutcome::Claimed(text)) if !text.trim().is_empty() => {
                    notes.extend(ctx.take_notes());
                    results.push(DispatchResult {
                        handler_name: registration.name().to_string(),
                        response_text: Some(text.clone()),
                        error: None,
                        elapsed,
                    });
                    Some(text)
                }
                Invocation::Completed(_) => {
                    notes.extend(ctx.take_notes());
                    results.push(DispatchResult {
                        handler_name: registration.name().to_string(),
                        response_text: None,
                        error: None,
                        elapsed,
                    });
                    None
                }
                Invocation::Failed(kind, reason) => {
                    warn!(
                        handler = %registration.name(),
                        message_id = %message.id,
                        ?kind,
                        "Handler fault: {}",
                        reason
                    );
                    results.push(DispatchResult {
                        handler_name: registration.name().to_string(),
                        response_text: None,
                        error: Some(reason.clone()),
                        elapsed,
                    });
                    faults.push(FaultRecord {
                        handler: registration.name().to_string(),
                        message_id: message.id.clone(),
                        kind,
                        reason,
                    });
                    None
                }
            };

            if let Some(reply) = claimed {
                debug!(handler = %registration.name(), ?elapsed, "Handler claimed message");
                return RouteOutcome {
                    reply,
                    responder: registration.name().to_string(),
                    role: role_for(registration),
                    fallback: false,
                    results,
                    faults,
                    notes,
                };
            }

            if registration.is_catch_all() {
                break;
            }
        }

        let responder = chain
            .iter()
            .rev()
            .find(|r| r.is_catch_all())
            .map(|r| r.name().to_string())
            .unwrap_or_default();
        warn!(message_id = %message.id, "No handler produced a reply; using fallback");

        RouteOutcome {
            reply: FALLBACK_REPLY.to_string(),
            responder,
            role: Role::Agent,
            fallback: true,
            results,
            faults,
            notes,
        }
    }
}

fn role_for(registration: &Registration) -> Role {
    if registration.is_catch_all() {
        Role::Agent
    } else {
        Role::Handler
    }
}

enum Invocation {
    Completed(HandlerOutcome),
    Failed(FaultKind, String),
}

async fn invoke(
    registration: &Registration,
    message: &InboundMessage,
    ctx: &HandlerContext,
    deadline: Duration,
) -> Invocation {
    let call = AssertUnwindSafe(registration.handler().handle(message, ctx)).catch_unwind();

    match timeout(deadline, call).await {
        Ok(Ok(HandlerOutcome::Faulted(reason))) => Invocation::Failed(FaultKind::Faulted, reason),
        Ok(Ok(outcome)) => Invocation::Completed(outcome),
        Ok(Err(panic)) => Invocation::Failed(FaultKind::Panicked, panic_message(panic.as_ref())),
        Err(_) => Invocation::Failed(
            FaultKind::TimedOut,
            format!("timed out after {}ms", deadline.as_millis()),
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", text)
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("panicked: {}", text)
    } else {
        "panicked".to_string()
    }
}
