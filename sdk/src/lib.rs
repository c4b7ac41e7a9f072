//! Steward SDK
//!
//! Shared library providing the handler contract, conversation types, and error
//! types. This crate is used by the engine and by every feature handler.

/// Handler trait and context types
pub mod handler;

/// Error types and handling
pub mod errors;

/// Conversation and memory types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, EngineErrorExt};
pub use handler::{
    CommandHelp, ContextSummary, ConversationContext, Handler, HandlerContext, HandlerMetadata,
    HandlerOutcome, ReasoningHandle, ReasoningService,
};
pub use types::{
    Attachment, Classification, ConversationTurn, FactNote, Importance, InboundMessage,
    MemoryFact, Role, ScheduledAction, UserId,
};
