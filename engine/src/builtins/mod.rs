//! Handlers shipped with the engine
//!
//! `memory-capture` and `conversation` are reserved and installed by the
//! registry itself. `reminders` and `recall` are ordinary feature handlers
//! registered at startup.

pub mod conversation;
pub mod memory_capture;
pub mod recall;
pub mod reminders;

pub use conversation::ConversationHandler;
pub use memory_capture::MemoryCaptureHandler;
pub use recall::RecallHandler;
pub use reminders::ReminderHandler;

/// Reserved name of the handler that runs first on every message
pub const MEMORY_CAPTURE: &str = "memory-capture";

/// Reserved name of the catch-all handler
pub const CONVERSATION: &str = "conversation";
