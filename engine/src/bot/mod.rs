//! Transports that feed user messages to the orchestrator

pub mod chat;
pub mod telegram;

pub use chat::LocalChat;
pub use telegram::TelegramBot;
