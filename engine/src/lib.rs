//! Steward Engine Library
//!
//! Message orchestration for a personal assistant: a frozen registry of
//! feature handlers, a per-user context store, a priority router, and an
//! orchestrator that keeps each user's messages in order. Used by the
//! `steward` binary and the integration tests.

/// Configuration management module
pub mod config;

/// Secret management module
pub mod secrets;

/// Database persistence module
pub mod db;

/// Store seam between the context store and the database
pub mod store;

/// Conversation windows and long-term memory ranking
pub mod context;

/// Pipeline event bus
pub mod message_bus;

/// LLM provider abstraction layer
pub mod llm;

/// Handler registry and keyword matching
pub mod registry;

/// Handlers shipped with the engine
pub mod builtins;

/// Priority routing with fault isolation
pub mod dispatch;

/// Message pipeline and per-user sequencing
pub mod orchestrator;

/// Telegram and terminal transports
pub mod bot;

/// Engine assembly
pub mod app;

/// Logging setup
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// CLI command handlers
pub mod commands;
