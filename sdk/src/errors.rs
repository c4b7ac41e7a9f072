//! Error types and handling
//!
//! This module provides the error types used throughout the Steward engine.
//! All errors implement the `EngineErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Propagation
//!
//! Only `StoreUnavailable` and startup configuration errors ever cross the
//! orchestrator boundary. Handler faults and reasoning degradation are absorbed
//! inside the pipeline and never reach the transport as failures.
//!
//! # Security
//!
//! The hint returned by `user_hint` is the only text a transport may show to
//! the end user. It never contains internal error detail.

use thiserror::Error;

/// Trait for Steward error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// secrets, file paths, or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried on a later message. Non-recoverable
    /// errors are startup-time problems that require fixing the configuration.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Store**: the durable store could not be reached (fatal per message)
/// - **Reasoning**: the reasoning service timed out or failed (never fatal)
/// - **Handler**: a feature handler faulted (isolated, converted to a decline)
/// - **Startup**: configuration and registration errors (fatal at init)
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EngineErrorExt};
///
/// let error = EngineError::StoreUnavailable("connection refused".into());
/// assert!(!error.user_hint().contains("connection refused"));
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::DuplicateHandlerName("reminders".into());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Registry errors
    #[error("Duplicate handler name: {0}")]
    DuplicateHandlerName(String),

    #[error("Unknown handler in configuration: {0}")]
    UnknownHandler(String),

    // Store errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Reasoning service errors
    #[error("Reasoning service degraded: {0}")]
    ReasoningDegraded(String),

    // Handler errors
    #[error("Handler '{handler}' faulted on message {message_id}: {reason}")]
    HandlerFault {
        handler: String,
        message_id: String,
        reason: String,
    },

    // Pipeline errors
    #[error("Message processing was cancelled")]
    Cancelled,

    // Keyring errors
    #[error("Keyring error: {0}")]
    KeyringError(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Startup errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::DuplicateHandlerName(_) => "Two handlers share a name. Check your handler setup",
            Self::UnknownHandler(_) => "Configuration names a handler that is not installed",

            // Store errors
            Self::StoreUnavailable(_) => {
                "Sorry, I couldn't reach my memory just now. Please try again in a moment."
            }

            // Reasoning errors
            Self::ReasoningDegraded(_) => {
                "I'm having trouble thinking that through right now. Please try again."
            }

            // Handler errors
            Self::HandlerFault { .. } => "Something went wrong with that feature",

            Self::Cancelled => "That message was cancelled before I could answer it.",

            Self::KeyringError(_) => "Failed to access secure storage. Check system keychain",
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::DuplicateHandlerName(_) | Self::UnknownHandler(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_hint_hides_detail() {
        let error = EngineError::StoreUnavailable("database is locked at /var/db".to_string());
        assert!(!error.user_hint().contains("/var/db"));
        assert!(error.to_string().contains("database is locked"));
    }

    #[test]
    fn test_startup_errors_are_fatal() {
        assert!(!EngineError::Config("bad".into()).is_recoverable());
        assert!(!EngineError::DuplicateHandlerName("x".into()).is_recoverable());
        assert!(!EngineError::UnknownHandler("x".into()).is_recoverable());
    }

    #[test]
    fn test_runtime_errors_are_recoverable() {
        assert!(EngineError::StoreUnavailable("down".into()).is_recoverable());
        assert!(EngineError::ReasoningDegraded("timeout".into()).is_recoverable());
        assert!(EngineError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_handler_fault_display() {
        let error = EngineError::HandlerFault {
            handler: "reminders".to_string(),
            message_id: "m-1".to_string(),
            reason: "panicked".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("reminders"));
        assert!(text.contains("m-1"));
    }
}
