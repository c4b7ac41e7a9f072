//! LLM Provider Abstraction Layer
//!
//! Common interface over the hosted and local model providers (Ollama, OpenAI,
//! Anthropic). The `LLMRouter` tries providers in preference order and the
//! `LlmReasoner` turns raw completions into the engine's reasoning service.

use async_trait::async_trait;
use sdk::types::Classification;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod reasoner;
pub mod router;

pub use reasoner::LlmReasoner;
pub use router::LLMRouter;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Message in a prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// LLM Provider trait that all providers must implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "ollama", "openai", "anthropic")
    fn name(&self) -> &str;

    /// Returns true if this is a local provider (e.g., Ollama)
    fn is_local(&self) -> bool;

    /// Estimated cost in USD for `tokens` tokens; local providers return 0.0
    fn estimated_cost(&self, tokens: usize) -> f64;

    /// Generate a text completion for the prompt
    async fn generate(&self, messages: &[Message]) -> Result<String>;

    /// Check if the provider is currently healthy and available
    async fn check_health(&self) -> bool {
        true
    }
}

/// Map an HTTP error status to an `LLMError`
pub(crate) fn status_error(status: reqwest::StatusCode, body: String) -> LLMError {
    match status.as_u16() {
        401 | 403 => LLMError::AuthenticationFailed(body),
        429 => LLMError::RateLimitExceeded,
        500..=599 => LLMError::ProviderUnavailable(format!("{}: {}", status, body)),
        _ => LLMError::InvalidRequest(body),
    }
}

/// Map a transport error to an `LLMError`
pub(crate) fn transport_error(error: reqwest::Error) -> LLMError {
    if error.is_timeout() {
        LLMError::Timeout
    } else if error.is_connect() {
        LLMError::ProviderUnavailable(error.to_string())
    } else {
        LLMError::NetworkError(error.to_string())
    }
}

/// Parse a classification reply.
///
/// Accepts raw JSON, JSON inside a markdown fence, or a JSON object embedded
/// in prose. The intent is read from `intent` (or `primary_intent`) and
/// lowercased; a missing confidence counts as 0.5.
pub fn parse_classification(content: &str) -> Option<Classification> {
    let trimmed = content.trim();

    let candidates = [
        Some(trimmed),
        extract_fenced_json(trimmed).map(str::trim),
        trimmed.find('{').and_then(|pos| extract_balanced_json(&trimmed[pos..])),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(try_parse_classification_json)
}

fn try_parse_classification_json(s: &str) -> Option<Classification> {
    let json: serde_json::Value = serde_json::from_str(s).ok()?;
    let intent = json
        .get("intent")
        .or_else(|| json.get("primary_intent"))?
        .as_str()?
        .trim()
        .to_lowercase();
    if intent.is_empty() {
        return None;
    }
    let confidence = json
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.5);
    Some(Classification::new(intent, confidence))
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start = fence_start + 3 + after_opening.find('\n')? + 1;
    let body_end = body_start + content[body_start..].find("```")?;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
