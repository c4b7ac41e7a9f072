//! Notes self-disclosed facts ("my name is ...", "i live ...") as long-term
//! memory. Runs on every message and never claims it.

use super::MEMORY_CAPTURE;
use crate::registry::{contains_phrase, tokenize};
use async_trait::async_trait;
use sdk::handler::{Handler, HandlerContext, HandlerMetadata, HandlerOutcome};
use sdk::types::{FactNote, Importance, InboundMessage};
use tracing::debug;

/// Phrases that mark a message as a statement about the user
const DISCLOSURE_PHRASES: &[&str] = &[
    "my name is",
    "i live",
    "i work",
    "my favorite",
    "my favourite",
    "i like",
    "i prefer",
    "i hate",
    "remember that",
];

/// Category keywords, checked in order; a token matches when it starts with
/// the keyword
const CATEGORIES: &[(&str, &[&str])] = &[
    ("personal", &["name", "birthday", "age", "born"]),
    ("work", &["work", "job", "career", "office", "colleague", "boss"]),
    (
        "family",
        &["mom", "dad", "mother", "father", "sister", "brother", "family", "wife", "husband"],
    ),
    ("health", &["health", "doctor", "medicine", "symptom", "allerg"]),
    ("preferences", &["favorite", "favourite", "like", "prefer", "love", "hate", "enjoy"]),
    ("location", &["live", "address", "home", "apartment", "house"]),
];

pub struct MemoryCaptureHandler {
    metadata: HandlerMetadata,
    phrases: Vec<Vec<String>>,
}

impl MemoryCaptureHandler {
    pub fn new() -> Self {
        Self {
            metadata: HandlerMetadata::new(MEMORY_CAPTURE)
                .description("Remembers what you tell me about yourself")
                .priority(i32::MAX),
            phrases: DISCLOSURE_PHRASES.iter().map(|p| tokenize(p)).collect(),
        }
    }

    /// The fact a message discloses, if any
    pub fn extract(&self, text: &str) -> Option<FactNote> {
        let tokens = tokenize(text);
        if !self.phrases.iter().any(|p| contains_phrase(&tokens, p)) {
            return None;
        }

        let explicit = contains_phrase(&tokens, &["remember".to_string(), "that".to_string()]);
        let fact = strip_request(text);
        if fact.is_empty() {
            return None;
        }

        let category = categorize(&tokenize(&fact));
        let importance = match category {
            "health" => Importance::High,
            _ if explicit => Importance::High,
            _ => Importance::Normal,
        };

        Some(FactNote::new(category, fact, importance))
    }
}

impl Default for MemoryCaptureHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop a leading "remember that" and trailing punctuation
fn strip_request(text: &str) -> String {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    let body = ["please remember that ", "remember that "]
        .iter()
        .find(|prefix| lower.starts_with(*prefix))
        .and_then(|prefix| trimmed.get(prefix.len()..))
        .unwrap_or(trimmed);

    body.trim()
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'))
        .trim()
        .to_string()
}

fn categorize(tokens: &[String]) -> &'static str {
    CATEGORIES
        .iter()
        .find(|(_, keywords)| {
            tokens
                .iter()
                .any(|token| keywords.iter().any(|k| token.starts_with(k)))
        })
        .map(|(category, _)| *category)
        .unwrap_or("general")
}

#[async_trait]
impl Handler for MemoryCaptureHandler {
    fn metadata(&self) -> &HandlerMetadata {
        &self.metadata
    }

    async fn handle(&self, message: &InboundMessage, ctx: &HandlerContext) -> HandlerOutcome {
        if let Some(note) = self.extract(&message.text) {
            debug!(category = %note.category, "Noted fact");
            ctx.remember(note);
        }
        HandlerOutcome::Declined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_categorized_facts() {
        let handler = MemoryCaptureHandler::new();

        let name = handler.extract("My name is Sam.").unwrap();
        assert_eq!(name.category, "personal");
        assert_eq!(name.text, "My name is Sam");

        let work = handler.extract("I work at a bakery in Porto").unwrap();
        assert_eq!(work.category, "work");

        let taste = handler.extract("i like jazz").unwrap();
        assert_eq!(taste.category, "preferences");
        assert_eq!(taste.importance, Importance::Normal);
    }

    #[test]
    fn test_explicit_request_is_high_importance() {
        let handler = MemoryCaptureHandler::new();
        let note = handler
            .extract("Remember that my sister lives in Lisbon!")
            .unwrap();

        assert_eq!(note.text, "my sister lives in Lisbon");
        assert_eq!(note.category, "family");
        assert_eq!(note.importance, Importance::High);
    }

    #[test]
    fn test_ignores_ordinary_messages() {
        let handler = MemoryCaptureHandler::new();
        assert!(handler.extract("hello there").is_none());
        assert!(handler.extract("what time is it").is_none());
        // "like" only counts after "i"
        assert!(handler.extract("looks like rain").is_none());
    }
}
