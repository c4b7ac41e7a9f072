//! Handler Registry
//!
//! Handlers are registered once at startup, adjusted by `[[handlers]]`
//! configuration entries, and frozen into an immutable `HandlerRegistry`
//! shared behind an `Arc`. Reads after `build()` take no locks.
//!
//! Two reserved handlers are always present: memory capture runs first on
//! every message and never claims, the conversation catch-all runs last.

use crate::builtins::{ConversationHandler, MemoryCaptureHandler, CONVERSATION, MEMORY_CAPTURE};
use crate::config::HandlerEntry;
use sdk::errors::EngineError;
use sdk::handler::{CommandHelp, Handler};
use sdk::types::Classification;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default confidence a classification needs before intents are consulted
pub const DEFAULT_INTENT_THRESHOLD: f64 = 0.7;

/// Lowercase word tokens of `text`; apostrophes stay inside words
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
        .map(|token| {
            token
                .trim_matches(|c: char| c == '\'' || c == '\u{2019}')
                .replace('\u{2019}', "'")
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// True if `phrase` occurs in `tokens` as a contiguous run
pub fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty()
        && phrase.len() <= tokens.len()
        && tokens.windows(phrase.len()).any(|window| window == phrase)
}

/// Where a registration sits in every chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// Runs first on every message
    First,
    /// Selected by keywords, `identify`, or intent
    Feature,
    /// Runs last on every message
    CatchAll,
}

/// A handler plus its effective routing data
pub struct Registration {
    handler: Arc<dyn Handler>,
    name: String,
    keywords: Vec<String>,
    phrases: Vec<Vec<String>>,
    intents: Vec<String>,
    priority: i32,
    enabled: bool,
    slot: Slot,
    settings: Arc<serde_json::Value>,
}

impl Registration {
    fn new(handler: Arc<dyn Handler>, slot: Slot) -> Self {
        let metadata = handler.metadata();
        let keywords: Vec<String> = metadata.keywords.iter().map(|k| k.to_lowercase()).collect();
        let phrases = keywords
            .iter()
            .map(|keyword| tokenize(keyword))
            .filter(|phrase| !phrase.is_empty())
            .collect();

        Self {
            name: metadata.name.clone(),
            intents: metadata.intents.iter().map(|i| i.to_lowercase()).collect(),
            priority: metadata.priority,
            enabled: true,
            keywords,
            phrases,
            slot,
            settings: Arc::new(serde_json::Value::Null),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn intents(&self) -> &[String] {
        &self.intents
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn is_catch_all(&self) -> bool {
        self.slot == Slot::CatchAll
    }

    pub fn settings(&self) -> &Arc<serde_json::Value> {
        &self.settings
    }

    /// True if any keyword phrase occurs as contiguous tokens
    fn matches_keywords(&self, tokens: &[String]) -> bool {
        self.phrases
            .iter()
            .any(|phrase| contains_phrase(tokens, phrase))
    }

    /// `identify` is expected to be pure; a panic counts as no match
    fn identifies(&self, text: &str) -> bool {
        catch_unwind(AssertUnwindSafe(|| self.handler.identify(text))).unwrap_or_else(|_| {
            warn!(handler = %self.name, "identify panicked; treating as no match");
            false
        })
    }

    fn describe(&self) -> RegistrationInfo {
        let metadata = self.handler.metadata();
        RegistrationInfo {
            name: self.name.clone(),
            description: metadata.description.clone(),
            version: metadata.version.clone(),
            keywords: self.keywords.clone(),
            intents: self.intents.clone(),
            priority: self.priority,
            enabled: self.enabled,
            slot: self.slot,
        }
    }
}

/// Serializable view of a registration, for listings
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistrationInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub keywords: Vec<String>,
    pub intents: Vec<String>,
    pub priority: i32,
    pub enabled: bool,
    pub slot: Slot,
}

/// Collects handlers before the registry is frozen
pub struct RegistryBuilder {
    first: Registration,
    features: Vec<Registration>,
    catch_all: Registration,
    intent_threshold: f64,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// A builder holding only the reserved handlers
    pub fn new() -> Self {
        Self {
            first: Registration::new(Arc::new(MemoryCaptureHandler::new()), Slot::First),
            features: Vec::new(),
            catch_all: Registration::new(Arc::new(ConversationHandler::new()), Slot::CatchAll),
            intent_threshold: DEFAULT_INTENT_THRESHOLD,
        }
    }

    /// Bound the catch-all's completion call; keeps configured overrides
    /// only if called before `configure`
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.catch_all = Registration::new(
            Arc::new(ConversationHandler::with_timeout(timeout)),
            Slot::CatchAll,
        );
        self
    }

    pub fn intent_threshold(mut self, threshold: f64) -> Self {
        self.intent_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    fn is_taken(&self, name: &str) -> bool {
        name == self.first.name
            || name == self.catch_all.name
            || self.features.iter().any(|r| r.name == name)
    }

    /// Register a feature handler
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<&mut Self, EngineError> {
        let name = handler.name().to_string();
        if name.trim().is_empty() {
            return Err(EngineError::Config("Handler name cannot be empty".to_string()));
        }
        if self.is_taken(&name) {
            return Err(EngineError::DuplicateHandlerName(name));
        }

        debug!(handler = %name, "Registering handler");
        self.features.push(Registration::new(handler, Slot::Feature));
        Ok(self)
    }

    /// Register a handler, consuming and returning the builder
    pub fn with(mut self, handler: Arc<dyn Handler>) -> Result<Self, EngineError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Apply configuration overrides
    ///
    /// An entry naming an unregistered handler is an error. Reserved handlers
    /// accept settings and priority but cannot be disabled.
    pub fn configure(mut self, entries: &[HandlerEntry]) -> Result<Self, EngineError> {
        for entry in entries {
            let registration = if entry.name == self.first.name {
                &mut self.first
            } else if entry.name == self.catch_all.name {
                &mut self.catch_all
            } else {
                self.features
                    .iter_mut()
                    .find(|r| r.name == entry.name)
                    .ok_or_else(|| EngineError::UnknownHandler(entry.name.clone()))?
            };

            if let Some(priority) = entry.priority {
                registration.priority = priority;
            }
            if registration.slot == Slot::Feature {
                registration.enabled = entry.enabled;
            } else if !entry.enabled {
                warn!(handler = %entry.name, "Reserved handler cannot be disabled; ignoring");
            }
            registration.settings = Arc::new(entry.settings_json());
        }
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> Arc<HandlerRegistry> {
        let enabled = self.features.iter().filter(|r| r.enabled).count();
        info!(
            handlers = self.features.len(),
            enabled, "Handler registry built"
        );

        Arc::new(HandlerRegistry {
            first: self.first,
            features: self.features,
            catch_all: self.catch_all,
            intent_threshold: self.intent_threshold,
        })
    }
}

/// Immutable handler table
pub struct HandlerRegistry {
    first: Registration,
    /// Registration order
    features: Vec<Registration>,
    catch_all: Registration,
    intent_threshold: f64,
}

impl HandlerRegistry {
    /// A registry with only the reserved handlers
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn intent_threshold(&self) -> f64 {
        self.intent_threshold
    }

    /// Handler chain for a message, selected by keywords and `identify`
    pub fn handlers_for(&self, message: &str) -> Vec<&Registration> {
        self.select(message, None)
    }

    /// Handler chain for a message, also selecting by confident intent
    pub fn handlers_for_intent(
        &self,
        message: &str,
        classification: &Classification,
    ) -> Vec<&Registration> {
        self.select(message, classification.confident_intent(self.intent_threshold))
    }

    fn select(&self, message: &str, intent: Option<&str>) -> Vec<&Registration> {
        let tokens = tokenize(message);

        let mut selected: Vec<&Registration> = self
            .features
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| {
                r.matches_keywords(&tokens)
                    || intent.is_some_and(|intent| r.intents.iter().any(|i| i == intent))
                    || r.identifies(message)
            })
            .collect();

        // Stable sort keeps registration order among equal priorities
        selected.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(
            matched = ?selected.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            intent = ?intent,
            "Selected handler chain"
        );

        let mut chain = Vec::with_capacity(selected.len() + 2);
        chain.push(&self.first);
        chain.extend(selected);
        chain.push(&self.catch_all);
        chain
    }

    /// Look up a registration by name
    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.iter().find(|r| r.name == name)
    }

    /// All registrations: reserved first handler, features in registration
    /// order, then the catch-all
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        std::iter::once(&self.first)
            .chain(self.features.iter())
            .chain(std::iter::once(&self.catch_all))
    }

    /// Enabled registrations
    pub fn enabled(&self) -> impl Iterator<Item = &Registration> {
        self.iter().filter(|r| r.enabled)
    }

    /// Names of enabled feature handlers, for prompts
    pub fn feature_names(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Listing of every registration, highest priority first
    pub fn list(&self) -> Vec<RegistrationInfo> {
        let mut infos: Vec<RegistrationInfo> = self.iter().map(Registration::describe).collect();
        infos.sort_by(|a, b| b.priority.cmp(&a.priority));
        infos
    }

    /// Commands of enabled handlers, without duplicates
    pub fn commands(&self) -> Vec<CommandHelp> {
        let mut seen = HashSet::new();
        self.enabled()
            .flat_map(|r| r.handler.commands())
            .filter(|command| seen.insert(command.usage.clone()))
            .collect()
    }

    /// Run `initialize` on every enabled handler
    ///
    /// Failures are logged and returned; startup continues and the handler
    /// stays in the routing table.
    pub async fn initialize_all(&self) -> Vec<(String, EngineError)> {
        let mut failures = Vec::new();
        for registration in self.enabled() {
            if let Err(e) = registration.handler.initialize().await {
                warn!(handler = %registration.name, error = %e, "Handler failed to initialize");
                failures.push((registration.name.clone(), e));
            }
        }
        failures
    }

    /// Run `shutdown` on every enabled handler
    pub async fn shutdown_all(&self) {
        for registration in self.enabled() {
            if let Err(e) = registration.handler.shutdown().await {
                warn!(handler = %registration.name, error = %e, "Handler shutdown failed");
            }
        }
    }
}

/// Names the registry reserves for its own handlers
pub fn reserved_names() -> [&'static str; 2] {
    [MEMORY_CAPTURE, CONVERSATION]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sdk::handler::{HandlerContext, HandlerMetadata, HandlerOutcome};
    use sdk::types::InboundMessage;

    struct KeywordHandler {
        metadata: HandlerMetadata,
        identify_prefix: Option<&'static str>,
    }

    impl KeywordHandler {
        fn new(name: &str, keywords: &[&str], priority: i32) -> Arc<dyn Handler> {
            Arc::new(Self {
                metadata: HandlerMetadata::new(name)
                    .keywords(keywords)
                    .priority(priority),
                identify_prefix: None,
            })
        }
    }

    #[async_trait]
    impl Handler for KeywordHandler {
        fn metadata(&self) -> &HandlerMetadata {
            &self.metadata
        }

        fn identify(&self, message: &str) -> bool {
            self.identify_prefix
                .is_some_and(|prefix| message.starts_with(prefix))
        }

        async fn handle(&self, _message: &InboundMessage, _ctx: &HandlerContext) -> HandlerOutcome {
            HandlerOutcome::claimed(self.metadata.name.clone())
        }

        fn commands(&self) -> Vec<CommandHelp> {
            vec![CommandHelp::new(format!("/{}", self.metadata.name), "test command")]
        }
    }

    struct PanickyIdentify {
        metadata: HandlerMetadata,
    }

    #[async_trait]
    impl Handler for PanickyIdentify {
        fn metadata(&self) -> &HandlerMetadata {
            &self.metadata
        }

        fn identify(&self, _message: &str) -> bool {
            panic!("identify exploded")
        }

        async fn handle(&self, _message: &InboundMessage, _ctx: &HandlerContext) -> HandlerOutcome {
            HandlerOutcome::Declined
        }
    }

    fn names(chain: &[&Registration]) -> Vec<String> {
        chain.iter().map(|r| r.name().to_string()).collect()
    }

    fn entry(name: &str, enabled: bool, priority: Option<i32>) -> HandlerEntry {
        HandlerEntry {
            name: name.to_string(),
            enabled,
            priority,
            settings: toml::Table::new(),
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Don't forget: buy MILK!"), vec!["don't", "forget", "buy", "milk"]);
        assert_eq!(tokenize("  "), Vec::<String>::new());
        assert_eq!(tokenize("don\u{2019}t"), vec!["don't"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(KeywordHandler::new("weather", &["weather"], 10)).unwrap();

        let err = builder
            .register(KeywordHandler::new("weather", &["rain"], 5))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DuplicateHandlerName(name) if name == "weather"));

        for reserved in reserved_names() {
            let err = builder
                .register(KeywordHandler::new(reserved, &["x"], 1))
                .err()
                .unwrap();
            assert!(matches!(err, EngineError::DuplicateHandlerName(_)));
        }
    }

    #[test]
    fn test_chain_is_never_empty() {
        let registry = RegistryBuilder::new().build();
        assert_eq!(names(&registry.handlers_for("")), vec![MEMORY_CAPTURE, CONVERSATION]);
    }

    #[test]
    fn test_priority_order_with_stable_ties() {
        let registry = RegistryBuilder::new()
            .with(KeywordHandler::new("low", &["note"], 1))
            .unwrap()
            .with(KeywordHandler::new("tie-a", &["note"], 5))
            .unwrap()
            .with(KeywordHandler::new("tie-b", &["note"], 5))
            .unwrap()
            .with(KeywordHandler::new("unrelated", &["weather"], 99))
            .unwrap()
            .build();

        assert_eq!(
            names(&registry.handlers_for("take a note")),
            vec![MEMORY_CAPTURE, "tie-a", "tie-b", "low", CONVERSATION]
        );
    }

    #[test]
    fn test_phrase_keywords_match_contiguous_tokens() {
        let registry = RegistryBuilder::new()
            .with(KeywordHandler::new("reminders", &["don't forget"], 10))
            .unwrap()
            .build();

        assert_eq!(registry.handlers_for("Don't forget the milk").len(), 3);
        assert_eq!(registry.handlers_for("forget it, don't bother").len(), 2);
        // Substrings of tokens do not count
        assert_eq!(registry.handlers_for("dontforget").len(), 2);
    }

    #[test]
    fn test_identify_selects_handler() {
        let handler: Arc<dyn Handler> = Arc::new(KeywordHandler {
            metadata: HandlerMetadata::new("math"),
            identify_prefix: Some("="),
        });
        let registry = RegistryBuilder::new().with(handler).unwrap().build();

        assert_eq!(names(&registry.handlers_for("=2+2"))[1], "math");
        assert_eq!(registry.handlers_for("two plus two").len(), 2);
    }

    #[test]
    fn test_panicking_identify_is_no_match() {
        let handler: Arc<dyn Handler> = Arc::new(PanickyIdentify {
            metadata: HandlerMetadata::new("panicky"),
        });
        let registry = RegistryBuilder::new().with(handler).unwrap().build();
        assert_eq!(registry.handlers_for("anything").len(), 2);
    }

    #[test]
    fn test_intent_selection_requires_confidence() {
        let handler: Arc<dyn Handler> = Arc::new(KeywordHandler {
            metadata: HandlerMetadata::new("reminders").intents(&["reminder"]),
            identify_prefix: None,
        });
        let registry = RegistryBuilder::new()
            .intent_threshold(0.7)
            .with(handler)
            .unwrap()
            .build();

        let confident = Classification::new("reminder", 0.9);
        let unsure = Classification::new("reminder", 0.4);
        assert_eq!(registry.handlers_for_intent("ping me later", &confident).len(), 3);
        assert_eq!(registry.handlers_for_intent("ping me later", &unsure).len(), 2);
        assert_eq!(
            registry
                .handlers_for_intent("ping me later", &Classification::degraded())
                .len(),
            2
        );
    }

    #[test]
    fn test_configuration_overrides() {
        let registry = RegistryBuilder::new()
            .with(KeywordHandler::new("weather", &["weather"], 10))
            .unwrap()
            .with(KeywordHandler::new("news", &["weather", "news"], 1))
            .unwrap()
            .configure(&[
                entry("weather", false, None),
                entry("news", true, Some(50)),
                entry(CONVERSATION, false, Some(3)),
            ])
            .unwrap()
            .build();

        assert_eq!(
            names(&registry.handlers_for("weather news")),
            vec![MEMORY_CAPTURE, "news", CONVERSATION]
        );
        assert!(!registry.get("weather").unwrap().enabled());
        assert_eq!(registry.get("news").unwrap().priority(), 50);
        assert!(registry.get(CONVERSATION).unwrap().enabled());
    }

    #[test]
    fn test_unknown_handler_in_config() {
        let result = RegistryBuilder::new().configure(&[entry("ghost", true, None)]);
        assert!(matches!(result.err(), Some(EngineError::UnknownHandler(name)) if name == "ghost"));
    }

    #[test]
    fn test_commands_skip_disabled_handlers() {
        let registry = RegistryBuilder::new()
            .with(KeywordHandler::new("weather", &["weather"], 10))
            .unwrap()
            .with(KeywordHandler::new("news", &["news"], 1))
            .unwrap()
            .configure(&[entry("news", false, None)])
            .unwrap()
            .build();

        let usages: Vec<String> = registry.commands().into_iter().map(|c| c.usage).collect();
        assert!(usages.contains(&"/weather".to_string()));
        assert!(!usages.contains(&"/news".to_string()));
        assert_eq!(registry.feature_names(), vec!["weather".to_string()]);
    }
}
