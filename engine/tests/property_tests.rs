use proptest::prelude::*;
use steward_engine::builtins::{CONVERSATION, MEMORY_CAPTURE};
use steward_engine::config::{Config, HandlerEntry};
use steward_engine::registry::{tokenize, HandlerRegistry};
use tempfile::TempDir;

proptest! {
    #[test]
    fn test_config_parsing_round_trip(
        log_level in "error|warn|info|debug|trace",
        default_provider in "ollama|openai|anthropic",
        classify_ms in 1..=10_000u64,
        window_size in 1..=500usize,
        threshold in 0.0..=1.0f64,
        handler_timeout_ms in 1..=60_000u64,
        allowed_users in prop::collection::vec(1..=i64::MAX, 0..4),
        priority in prop::option::of(-100..=100i32),
        enabled in any::<bool>(),
    ) {
        let temp = TempDir::new().unwrap();
        let baseline = format!(
            "[core]\ndata_dir = {:?}\n\n[reasoning]\ndefault_provider = \"ollama\"\n",
            temp.path().display().to_string()
        );
        let mut config = Config::from_toml_str(&baseline).unwrap();

        config.core.log_level = log_level.clone();
        config.reasoning.default_provider = default_provider.clone();
        config.reasoning.classify_timeout_ms = classify_ms;
        config.context.window_size = window_size;
        config.dispatch.intent_confidence_threshold = threshold;
        config.dispatch.handler_timeout_ms = handler_timeout_ms;
        config.telegram.allowed_users = allowed_users.clone();

        let mut settings = toml::Table::new();
        settings.insert("utc_offset_minutes".to_string(), toml::Value::Integer(120));
        config.handlers = vec![HandlerEntry {
            name: "reminders".to_string(),
            enabled,
            priority,
            settings,
        }];

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml_str(&serialized).unwrap();

        prop_assert_eq!(parsed.core.log_level, log_level);
        prop_assert_eq!(parsed.core.data_dir, config.core.data_dir);
        prop_assert_eq!(parsed.reasoning.default_provider, default_provider);
        prop_assert_eq!(parsed.reasoning.classify_timeout_ms, classify_ms);
        prop_assert_eq!(parsed.reasoning.ollama, config.reasoning.ollama);
        prop_assert_eq!(parsed.context, config.context);
        prop_assert_eq!(parsed.dispatch, config.dispatch);
        prop_assert_eq!(parsed.telegram, config.telegram);
        prop_assert_eq!(parsed.scheduler, config.scheduler);
        prop_assert_eq!(parsed.handlers, config.handlers);
    }

    #[test]
    fn test_tokens_are_trimmed_words(text in "\\PC{0,80}") {
        for token in tokenize(&text) {
            prop_assert!(!token.is_empty());
            prop_assert!(!token.starts_with('\''));
            prop_assert!(!token.ends_with('\''));
            prop_assert!(!token.chars().any(char::is_whitespace));
        }
    }

    #[test]
    fn test_chain_is_bracketed_by_reserved_handlers(text in "\\PC{0,80}") {
        let registry = HandlerRegistry::builder().build();
        let chain = registry.handlers_for(&text);

        prop_assert!(chain.len() >= 2);
        prop_assert_eq!(chain[0].name(), MEMORY_CAPTURE);
        prop_assert_eq!(chain[chain.len() - 1].name(), CONVERSATION);
    }
}
