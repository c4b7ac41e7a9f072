//! Configuration management
//!
//! This module handles loading, validation, and management of the Steward configuration.
//! Configuration is stored in TOML format at ~/.steward/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **reasoning**: Reasoning provider settings and deadlines
//! - **context**: Conversation window and memory budget
//! - **dispatch**: Handler deadlines, intent threshold, lane reaping
//! - **telegram**: Telegram transport settings
//! - **scheduler**: Periodic handler tick
//! - **handlers**: Per-handler overrides (`[[handlers]]` entries)
//!
//! Configuration is read once at startup. Restart the engine to reload it.
//!
//! # Examples
//!
//! ```no_run
//! use steward_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Default provider: {}", config.reasoning.default_provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Reasoning service configuration
    pub reasoning: ReasoningConfig,

    /// Conversation context configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Routing and sequencing configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Telegram transport configuration
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-handler overrides
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Reasoning service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Preferred provider (ollama, openai, anthropic)
    pub default_provider: String,

    /// Deadline for intent classification (milliseconds)
    #[serde(default = "default_classify_timeout_ms")]
    pub classify_timeout_ms: u64,

    /// Deadline for free-text completion (milliseconds)
    #[serde(default = "default_complete_timeout_ms")]
    pub complete_timeout_ms: u64,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: ProviderConfig,

    /// OpenAI provider settings
    #[serde(default = "default_openai_provider")]
    pub openai: ProviderConfig,

    /// Anthropic provider settings
    #[serde(default = "default_anthropic_provider")]
    pub anthropic: ProviderConfig,
}

/// Endpoint settings shared by every provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Base URL for the provider API
    pub base_url: String,

    /// Model name
    pub model: String,
    // Note: API keys come from the environment or the OS keychain, not the config
}

/// Conversation context configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    /// Turns kept in the per-user window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Maximum facts supplied per message
    #[serde(default = "default_memory_max_facts")]
    pub memory_max_facts: usize,

    /// Approximate token budget for supplied facts
    #[serde(default = "default_memory_max_tokens")]
    pub memory_max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            memory_max_facts: default_memory_max_facts(),
            memory_max_tokens: default_memory_max_tokens(),
        }
    }
}

/// Routing and sequencing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Deadline for a single handler invocation (milliseconds)
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Minimum confidence for intent-based routing (0.0-1.0)
    #[serde(default = "default_intent_confidence_threshold")]
    pub intent_confidence_threshold: f64,

    /// Idle time after which a user's lane is reaped (seconds)
    #[serde(default = "default_lane_idle_timeout_secs")]
    pub lane_idle_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            intent_confidence_threshold: default_intent_confidence_threshold(),
            lane_idle_timeout_secs: default_lane_idle_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn lane_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.lane_idle_timeout_secs)
    }
}

/// Telegram transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelegramConfig {
    /// Enable the Telegram transport in `serve`
    #[serde(default)]
    pub enabled: bool,

    /// Telegram user ids allowed to talk to the bot (empty = everyone)
    #[serde(default)]
    pub allowed_users: Vec<i64>,

    /// Long polling timeout (seconds)
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_users: Vec::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Interval between `on_schedule` sweeps (seconds)
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

/// A `[[handlers]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerEntry {
    /// Handler name as declared in its metadata
    pub name: String,

    /// Override the enabled flag
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override the declared priority
    #[serde(default)]
    pub priority: Option<i32>,

    /// Free-form settings handed to the handler
    #[serde(default = "default_settings")]
    pub settings: toml::Table,
}

impl HandlerEntry {
    /// Settings converted to JSON for the handler context
    pub fn settings_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.settings).unwrap_or(serde_json::Value::Null)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.steward")
}

fn default_classify_timeout_ms() -> u64 {
    5_000
}

fn default_complete_timeout_ms() -> u64 {
    30_000
}

fn default_window_size() -> usize {
    20
}

fn default_memory_max_facts() -> usize {
    10
}

fn default_memory_max_tokens() -> usize {
    400
}

fn default_handler_timeout_ms() -> u64 {
    10_000
}

fn default_intent_confidence_threshold() -> f64 {
    0.7
}

fn default_lane_idle_timeout_secs() -> u64 {
    300
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_tick_secs() -> u64 {
    60
}

fn default_settings() -> toml::Table {
    toml::Table::new()
}

fn default_openai_provider() -> ProviderConfig {
    ProviderConfig {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
    }
}

fn default_anthropic_provider() -> ProviderConfig {
    ProviderConfig {
        base_url: "https://api.anthropic.com/v1".to_string(),
        model: "claude-3-5-sonnet-20241022".to_string(),
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".to_string(),
            classify_timeout_ms: default_classify_timeout_ms(),
            complete_timeout_ms: default_complete_timeout_ms(),
            ollama: ProviderConfig::default(),
            openai: default_openai_provider(),
            anthropic: default_anthropic_provider(),
        }
    }
}

impl ReasoningConfig {
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn complete_timeout(&self) -> Duration {
        Duration::from_millis(self.complete_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default location (~/.steward/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before path expansion so the file keeps the portable ~ form
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.steward/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".steward").join("config.toml"))
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("steward.db")
    }

    /// The `[[handlers]]` entry for a handler, if any
    pub fn handler_entry(&self, name: &str) -> Option<&HandlerEntry> {
        self.handlers.iter().find(|entry| entry.name == name)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, provider name and numeric ranges
    /// - Rejects duplicate `[[handlers]]` names
    /// - Expands ~ in the data directory and creates it
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai", "anthropic"];
        if !valid_providers.contains(&self.reasoning.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.reasoning.default_provider,
                valid_providers.join(", ")
            )));
        }

        if self.context.window_size == 0 {
            return Err(EngineError::Config(
                "window_size must be at least 1".to_string(),
            ));
        }

        let threshold = self.dispatch.intent_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EngineError::Config(
                "intent_confidence_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.dispatch.handler_timeout_ms == 0 {
            return Err(EngineError::Config(
                "handler_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.tick_secs == 0 {
            return Err(EngineError::Config(
                "tick_secs must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.handlers {
            if !seen.insert(entry.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "Handler '{}' is configured more than once",
                    entry.name
                )));
            }
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            reasoning: ReasoningConfig::default(),
            context: ContextConfig::default(),
            dispatch: DispatchConfig::default(),
            telegram: TelegramConfig {
                enabled: false,
                allowed_users: Vec::new(),
                poll_timeout_secs: default_poll_timeout_secs(),
            },
            scheduler: SchedulerConfig::default(),
            handlers: Vec::new(),
        }
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal(data_dir: &Path, extra: &str) -> String {
        format!(
            "[core]\ndata_dir = {:?}\n\n[reasoning]\ndefault_provider = \"ollama\"\n{}",
            data_dir.display().to_string(),
            extra
        )
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.reasoning.default_provider, "ollama");
        assert_eq!(config.context.window_size, 20);
        assert_eq!(config.dispatch.intent_confidence_threshold, 0.7);
        assert!(!config.telegram.enabled);
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::from_toml_str(&minimal(temp.path(), "")).unwrap();

        assert_eq!(config.context, ContextConfig::default());
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert_eq!(config.reasoning.openai.model, "gpt-4o-mini");
        assert_eq!(config.database_path(), temp.path().join("steward.db"));
    }

    #[test]
    fn test_handler_entries_parse() {
        let temp = TempDir::new().unwrap();
        let extra = r#"
[[handlers]]
name = "reminders"
priority = 50

[handlers.settings]
default_hour = 9

[[handlers]]
name = "recall"
enabled = false
"#;
        let config = Config::from_toml_str(&minimal(temp.path(), extra)).unwrap();

        let reminders = config.handler_entry("reminders").unwrap();
        assert_eq!(reminders.priority, Some(50));
        assert!(reminders.enabled);
        assert_eq!(reminders.settings_json()["default_hour"], 9);

        let recall = config.handler_entry("recall").unwrap();
        assert!(!recall.enabled);
        assert_eq!(recall.priority, None);
    }

    #[test]
    fn test_duplicate_handler_entries_rejected() {
        let temp = TempDir::new().unwrap();
        let extra = "[[handlers]]\nname = \"recall\"\n\n[[handlers]]\nname = \"recall\"\n";
        let err = Config::from_toml_str(&minimal(temp.path(), extra)).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_invalid_provider_rejected() {
        let temp = TempDir::new().unwrap();
        let toml = format!(
            "[core]\ndata_dir = {:?}\n\n[reasoning]\ndefault_provider = \"gemini\"\n",
            temp.path().display().to_string()
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let temp = TempDir::new().unwrap();
        let extra = "\n[context]\nwindow_size = 0\n";
        assert!(Config::from_toml_str(&minimal(temp.path(), extra)).is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let temp = TempDir::new().unwrap();
        let extra = "\n[dispatch]\nintent_confidence_threshold = 1.5\n";
        assert!(Config::from_toml_str(&minimal(temp.path(), extra)).is_err());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_path(&path).unwrap(), path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(
            config.reasoning.default_provider,
            deserialized.reasoning.default_provider
        );
        assert_eq!(config.context, deserialized.context);
    }
}
