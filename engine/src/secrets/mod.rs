//! Secret lookup and scrubbing
//!
//! API keys and the Telegram bot token are read from an environment variable
//! (`STEWARD_<KEY>` in upper case) or, failing that, from the OS keychain.
//! They are never read from the config file.

pub mod cache;

pub use cache::SecretCache;

use keyring::Entry;
use regex::Regex;
use sdk::errors::EngineError;
use std::fmt;
use std::sync::OnceLock;

/// Keychain service name
pub const SERVICE_NAME: &str = "steward";

/// Secret keys the engine knows about
pub const OPENAI_API_KEY: &str = "openai_api_key";
pub const ANTHROPIC_API_KEY: &str = "anthropic_api_key";
pub const TELEGRAM_BOT_TOKEN: &str = "telegram_bot_token";

/// Sensitive string that never prints its value.
///
/// Use `unsecure()` to get at the raw value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn unsecure(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Looks secrets up in the environment, then the OS keychain.
pub struct SecretManager {
    service_name: String,
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns for OpenAI/Anthropic keys, Telegram bot tokens and bearer headers
fn secret_patterns() -> &'static [Regex] {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"sk-[a-zA-Z0-9\-_]{20,}",
            r"\b[0-9]{8,10}:[a-zA-Z0-9\-_]{35}\b",
            r"Bearer\s+[^\s]{20,}",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Replace anything that looks like a secret with `[REDACTED]`
pub fn scrub(text: &str) -> String {
    let mut result = text.to_string();
    for pattern in secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").into_owned();
    }
    result
}

/// Environment variable consulted for `key`
pub fn env_var_name(key: &str) -> String {
    format!("STEWARD_{}", key.to_uppercase())
}

impl SecretManager {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, EngineError> {
        Entry::new(&self.service_name, key).map_err(|e| {
            EngineError::KeyringError(format!("Failed to create keyring entry: {}", e))
        })
    }

    /// Retrieves a secret without prompting.
    ///
    /// # Errors
    /// Returns `EngineError::KeyringError` if the secret is in neither place.
    pub fn get_secret(&self, key: &str) -> Result<SecretString, EngineError> {
        if let Ok(value) = std::env::var(env_var_name(key)) {
            if !value.trim().is_empty() {
                tracing::debug!("Using secret '{}' from environment", key);
                return Ok(SecretString::new(value.trim()));
            }
        }

        match self.entry(key)?.get_password() {
            Ok(secret) => {
                tracing::debug!("Retrieved secret '{}' from keychain", key);
                Ok(SecretString::new(secret))
            }
            Err(keyring::Error::NoEntry) => Err(EngineError::KeyringError(format!(
                "Secret '{}' is not set. Export {} or run `steward secret set {}`",
                key,
                env_var_name(key),
                key
            ))),
            Err(e) => Err(EngineError::KeyringError(format!(
                "Failed to retrieve secret '{}': {}",
                key, e
            ))),
        }
    }

    /// Stores a secret in the OS keychain.
    pub fn set_secret(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.entry(key)?.set_password(value).map_err(|e| {
            EngineError::KeyringError(format!("Failed to store secret '{}': {}", key, e))
        })?;

        tracing::info!("Stored secret '{}' in keychain", key);
        Ok(())
    }

    /// Deletes a secret from the OS keychain.
    pub fn delete_secret(&self, key: &str) -> Result<(), EngineError> {
        self.entry(key)?.delete_password().map_err(|e| {
            EngineError::KeyringError(format!("Failed to delete secret '{}': {}", key, e))
        })?;

        tracing::info!("Deleted secret '{}' from keychain", key);
        Ok(())
    }

    /// True if the secret is available from either source
    pub fn has_secret(&self, key: &str) -> bool {
        self.get_secret(key).is_ok()
    }

    /// Prompt on stderr and read the value without echoing it
    pub fn prompt_for_secret(&self, key: &str) -> Result<String, EngineError> {
        let input = rpassword::prompt_password_stderr(&format!("Enter value for '{}': ", key))
            .map_err(|e| EngineError::KeyringError(format!("Failed to read input: {}", e)))?;

        let secret = input.trim().to_string();
        if secret.is_empty() {
            return Err(EngineError::KeyringError(
                "Secret cannot be empty".to_string(),
            ));
        }

        Ok(secret)
    }

    /// Same as the free `scrub` function
    pub fn scrub(&self, text: &str) -> String {
        scrub(text)
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}
