//! Anthropic messages API provider

use super::{status_error, transport_error, LLMError, LLMProvider, Message, MessageRole};
use crate::config::ProviderConfig;
use crate::secrets::{SecretCache, ANTHROPIC_API_KEY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    config: ProviderConfig,
    secret_cache: SecretCache,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<Turn<'a>>,
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: String,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig, secret_cache: SecretCache) -> Self {
        Self {
            config,
            secret_cache,
            client: reqwest::Client::new(),
        }
    }

    /// System turns are hoisted into the top-level `system` field
    fn request<'a>(&'a self, messages: &'a [Message]) -> MessagesRequest<'a> {
        let (system, turns): (Vec<&Message>, Vec<&Message>) = messages
            .iter()
            .partition(|msg| msg.role == MessageRole::System);

        MessagesRequest {
            model: &self.config.model,
            max_tokens: MAX_TOKENS,
            system: system
                .iter()
                .map(|msg| msg.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            messages: turns
                .into_iter()
                .map(|msg| Turn {
                    role: msg.role.to_string(),
                    content: &msg.content,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_local(&self) -> bool {
        false
    }

    fn estimated_cost(&self, tokens: usize) -> f64 {
        (tokens as f64 / 1000.0) * 0.003
    }

    async fn check_health(&self) -> bool {
        self.secret_cache.get_secret(ANTHROPIC_API_KEY).is_ok()
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let api_key = self
            .secret_cache
            .get_secret(ANTHROPIC_API_KEY)
            .map_err(|e| LLMError::AuthenticationFailed(e.to_string()))?;

        let url = format!("{}/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key.unsecure())
            .header("anthropic-version", API_VERSION)
            .json(&self.request(messages))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;
        if parsed.content.is_empty() {
            return Err(LLMError::ParseError("No content in response".to_string()));
        }
        Ok(parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect())
    }
}
