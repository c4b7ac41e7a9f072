//! OpenAI chat completions provider

use super::{status_error, transport_error, LLMError, LLMProvider, Message};
use crate::config::ProviderConfig;
use crate::secrets::{SecretCache, OPENAI_API_KEY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub struct OpenAIProvider {
    config: ProviderConfig,
    secret_cache: SecretCache,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: String,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig, secret_cache: SecretCache) -> Self {
        Self {
            config,
            secret_cache,
            client: reqwest::Client::new(),
        }
    }

    fn request<'a>(&'a self, messages: &'a [Message]) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|msg| ChatMessage {
                    role: msg.role.to_string(),
                    content: &msg.content,
                })
                .collect(),
        }
    }
}

fn first_choice(response: ChatResponse) -> super::Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| LLMError::ParseError("No message content in response".to_string()))
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_local(&self) -> bool {
        false
    }

    fn estimated_cost(&self, tokens: usize) -> f64 {
        // gpt-4o-mini, roughly
        (tokens as f64 / 1000.0) * 0.002
    }

    async fn check_health(&self) -> bool {
        self.secret_cache.get_secret(OPENAI_API_KEY).is_ok()
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let api_key = self
            .secret_cache
            .get_secret(OPENAI_API_KEY)
            .map_err(|e| LLMError::AuthenticationFailed(e.to_string()))?;

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key.unsecure())
            .json(&self.request(messages))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;
        first_choice(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretManager;
    use std::sync::Arc;

    #[test]
    fn test_request_keeps_roles_in_order() {
        let provider = OpenAIProvider::new(
            ProviderConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
            },
            SecretCache::new(Arc::new(SecretManager::new("steward-test"))),
        );
        let messages = [Message::system("be brief"), Message::user("hi")];

        let body = serde_json::to_value(provider.request(&messages)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_empty_choices_is_a_parse_error() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(first_choice(parsed), Err(LLMError::ParseError(_))));

        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"content": "ok"}}]}"#).unwrap();
        assert_eq!(first_choice(parsed).unwrap(), "ok");
    }
}
