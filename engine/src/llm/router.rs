//! LLM Router
//!
//! Orders providers by preference and fails over between them. The
//! configured default provider always comes first; the rest follow cheapest
//! first, local before cloud on equal cost.

use super::anthropic::AnthropicProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAIProvider;
use super::{LLMError, LLMProvider, Message};
use crate::config::ReasoningConfig;
use crate::secrets::{SecretCache, ANTHROPIC_API_KEY, OPENAI_API_KEY};
use std::time::Duration;

/// Failover router over the configured providers
pub struct LLMRouter {
    providers: Vec<Box<dyn LLMProvider>>,
    default_provider: String,
    local_timeout: Duration,
    cloud_timeout: Duration,
}

impl LLMRouter {
    pub fn new(providers: Vec<Box<dyn LLMProvider>>, default_provider: impl Into<String>) -> Self {
        Self {
            providers,
            default_provider: default_provider.into(),
            // Local models may need to load before the first token
            local_timeout: Duration::from_secs(120),
            cloud_timeout: Duration::from_secs(30),
        }
    }

    /// Build the router from config.
    ///
    /// Ollama is always registered. Cloud providers are registered when they
    /// are the default or their API key is available.
    pub fn from_config(config: &ReasoningConfig, secrets: &SecretCache) -> Self {
        let mut providers: Vec<Box<dyn LLMProvider>> =
            vec![Box::new(OllamaProvider::from_config(&config.ollama))];

        if config.default_provider == "openai" || secrets.get_secret(OPENAI_API_KEY).is_ok() {
            providers.push(Box::new(OpenAIProvider::new(
                config.openai.clone(),
                secrets.clone(),
            )));
        }
        if config.default_provider == "anthropic" || secrets.get_secret(ANTHROPIC_API_KEY).is_ok()
        {
            providers.push(Box::new(AnthropicProvider::new(
                config.anthropic.clone(),
                secrets.clone(),
            )));
        }

        Self::new(providers, &config.default_provider)
    }

    pub fn with_timeouts(mut self, local: Duration, cloud: Duration) -> Self {
        self.local_timeout = local;
        self.cloud_timeout = cloud;
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Providers in the order they will be tried
    pub fn rank_providers(&self, estimated_tokens: usize) -> Vec<&dyn LLMProvider> {
        let mut providers: Vec<&dyn LLMProvider> =
            self.providers.iter().map(|b| b.as_ref()).collect();

        providers.sort_by(|a, b| {
            let a_default = a.name() == self.default_provider;
            let b_default = b.name() == self.default_provider;
            b_default
                .cmp(&a_default)
                .then_with(|| {
                    a.estimated_cost(estimated_tokens)
                        .total_cmp(&b.estimated_cost(estimated_tokens))
                })
                .then_with(|| b.is_local().cmp(&a.is_local()))
        });

        providers
    }

    /// Call providers in rank order until one answers
    ///
    /// Returns the completion and the name of the provider that produced it.
    pub async fn call(&self, messages: &[Message]) -> super::Result<(String, String)> {
        if self.providers.is_empty() {
            return Err(LLMError::ProviderUnavailable(
                "No LLM providers configured".to_string(),
            ));
        }

        let estimated_tokens = messages.iter().map(|m| m.content.len()).sum::<usize>() / 4;

        for provider in self.rank_providers(estimated_tokens) {
            let timeout = if provider.is_local() {
                self.local_timeout
            } else {
                self.cloud_timeout
            };
            tracing::debug!(
                "Attempting provider: {} (timeout: {:?})",
                provider.name(),
                timeout
            );

            match tokio::time::timeout(timeout, provider.generate(messages)).await {
                Ok(Ok(text)) => {
                    tracing::debug!("Provider {} succeeded", provider.name());
                    return Ok((text, provider.name().to_string()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Provider {} failed: {}", provider.name(), e);
                }
                Err(_) => {
                    tracing::warn!("Provider {} timed out after {:?}", provider.name(), timeout);
                }
            }
        }

        tracing::error!("All LLM providers exhausted");
        Err(LLMError::ProviderUnavailable(
            "All LLM providers failed".to_string(),
        ))
    }

    /// Returns a list of (provider_name, is_healthy)
    pub async fn check_health(&self) -> Vec<(&str, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            results.push((provider.name(), provider.check_health().await));
        }
        results
    }
}
