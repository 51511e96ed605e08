// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// LLM Provider Registry - resolves an agent manifest's `model` field
// ("openai:gpt-4o", "anthropic:claude-3-5-sonnet", "ollama:llama3.2") to a
// concrete provider adapter plus the model name to pass it.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::domain::llm::{GenerationOptions, GenerationResponse, LLMError, LLMProvider};

use super::anthropic::AnthropicAdapter;
use super::ollama::OllamaAdapter;
use super::openai::OpenAIAdapter;

/// Registry for managing LLM providers, keyed by the provider prefix in an
/// agent's `model` string (`SPEC_FULL.md` §6: `provider:model`).
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    pub fn register(&mut self, provider_name: impl Into<String>, provider: Arc<dyn LLMProvider>) {
        self.providers.insert(provider_name.into(), provider);
    }

    /// Build the default registry from environment-provided API keys,
    /// skipping any provider whose key is absent.
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            let endpoint = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            registry.register("openai", Arc::new(OpenAIAdapter::new(endpoint, key)));
            info!("registered openai LLM provider");
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            registry.register("anthropic", Arc::new(AnthropicAdapter::new(key)));
            info!("registered anthropic LLM provider");
        }
        if let Ok(endpoint) = std::env::var("OLLAMA_BASE_URL") {
            registry.register("ollama", Arc::new(OllamaAdapter::new(endpoint)));
            info!("registered ollama LLM provider");
        }

        registry
    }

    /// Split an agent manifest's `model` field (`"provider:model"`) and
    /// resolve the provider half.
    fn resolve(&self, model_ref: &str) -> Result<(Arc<dyn LLMProvider>, &str), LLMError> {
        let (provider_name, model) = model_ref
            .split_once(':')
            .ok_or_else(|| LLMError::ModelNotFound(format!("malformed model reference: {model_ref}")))?;
        let provider = self
            .providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| LLMError::Provider(format!("provider '{provider_name}' not configured")))?;
        Ok((provider, model))
    }

    pub async fn generate(
        &self,
        model_ref: &str,
        messages: &[crate::domain::llm::ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let (provider, model) = self.resolve(model_ref)?;
        provider.generate(model, messages, options).await
    }

    pub async fn generate_stream(
        &self,
        model_ref: &str,
        messages: &[crate::domain::llm::ChatMessage],
        options: &GenerationOptions,
    ) -> Result<
        futures::stream::BoxStream<'static, Result<crate::domain::llm::GenerationFragment, LLMError>>,
        LLMError,
    > {
        let (provider, model) = self.resolve(model_ref)?;
        provider.generate_stream(model, messages, options).await
    }

    pub fn has_provider(&self, provider_name: &str) -> bool {
        self.providers.contains_key(provider_name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_splits_provider_prefix_from_model() {
        let mut registry = ProviderRegistry::new();
        registry.register("openai", Arc::new(OpenAIAdapter::new("http://localhost".into(), "k".into())));
        let (_, model) = registry.resolve("openai:gpt-4o").unwrap();
        assert_eq!(model, "gpt-4o");
    }

    #[test]
    fn resolve_rejects_unconfigured_provider() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve("openai:gpt-4o").is_err());
    }

    #[test]
    fn resolve_rejects_malformed_reference() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve("gpt-4o").is_err());
    }
}
