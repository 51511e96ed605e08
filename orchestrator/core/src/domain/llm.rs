// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The chat-completion abstraction the agent loop drives. The LLM endpoint
//! itself is an external collaborator (out of scope); this module only
//! fixes the trait boundary, generalized from a single-shot prompt/response
//! call into a conversational, tool-calling, streamable one. See ADR-009
//! (BYOLLM provider system) for the anti-corruption-layer rationale this
//! trait continues to follow.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::task::FunctionCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in the chat history handed to the provider, reconstructed fresh
/// from `AgentTask.items` on every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    pub tool_calls: Vec<FunctionCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant_tool_calls(calls: Vec<FunctionCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls: calls, tool_call_id: None }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A function the LLM may call, derived from a [`crate::domain::governance::PluginTool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub plugin_name: String,
    pub function_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Options for LLM generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
    pub tools: Vec<ToolSpec>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { max_tokens: Some(4096), temperature: Some(0.7), stop_sequences: Vec::new(), tools: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// One complete LLM turn: either assistant text, or a batch of tool calls
/// the collector assembled from (possibly streamed) fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<FunctionCall>,
    pub usage: TokenUsage,
    pub provider: String,
    pub model: String,
    pub finish_reason: FinishReason,
}

/// One fragment of a streamed generation: a lazy finite sequence with a
/// terminal sentinel (`Done`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GenerationFragment {
    Text(String),
    ToolCallDelta { index: usize, id: Option<String>, function_name: Option<String>, arguments_delta: String },
    Done(GenerationResponse),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed")]
    Authentication,
    #[error("Rate limit exceeded")]
    RateLimit,
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Domain interface for LLM providers: an anti-corruption layer that
/// isolates the agent loop from vendor-specific request/response shapes.
/// Implementations live under `infrastructure/llm/`.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError>;

    async fn generate_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<BoxStream<'static, Result<GenerationFragment, LLMError>>, LLMError>;

    async fn health_check(&self) -> Result<(), LLMError>;
}
