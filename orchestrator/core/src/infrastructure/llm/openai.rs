// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # OpenAI / Azure OpenAI Adapter
//!
//! Implements the `LLMProvider` domain trait for OpenAI `gpt-*` models and
//! OpenAI-compatible endpoints (LM Studio, vLLM). Acts as an
//! **Anti-Corruption Layer**: translates this crate's conversational,
//! tool-calling domain types into the Chat Completions wire format and back.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domain::llm::{
    ChatMessage, ChatRole, FinishReason, GenerationFragment, GenerationOptions, GenerationResponse,
    LLMError, LLMProvider, TokenUsage,
};
use crate::domain::task::FunctionCall;

pub struct OpenAIAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAIAdapter {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, api_key }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAIStreamOptions>,
}

#[derive(Serialize)]
struct OpenAIStreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    tool_calls: Vec<OpenAIToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAIFunctionCall,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAIToolFunction,
}

#[derive(Serialize)]
struct OpenAIToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: String,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIStreamToolCall>,
}

#[derive(Deserialize)]
struct OpenAIStreamToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIStreamFunctionCall>,
}

#[derive(Deserialize)]
struct OpenAIStreamFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct StreamingToolCall {
    id: Option<String>,
    function_name: Option<String>,
    arguments: String,
}

fn plugin_function(tool_id: &str) -> (String, String) {
    match tool_id.split_once('-') {
        Some((plugin, function)) => (plugin.to_string(), function.to_string()),
        None => ("native".to_string(), tool_id.to_string()),
    }
}

fn to_openai_message(message: &ChatMessage) -> OpenAIMessage {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    OpenAIMessage {
        role: role.to_string(),
        content: message.content.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|call| OpenAIToolCall {
                id: call.id.clone(),
                kind: "function".to_string(),
                function: OpenAIFunctionCall {
                    name: call.tool_id(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn from_openai_choice(choice: OpenAIChoice) -> (Option<String>, Vec<FunctionCall>, FinishReason) {
    let tool_calls = choice
        .message
        .tool_calls
        .iter()
        .map(|call| {
            let (plugin_name, function_name) = plugin_function(&call.function.name);
            FunctionCall {
                id: call.id.clone(),
                plugin_name,
                function_name,
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            }
        })
        .collect::<Vec<_>>();

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        match choice.finish_reason.as_str() {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    };

    (choice.message.content, tool_calls, finish_reason)
}

fn build_request(model: &str, messages: &[ChatMessage], options: &GenerationOptions, stream: bool) -> OpenAIRequest {
    OpenAIRequest {
        model: model.to_string(),
        messages: messages.iter().map(to_openai_message).collect(),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
        stop: options.stop_sequences.clone(),
        tools: options
            .tools
            .iter()
            .map(|tool| OpenAITool {
                kind: "function".to_string(),
                function: OpenAIToolFunction {
                    name: format!("{}-{}", tool.plugin_name, tool.function_name),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
        stream,
        stream_options: if stream { Some(OpenAIStreamOptions { include_usage: true }) } else { None },
    }
}

fn map_status_error(status: reqwest::StatusCode, body: String, model: &str) -> LLMError {
    if status == 401 || status == 403 {
        LLMError::Authentication
    } else if status == 429 {
        LLMError::RateLimit
    } else if status == 404 {
        LLMError::ModelNotFound(model.to_string())
    } else {
        LLMError::Provider(format!("HTTP {status}: {body}"))
    }
}

#[async_trait]
impl LLMProvider for OpenAIAdapter {
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let request = build_request(model, messages, options, false);

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body, model));
        }

        let parsed: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("failed to parse response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::Provider("no choices in response".into()))?;
        let (text, tool_calls, finish_reason) = from_openai_choice(choice);

        Ok(GenerationResponse {
            text,
            tool_calls,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
            },
            provider: "openai".to_string(),
            model: model.to_string(),
            finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<BoxStream<'static, Result<GenerationFragment, LLMError>>, LLMError> {
        let request = build_request(model, messages, options, true);

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body, model));
        }

        let (tx, rx) = mpsc::channel(64);
        let model = model.to_string();
        tokio::spawn(async move { stream_chat_completion(response, model, tx).await });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn health_check(&self) -> Result<(), LLMError> {
        let url = format!("{}/models", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else if response.status() == 401 || response.status() == 403 {
            Err(LLMError::Authentication)
        } else {
            Err(LLMError::Network(format!("HTTP {}", response.status())))
        }
    }
}

/// Drive a Chat Completions SSE response to completion, forwarding each
/// text delta as it arrives and emitting exactly one `Done` fragment once
/// the stream closes (`[DONE]` sentinel or connection end).
async fn stream_chat_completion(response: reqwest::Response, model: String, tx: mpsc::Sender<Result<GenerationFragment, LLMError>>) {
    let mut events = response.bytes_stream().eventsource();
    let mut text = String::new();
    let mut tool_calls: Vec<StreamingToolCall> = Vec::new();
    let mut usage = TokenUsage::default();
    let mut finish_reason = FinishReason::Stop;

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                let _ = tx.send(Err(LLMError::Network(e.to_string()))).await;
                return;
            }
        };

        if event.data == "[DONE]" {
            break;
        }

        let chunk: OpenAIStreamChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(_) => continue,
        };

        if let Some(chunk_usage) = chunk.usage {
            usage = TokenUsage {
                prompt_tokens: chunk_usage.prompt_tokens,
                completion_tokens: chunk_usage.completion_tokens,
                total_tokens: chunk_usage.total_tokens,
            };
        }

        let Some(choice) = chunk.choices.into_iter().next() else { continue };

        if let Some(reason) = choice.finish_reason.as_deref() {
            finish_reason = match reason {
                "length" => FinishReason::Length,
                "content_filter" => FinishReason::ContentFilter,
                "tool_calls" => FinishReason::ToolCalls,
                _ => FinishReason::Stop,
            };
        }

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                text.push_str(&content);
                if tx.send(Ok(GenerationFragment::Text(content))).await.is_err() {
                    return;
                }
            }
        }

        for delta in choice.delta.tool_calls {
            while tool_calls.len() <= delta.index {
                tool_calls.push(StreamingToolCall::default());
            }
            let call = &mut tool_calls[delta.index];
            if let Some(id) = delta.id.clone() {
                call.id = Some(id);
            }
            let mut arguments_delta = String::new();
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    call.function_name = Some(name.clone());
                }
                if let Some(arguments) = &function.arguments {
                    call.arguments.push_str(arguments);
                    arguments_delta = arguments.clone();
                }
            }
            let event = GenerationFragment::ToolCallDelta {
                index: delta.index,
                id: delta.id,
                function_name: delta.function.and_then(|f| f.name),
                arguments_delta,
            };
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
    }

    let tool_calls = tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let (plugin_name, function_name) = plugin_function(call.function_name.as_deref().unwrap_or_default());
            FunctionCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                plugin_name,
                function_name,
                arguments: serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null),
            }
        })
        .collect::<Vec<_>>();

    if !tool_calls.is_empty() {
        finish_reason = FinishReason::ToolCalls;
    }

    let response = GenerationResponse {
        text: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        usage,
        provider: "openai".to_string(),
        model,
        finish_reason,
    };
    let _ = tx.send(Ok(GenerationFragment::Done(response))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_round_trips_plugin_and_function_name() {
        let call = FunctionCall {
            id: "call_1".into(),
            plugin_name: "github".into(),
            function_name: "create_issue".into(),
            arguments: serde_json::json!({"title": "bug"}),
        };
        let message = ChatMessage::assistant_tool_calls(vec![call.clone()]);
        let wire = to_openai_message(&message);
        assert_eq!(wire.tool_calls[0].function.name, "github-create_issue");
        let (plugin, function) = plugin_function(&wire.tool_calls[0].function.name);
        assert_eq!(plugin, "github");
        assert_eq!(function, "create_issue");
    }

    #[test]
    fn stream_chunk_parses_text_delta() {
        let raw = r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#;
        let chunk: OpenAIStreamChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
        assert!(chunk.choices[0].delta.tool_calls.is_empty());
    }

    #[test]
    fn stream_chunk_parses_tool_call_delta_by_index() {
        let raw = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"github-create_issue","arguments":"{\"title\":"}}]},"finish_reason":null}]}"#;
        let chunk: OpenAIStreamChunk = serde_json::from_str(raw).unwrap();
        let delta = &chunk.choices[0].delta.tool_calls[0];
        assert_eq!(delta.index, 0);
        assert_eq!(delta.id.as_deref(), Some("call_1"));
        assert_eq!(delta.function.as_ref().unwrap().name.as_deref(), Some("github-create_issue"));
    }

    #[test]
    fn stream_chunk_parses_trailing_usage() {
        let raw = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunk: OpenAIStreamChunk = serde_json::from_str(raw).unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.total_tokens, 15);
    }
}
