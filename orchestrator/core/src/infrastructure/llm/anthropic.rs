// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Anthropic Claude Messages API adapter, with native `tool_use`/`tool_result`
//! support mapped onto this crate's `FunctionCall`/`ToolResult` types.

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

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self { client: reqwest::Client::new(), api_key }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Anthropic's streaming wire format is a sequence of named SSE events
/// (`event: message_start` etc.), each carrying a `data:` payload tagged by
/// its own internal `type` field — unlike OpenAI's single untyped chunk.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart { message: AnthropicStreamMessageStart },
    ContentBlockStart { index: usize, content_block: AnthropicStreamBlockStart },
    ContentBlockDelta { index: usize, delta: AnthropicStreamDelta },
    ContentBlockStop { index: usize },
    MessageDelta { delta: AnthropicStreamMessageDelta, usage: AnthropicStreamDeltaUsage },
    MessageStop,
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct AnthropicStreamMessageStart {
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamBlockStart {
    Text { text: String },
    ToolUse { id: String, name: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct AnthropicStreamMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicStreamDeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Default)]
struct StreamingToolUse {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn plugin_function(tool_name: &str) -> (String, String) {
    match tool_name.split_once('-') {
        Some((plugin, function)) => (plugin.to_string(), function.to_string()),
        None => ("native".to_string(), tool_name.to_string()),
    }
}

fn to_anthropic_message(message: &ChatMessage) -> Option<AnthropicMessage> {
    let role = match message.role {
        ChatRole::System => return None,
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "user",
    };

    let content = if message.role == ChatRole::Tool {
        vec![AnthropicContentBlock::ToolResult {
            tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
            content: message.content.clone().unwrap_or_default(),
        }]
    } else if !message.tool_calls.is_empty() {
        message
            .tool_calls
            .iter()
            .map(|call| AnthropicContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.tool_id(),
                input: call.arguments.clone(),
            })
            .collect()
    } else {
        vec![AnthropicContentBlock::Text { text: message.content.clone().unwrap_or_default() }]
    };

    Some(AnthropicMessage { role: role.to_string(), content })
}

fn build_request(model: &str, messages: &[ChatMessage], options: &GenerationOptions, stream: bool) -> AnthropicRequest {
    let system = messages.iter().find(|m| m.role == ChatRole::System).and_then(|m| m.content.clone());

    AnthropicRequest {
        model: model.to_string(),
        messages: messages.iter().filter_map(to_anthropic_message).collect(),
        system,
        max_tokens: options.max_tokens.unwrap_or(4096),
        temperature: options.temperature,
        tools: options
            .tools
            .iter()
            .map(|tool| AnthropicTool {
                name: format!("{}-{}", tool.plugin_name, tool.function_name),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect(),
        stream,
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
impl LLMProvider for AnthropicAdapter {
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let request = build_request(model, messages, options, false);

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body, model));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("failed to parse response: {e}")))?;

        let mut text = None;
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicContentBlock::Text { text: t } => text = Some(t),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    let (plugin_name, function_name) = plugin_function(&name);
                    tool_calls.push(FunctionCall { id, plugin_name, function_name, arguments: input });
                }
                AnthropicContentBlock::ToolResult { .. } => {}
            }
        }

        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            match parsed.stop_reason.as_deref() {
                Some("max_tokens") => FinishReason::Length,
                _ => FinishReason::Stop,
            }
        };

        Ok(GenerationResponse {
            text,
            tool_calls,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
            provider: "anthropic".to_string(),
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

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
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
        tokio::spawn(async move { stream_messages(response, model, tx).await });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn health_check(&self) -> Result<(), LLMError> {
        let response = self
            .client
            .get("https://api.anthropic.com/v1/models")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
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

/// Drive a Messages API SSE response to completion, forwarding each text or
/// tool-call-argument delta as it arrives and emitting exactly one `Done`
/// fragment once `message_stop` is seen or the connection ends.
async fn stream_messages(response: reqwest::Response, model: String, tx: mpsc::Sender<Result<GenerationFragment, LLMError>>) {
    let mut events = response.bytes_stream().eventsource();
    let mut text = String::new();
    let mut tool_uses: std::collections::BTreeMap<usize, StreamingToolUse> = std::collections::BTreeMap::new();
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

        if event.data.is_empty() {
            continue;
        }

        let parsed: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };

        match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                usage.prompt_tokens = message.usage.input_tokens;
            }
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => {
                if let AnthropicStreamBlockStart::ToolUse { id, name } = content_block {
                    tool_uses.insert(index, StreamingToolUse { id: Some(id), name: Some(name), arguments: String::new() });
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicStreamDelta::TextDelta { text: delta_text } => {
                    if !delta_text.is_empty() {
                        text.push_str(&delta_text);
                        if tx.send(Ok(GenerationFragment::Text(delta_text))).await.is_err() {
                            return;
                        }
                    }
                }
                AnthropicStreamDelta::InputJsonDelta { partial_json } => {
                    let entry = tool_uses.entry(index).or_default();
                    entry.arguments.push_str(&partial_json);
                    let event = GenerationFragment::ToolCallDelta {
                        index,
                        id: entry.id.clone(),
                        function_name: entry.name.clone(),
                        arguments_delta: partial_json,
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                AnthropicStreamDelta::Unknown => {}
            },
            AnthropicStreamEvent::ContentBlockStop { .. } => {}
            AnthropicStreamEvent::MessageDelta { delta, usage: delta_usage } => {
                usage.completion_tokens = delta_usage.output_tokens;
                usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                if let Some(reason) = delta.stop_reason.as_deref() {
                    finish_reason = match reason {
                        "max_tokens" => FinishReason::Length,
                        "tool_use" => FinishReason::ToolCalls,
                        _ => FinishReason::Stop,
                    };
                }
            }
            AnthropicStreamEvent::MessageStop => break,
            AnthropicStreamEvent::Ping | AnthropicStreamEvent::Unknown => {}
        }
    }

    let tool_calls = tool_uses
        .into_values()
        .map(|call| {
            let (plugin_name, function_name) = plugin_function(call.name.as_deref().unwrap_or_default());
            FunctionCall {
                id: call.id.unwrap_or_default(),
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
        provider: "anthropic".to_string(),
        model,
        finish_reason,
    };
    let _ = tx.send(Ok(GenerationFragment::Done(response))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_message_maps_to_tool_result_block() {
        let message = ChatMessage::tool_result("call_1", "42");
        let anthropic = to_anthropic_message(&message).unwrap();
        assert!(matches!(anthropic.content[0], AnthropicContentBlock::ToolResult { .. }));
    }

    #[test]
    fn stream_event_parses_text_delta() {
        let raw = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#;
        let event: AnthropicStreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            AnthropicStreamEvent::ContentBlockDelta { index, delta: AnthropicStreamDelta::TextDelta { text } } => {
                assert_eq!(index, 0);
                assert_eq!(text, "hi");
            }
            _ => panic!("expected a text content_block_delta"),
        }
    }

    #[test]
    fn stream_event_parses_tool_use_start_and_input_delta() {
        let start = r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"call_1","name":"github-create_issue"}}"#;
        let event: AnthropicStreamEvent = serde_json::from_str(start).unwrap();
        let AnthropicStreamEvent::ContentBlockStart { index, content_block } = event else {
            panic!("expected content_block_start")
        };
        assert_eq!(index, 1);
        assert!(matches!(content_block, AnthropicStreamBlockStart::ToolUse { .. }));

        let delta = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"title\":"}}"#;
        let event: AnthropicStreamEvent = serde_json::from_str(delta).unwrap();
        match event {
            AnthropicStreamEvent::ContentBlockDelta { delta: AnthropicStreamDelta::InputJsonDelta { partial_json }, .. } => {
                assert_eq!(partial_json, "{\"title\":");
            }
            _ => panic!("expected an input_json_delta"),
        }
    }

    #[test]
    fn stream_event_parses_message_stop() {
        let raw = r#"{"type":"message_stop"}"#;
        let event: AnthropicStreamEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, AnthropicStreamEvent::MessageStop));
    }
}
