// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ephemeral MCP client sessions built on the official `rmcp` SDK
//! (https://github.com/modelcontextprotocol/rust-sdk). Every discovery or
//! invocation opens a fresh connection, performs the initialize handshake,
//! does its one piece of work, and closes — no session pooling, matching
//! the stateless-per-call model in `SPEC_FULL.md` §4.3/§4.4.

use std::collections::HashMap;
use std::time::Duration;

use rmcp::model::{CallToolRequestParam, InitializeRequestParam};
use rmcp::service::{serve_client, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::ServiceExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::domain::mcp::{McpServerConfig, McpToolMetadata, Transport};

#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("failed to spawn MCP server process: {0}")]
    Spawn(String),
    #[error("MCP handshake failed: {0}")]
    Handshake(String),
    #[error("MCP request timed out after {0:?}")]
    Timeout(Duration),
    #[error("MCP request failed: {0}")]
    Request(String),
    #[error("server config is missing a required field for its transport: {0}")]
    InvalidConfig(String),
}

/// A connected-but-unowned MCP session: opened for exactly one discovery or
/// invocation call, then dropped. `rmcp`'s `RunningService` is cancelled on
/// drop, so closing is implicit.
pub struct EphemeralMcpSession {
    service: RunningService<RoleClient, ()>,
}

impl EphemeralMcpSession {
    /// Open a connection using only the server's static configuration — no
    /// resolved auth. Used for servers with no `auth_server` configured.
    pub async fn open(config: &McpServerConfig) -> Result<Self, McpClientError> {
        Self::open_with_headers(config, &HashMap::new()).await
    }

    /// Open a connection with headers resolved at call time (§4.4 step 1):
    /// the downstream `Authorization` bearer and/or the user-context header
    /// (`user_id_header`), merged over the server's static configuration.
    pub async fn open_with_headers(
        config: &McpServerConfig,
        resolved_headers: &HashMap<String, String>,
    ) -> Result<Self, McpClientError> {
        let client_info = InitializeRequestParam::default();

        let service = match config.transport {
            Transport::Stdio => {
                let command_str = config
                    .command
                    .as_ref()
                    .ok_or_else(|| McpClientError::InvalidConfig("command required for stdio transport".into()))?;
                let mut command = Command::new(command_str);
                command
                    .args(&config.args)
                    .envs(&config.env)
                    .envs(resolved_headers.iter().map(|(k, v)| (k.clone(), v.clone())))
                    .kill_on_drop(true);
                let transport = TokioChildProcess::new(command)
                    .map_err(|e| McpClientError::Spawn(e.to_string()))?;
                serve_client(client_info, transport)
                    .await
                    .map_err(|e| McpClientError::Handshake(e.to_string()))?
            }
            Transport::Http => {
                let url = config
                    .url
                    .as_ref()
                    .ok_or_else(|| McpClientError::InvalidConfig("url required for http transport".into()))?;
                let http_client = build_http_client(config, resolved_headers)?;
                let transport_config = StreamableHttpClientTransportConfig::with_uri(url.clone());
                let transport = StreamableHttpClientTransport::with_client(http_client, transport_config);
                serve_client(client_info, transport)
                    .await
                    .map_err(|e| McpClientError::Handshake(e.to_string()))?
            }
        };

        Ok(Self { service })
    }

    /// Run `tools/list` and translate into this crate's serializable
    /// metadata shape; governance is derived separately by the catalog.
    pub async fn list_tools(
        &self,
        timeout: Duration,
    ) -> Result<Vec<McpToolMetadata>, McpClientError> {
        let server_name = self
            .service
            .peer_info()
            .map(|info| info.server_info.name.clone())
            .unwrap_or_default();

        let result = tokio::time::timeout(timeout, self.service.list_all_tools())
            .await
            .map_err(|_| McpClientError::Timeout(timeout))?
            .map_err(|e| McpClientError::Request(e.to_string()))?;

        Ok(result
            .into_iter()
            .map(|tool| McpToolMetadata {
                server_name: server_name.clone(),
                tool_name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: serde_json::to_value(&tool.input_schema).unwrap_or(serde_json::Value::Null),
                annotations: crate::domain::mcp::ToolAnnotations {
                    read_only_hint: tool.annotations.as_ref().and_then(|a| a.read_only_hint),
                    destructive_hint: tool.annotations.as_ref().and_then(|a| a.destructive_hint),
                },
                governance: crate::domain::governance::Governance::unannotated(),
            })
            .collect())
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<String, McpClientError> {
        let params = CallToolRequestParam {
            name: tool_name.to_string().into(),
            arguments: arguments.as_object().cloned(),
        };

        let result = tokio::time::timeout(timeout, self.service.call_tool(params))
            .await
            .map_err(|_| McpClientError::Timeout(timeout))?
            .map_err(|e| McpClientError::Request(e.to_string()))?;

        let text = result
            .content
            .into_iter()
            .filter_map(|content| content.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            Err(McpClientError::Request(text))
        } else {
            Ok(text)
        }
    }
}

fn build_http_client(
    config: &McpServerConfig,
    resolved_headers: &HashMap<String, String>,
) -> Result<reqwest::Client, McpClientError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in config.static_headers_excluding_authorization().into_iter().chain(resolved_headers.clone()) {
        if let (Ok(name), Ok(val)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(&value),
        ) {
            headers.insert(name, val);
        }
    }

    reqwest::Client::builder()
        .timeout(config.timeout)
        .default_headers(headers)
        .danger_accept_invalid_certs(!config.verify_ssl)
        .build()
        .map_err(|e| McpClientError::Spawn(e.to_string()))
}

/// Discover tool metadata across a set of MCP servers, tolerant of
/// individual server failures — a server that errors during discovery is
/// logged and skipped rather than failing the whole catalog build
/// (`SPEC_FULL.md` §4.3 step 2c).
pub async fn discover_all(
    configs: &[McpServerConfig],
) -> HashMap<String, Result<Vec<McpToolMetadata>, McpClientError>> {
    let mut results = HashMap::new();
    for config in configs {
        info!(server = %config.name, "discovering MCP tools");
        let outcome = match EphemeralMcpSession::open(config).await {
            Ok(session) => session.list_tools(config.timeout).await,
            Err(e) => Err(e),
        };
        if let Err(ref e) = outcome {
            warn!(server = %config.name, error = %e, "MCP discovery failed");
        }
        results.insert(config.name.clone(), outcome);
    }
    results
}
