// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! MCP (Model Context Protocol) domain types: the declarative server
//! configuration (`McpServerConfig`), the serializable metadata discovery
//! produces, and the per-(user, session) state the registry materializes
//! from it. Keeps the teacher's JSON-RPC error shape ([`MCPError`]) since
//! the wire-level error envelope is unchanged by this crate's different
//! transport target (remote MCP servers, not orchestrator-spawned ones).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::governance::Governance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Sandboxed,
    Untrusted,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::Untrusted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIdSource {
    Auth,
    Env,
}

/// Field-by-field overrides applied last in governance derivation
/// (`SPEC_FULL.md` §4.6 step 4). Every field is optional: only provided
/// fields replace the derived value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceOverride {
    pub requires_hitl: Option<bool>,
    pub cost: Option<crate::domain::governance::Cost>,
    pub data_sensitivity: Option<crate::domain::governance::DataSensitivity>,
}

/// Declarative configuration for one remote MCP server, part of the agent
/// configuration file (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: Transport,
    pub url: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_sse_read_timeout")]
    pub sse_read_timeout: Duration,
    pub auth_server: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub tool_governance_overrides: HashMap<String, GovernanceOverride>,
    pub user_id_header: Option<String>,
    #[serde(default)]
    pub user_id_source: Option<UserIdSource>,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sse_read_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_verify_ssl() -> bool {
    true
}

impl McpServerConfig {
    /// Safety check from §4.3 step 2a: static `Authorization` headers are
    /// rejected once an `auth_server` is also configured, since the two
    /// mechanisms would silently race.
    pub fn static_headers_excluding_authorization(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("authorization"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// JSON-RPC-shaped error surfaced by an MCP tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

/// Annotations an MCP server attaches to a tool, consumed by governance
/// derivation (`SPEC_FULL.md` §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAnnotations {
    pub read_only_hint: Option<bool>,
    pub destructive_hint: Option<bool>,
}

/// Serializable tool metadata produced by discovery — the value persisted
/// in session state, never a live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolMetadata {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: ToolAnnotations,
    pub governance: Governance,
}

/// Per-server discovery result persisted in [`crate::domain::session_state::SessionState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDiscoveryState {
    pub plugin_data: Vec<McpToolMetadata>,
    pub mcp_session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_headers_strip_authorization() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer leaked".to_string());
        headers.insert("X-Trace".to_string(), "abc".to_string());
        let config = McpServerConfig {
            name: "github".into(),
            transport: Transport::Http,
            url: Some("https://example.com".into()),
            command: None,
            args: vec![],
            env: HashMap::new(),
            headers,
            timeout: default_timeout(),
            sse_read_timeout: default_sse_read_timeout(),
            auth_server: Some("https://github.com/login/oauth".into()),
            scopes: vec!["repo".into()],
            trust_level: TrustLevel::Untrusted,
            tool_governance_overrides: HashMap::new(),
            user_id_header: None,
            user_id_source: None,
            verify_ssl: true,
        };
        let filtered = config.static_headers_excluding_authorization();
        assert!(!filtered.contains_key("Authorization"));
        assert_eq!(filtered.get("X-Trace"), Some(&"abc".to_string()));
    }
}
