// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The declarative agent configuration file (`SPEC_FULL.md` §6), a
//! Kubernetes-style manifest in the same `apiVersion`/`kind`/`metadata`/`spec`
//! shape as the teacher's `NodeConfigManifest`, trimmed to the fields this
//! spec actually names and extended with `mcp_servers`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::mcp::McpServerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub name: String,
    pub version: String,
    pub spec: AgentConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigSpec {
    pub agent: AgentDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub remote_plugins: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Max agent-loop rounds before the LLM's own stop conditions are
    /// treated as having failed to converge (`SPEC_FULL.md` §4.2).
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub mount_path: Option<String>,
}

fn default_max_rounds() -> u32 {
    25
}

/// Parsed agent configuration, ready for the composition root to build a
/// [`crate::application::request_handler::RequestHandlerService`] from.
pub fn parse_manifest(yaml_or_json: &str) -> Result<AgentConfigManifest, serde_yaml::Error> {
    serde_yaml::from_str(yaml_or_json)
}

/// Native (non-MCP) tool registered with a static governance entry at
/// startup — the other source the plugin catalog is populated from
/// (`SPEC_FULL.md` §4.6), distinct from the dynamic MCP-discovered entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativePluginConfig {
    pub plugin_id: String,
    pub functions: HashMap<String, NativeFunctionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeFunctionConfig {
    pub description: String,
    pub input_schema: serde_json::Value,
    pub requires_hitl: bool,
}
