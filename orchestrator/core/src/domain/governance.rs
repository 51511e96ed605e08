// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Governance value objects: the policy a [`crate::domain::mcp::McpToolMetadata`]
//! or native tool carries on whether it requires Human-in-the-Loop approval.
//! Derivation itself (annotations → keyword escalation → trust level →
//! overrides) lives in `application::catalog`, which is the single source of
//! truth populating the catalog this module's types describe.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSensitivity {
    Public,
    Proprietary,
    Sensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Governance {
    pub requires_hitl: bool,
    pub cost: Cost,
    pub data_sensitivity: DataSensitivity,
}

impl Governance {
    pub const fn no_hitl() -> Self {
        Self { requires_hitl: false, cost: Cost::Low, data_sensitivity: DataSensitivity::Public }
    }

    pub const fn destructive() -> Self {
        Self { requires_hitl: true, cost: Cost::High, data_sensitivity: DataSensitivity::Sensitive }
    }

    pub const fn read_only() -> Self {
        Self { requires_hitl: false, cost: Cost::Low, data_sensitivity: DataSensitivity::Public }
    }

    /// Secure-by-default: neither `readOnlyHint` nor `destructiveHint` present.
    pub const fn unannotated() -> Self {
        Self { requires_hitl: true, cost: Cost::Medium, data_sensitivity: DataSensitivity::Proprietary }
    }
}

/// A catalog entry: one invocable function, native or MCP-backed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginTool {
    pub tool_id: String,
    pub plugin_id: String,
    pub name: String,
    pub description: String,
    pub governance: Governance,
    pub input_schema: serde_json::Value,
    /// Present for MCP-backed tools; `None` for native plugins.
    pub auth: Option<String>,
}

impl PluginTool {
    pub fn tool_id_for(plugin_name: &str, function_name: &str) -> String {
        format!("{plugin_name}-{function_name}")
    }
}
