// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The plugin catalog: single source of truth for governance policy,
//! populated from a static native-tool set at startup and from MCP
//! discovery thereafter (`SPEC_FULL.md` §4.6).

use dashmap::DashMap;

use crate::domain::agent_config::NativePluginConfig;
use crate::domain::governance::{Cost, DataSensitivity, Governance, PluginTool};
use crate::domain::mcp::{GovernanceOverride, ToolAnnotations, TrustLevel};

/// High-risk keywords that escalate an otherwise-safe tool to HITL even
/// when a server claims `readOnlyHint:true` — defense-in-depth against a
/// misbehaving or compromised MCP server.
const RISK_KEYWORDS: &[&str] = &["delete", "execute", "write", "payment", "transfer", "drop", "remove"];

fn mentions_risk_keyword(description: &str, name: &str) -> bool {
    let haystack = format!("{description} {name}").to_lowercase();
    RISK_KEYWORDS.iter().any(|kw| haystack.contains(kw))
}

/// Derive governance for a discovered MCP tool: annotations, then keyword
/// escalation, then trust level, then per-tool override — in that order
/// (`SPEC_FULL.md` §4.6).
pub fn derive_mcp_governance(
    annotations: &ToolAnnotations,
    description: &str,
    name: &str,
    trust_level: TrustLevel,
    override_: Option<&GovernanceOverride>,
) -> Governance {
    let mut governance = match (annotations.destructive_hint, annotations.read_only_hint) {
        (Some(true), _) => Governance { requires_hitl: true, cost: Cost::High, data_sensitivity: DataSensitivity::Sensitive },
        (_, Some(true)) => Governance { requires_hitl: false, cost: Cost::Low, data_sensitivity: DataSensitivity::Public },
        _ => Governance::unannotated(),
    };

    let keyword_escalated = mentions_risk_keyword(description, name);
    if keyword_escalated {
        governance.requires_hitl = true;
    }

    match trust_level {
        TrustLevel::Untrusted | TrustLevel::Sandboxed => {
            governance.requires_hitl = true;
        }
        TrustLevel::Trusted => {
            // Keep the annotation-derived value, but never relax below the
            // keyword-escalated floor.
            if keyword_escalated {
                governance.requires_hitl = true;
            }
        }
    }

    if let Some(override_) = override_ {
        if let Some(requires_hitl) = override_.requires_hitl {
            // Untrusted servers never get to relax requires_hitl back to
            // false via a per-tool override; sandboxed and trusted ones can.
            if trust_level != TrustLevel::Untrusted || requires_hitl {
                governance.requires_hitl = requires_hitl;
            }
        }
        if let Some(cost) = override_.cost {
            governance.cost = cost;
        }
        if let Some(sensitivity) = override_.data_sensitivity {
            governance.data_sensitivity = sensitivity;
        }
    }

    governance
}

/// `tool_id`-keyed map of every invocable function, native or MCP-backed.
/// Mostly-read with occasional append-on-discovery, matching the
/// concurrency profile `SPEC_FULL.md` §5 calls for.
#[derive(Default)]
pub struct PluginCatalog {
    tools: DashMap<String, PluginTool>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tool_id: &str) -> Option<PluginTool> {
        self.tools.get(tool_id).map(|entry| entry.value().clone())
    }

    /// Additive: a duplicate `tool_id` replaces the prior entry. Used both
    /// for static native registration at startup and for dynamic MCP
    /// discovery — hot reload is only supported across session boundaries.
    pub fn register(&self, tool: PluginTool) {
        self.tools.insert(tool.tool_id.clone(), tool);
    }
}

/// Register every function of a statically configured native plugin into
/// the catalog — the startup-time counterpart to MCP discovery's dynamic
/// registration (`SPEC_FULL.md` §4.6: "Populated from two sources").
pub fn register_native_plugin(catalog: &PluginCatalog, config: &NativePluginConfig) {
    for (function_name, function) in &config.functions {
        catalog.register(PluginTool {
            tool_id: PluginTool::tool_id_for(&config.plugin_id, function_name),
            plugin_id: config.plugin_id.clone(),
            name: function_name.clone(),
            description: function.description.clone(),
            governance: if function.requires_hitl { Governance::destructive() } else { Governance::no_hitl() },
            input_schema: function.input_schema.clone(),
            auth: None,
        });
    }
}
