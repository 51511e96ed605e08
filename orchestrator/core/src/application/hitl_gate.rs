// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The HITL gate: given an LLM turn's tool calls, decide whether a human
//! must approve before any of them execute (`SPEC_FULL.md` §4.5).

use std::sync::Arc;

use crate::application::catalog::PluginCatalog;
use crate::domain::governance::PluginTool;
use crate::domain::task::FunctionCall;

pub struct HitlGate {
    catalog: Arc<PluginCatalog>,
}

impl HitlGate {
    pub fn new(catalog: Arc<PluginCatalog>) -> Self {
        Self { catalog }
    }

    /// `Some(calls)` means the whole LLM turn must pause for approval;
    /// `None` means every call in the turn may execute immediately. A turn
    /// is all-or-nothing: one HITL-requiring call pauses the entire batch.
    pub fn evaluate(&self, calls: &[FunctionCall]) -> Option<Vec<FunctionCall>> {
        let any_requires_hitl = calls.iter().any(|call| self.requires_hitl(call));
        any_requires_hitl.then(|| calls.to_vec())
    }

    fn requires_hitl(&self, call: &FunctionCall) -> bool {
        let tool_id = PluginTool::tool_id_for(&call.plugin_name, &call.function_name);
        match self.catalog.get(&tool_id) {
            Some(entry) => entry.governance.requires_hitl,
            // Default policy when discovery/registration somehow missed an
            // entry: native tools default open, MCP tools default closed.
            None => call.plugin_name.starts_with("mcp_"),
        }
    }
}
