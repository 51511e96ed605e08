// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The function-dispatch kernel: an interface over a capability set
//! (`{get_function_signatures, invoke}`) with two implementations — native
//! in-process plugins and MCP plugins that delegate to an ephemeral
//! connection — treated uniformly by the agent loop (`SPEC_FULL.md` §9).
//!
//! MCP plugin instances carry an owned copy of the configuration subset
//! they need (`server_config`, tool metadata, `user_id`, `session_id`)
//! rather than a back-reference into the registry, avoiding the cyclic
//! kernel↔plugin↔registry graph the design notes call out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::application::oauth_broker::OAuthBroker;
use crate::domain::identity::{SessionId, UserId};
use crate::domain::llm::ToolSpec;
use crate::domain::mcp::{McpServerConfig, McpToolMetadata};
use crate::domain::task::FunctionCall;
use crate::infrastructure::mcp_client::EphemeralMcpSession;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("no plugin registered for '{0}'")]
    UnknownPlugin(String),
    #[error("downstream authorization required for server '{0}'")]
    AuthRequired(String),
    #[error("MCP call failed: {0}")]
    Mcp(#[from] crate::infrastructure::mcp_client::McpClientError),
    #[error("native function failed: {0}")]
    Native(String),
}

/// A native, in-process tool. Implementations are out of scope for this
/// crate (`SPEC_FULL.md` §1); this trait only fixes the seam the kernel
/// dispatches across.
#[async_trait]
pub trait NativeFunction: Send + Sync {
    async fn invoke(&self, function_name: &str, arguments: serde_json::Value) -> Result<String, KernelError>;

    /// The function signatures this plugin exposes to the LLM, under the
    /// given plugin name. Static metadata, never requires network access.
    fn function_specs(&self, plugin_name: &str) -> Vec<ToolSpec>;
}

/// The value-copy an MCP plugin instance holds: everything §4.4's
/// stateless call needs, re-resolved at call time rather than cached.
#[derive(Clone)]
pub struct McpPluginInstance {
    pub server_config: McpServerConfig,
    pub tool_metadata: Vec<McpToolMetadata>,
    pub user_id: UserId,
    pub session_id: SessionId,
}

/// Owned per request/build, keyed by `plugin_id` (`"mcp_{server}"` for MCP
/// plugins, the plugin's own name for native ones). Never reaches across
/// the network during construction — MCP plugin instances are built from
/// already-materialized session state (`SPEC_FULL.md` §4.3).
pub struct Kernel {
    native: HashMap<String, Arc<dyn NativeFunction>>,
    mcp_plugins: HashMap<String, McpPluginInstance>,
    oauth_broker: Arc<OAuthBroker>,
}

impl Kernel {
    pub fn new(
        native: HashMap<String, Arc<dyn NativeFunction>>,
        mcp_plugins: HashMap<String, McpPluginInstance>,
        oauth_broker: Arc<OAuthBroker>,
    ) -> Self {
        Self { native, mcp_plugins, oauth_broker }
    }

    pub async fn dispatch(&self, call: &FunctionCall) -> Result<String, KernelError> {
        if let Some(plugin) = self.mcp_plugins.get(&call.plugin_name) {
            return self.dispatch_mcp(plugin, call).await;
        }
        if let Some(native) = self.native.get(&call.plugin_name) {
            return native.invoke(&call.function_name, call.arguments.clone()).await;
        }
        Err(KernelError::UnknownPlugin(call.plugin_name.clone()))
    }

    async fn dispatch_mcp(&self, plugin: &McpPluginInstance, call: &FunctionCall) -> Result<String, KernelError> {
        // Re-resolve auth at call time: the session-start token may have
        // been refreshed or invalidated since discovery (§4.4 step 1).
        let mut headers = self
            .oauth_broker
            .resolve_headers(&plugin.server_config, &plugin.user_id)
            .await
            .map_err(|_| KernelError::AuthRequired(plugin.server_config.name.clone()))?;

        if let Some(header_name) = &plugin.server_config.user_id_header {
            headers.insert(header_name.clone(), plugin.user_id.to_string());
        }

        let session = EphemeralMcpSession::open_with_headers(&plugin.server_config, &headers).await?;
        let timeout = plugin.server_config.timeout.max(Duration::from_secs(1));
        let result = session.call_tool(&call.function_name, call.arguments.clone(), timeout).await?;
        Ok(result)
    }

    /// Every function the LLM may currently call: the static native set plus
    /// whatever this kernel's MCP plugin instances discovered. Recomputed
    /// per kernel build rather than cached, matching the rest of the
    /// discovery-is-stateless-per-request design (`SPEC_FULL.md` §4.2).
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = Vec::new();
        for (plugin_name, native) in &self.native {
            specs.extend(native.function_specs(plugin_name));
        }
        for (plugin_name, plugin) in &self.mcp_plugins {
            for tool in &plugin.tool_metadata {
                specs.push(ToolSpec {
                    plugin_name: plugin_name.clone(),
                    function_name: tool.tool_name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                });
            }
        }
        specs
    }
}
