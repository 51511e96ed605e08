// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-user MCP discovery and materialization: at session start, discover
//! the tool set a given user is authorized to see so per-request agent
//! builds only ever *instantiate* plugin classes from already-materialized
//! state (`SPEC_FULL.md` §4.3).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::catalog::{derive_mcp_governance, PluginCatalog};
use crate::application::oauth_broker::OAuthBroker;
use crate::domain::auth::AuthRequired;
use crate::domain::governance::PluginTool;
use crate::domain::identity::{SessionId, UserId};
use crate::domain::mcp::{McpServerConfig, McpToolMetadata, ServerDiscoveryState};
use crate::domain::repository::SessionStateRepository;
use crate::domain::session_state::SessionState;
use crate::infrastructure::mcp_client::EphemeralMcpSession;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryOutcome {
    #[error("authorization required from one or more MCP servers")]
    AuthRequired(Vec<AuthRequired>),
    #[error("session state persistence failed: {0}")]
    Repository(#[from] crate::domain::repository::RepositoryError),
}

/// Materializes MCP tool catalogs per `(user_id, session_id)`. The storage
/// key enforces per-user isolation; a cache miss for one user never serves
/// another user's discovery results (`SPEC_FULL.md` §4.3 "Per-user
/// isolation invariant").
pub struct McpRegistry {
    session_state: Arc<dyn SessionStateRepository>,
    catalog: Arc<PluginCatalog>,
    oauth_broker: Arc<OAuthBroker>,
    locks: DashMap<(UserId, SessionId), Arc<Mutex<()>>>,
}

impl McpRegistry {
    pub fn new(
        session_state: Arc<dyn SessionStateRepository>,
        catalog: Arc<PluginCatalog>,
        oauth_broker: Arc<OAuthBroker>,
    ) -> Self {
        Self { session_state, catalog, oauth_broker, locks: DashMap::new() }
    }

    fn lock_for(&self, user_id: &UserId, session_id: SessionId) -> Arc<Mutex<()>> {
        self.locks.entry((user_id.clone(), session_id)).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Double-checked-locking discovery: cheap read check, acquire the
    /// per-`(user_id, session_id)` lock on a miss, re-check, then run
    /// discovery against every configured server independently.
    pub async fn discover_and_materialize(
        &self,
        user_id: &UserId,
        session_id: SessionId,
        servers: &[McpServerConfig],
    ) -> Result<(), DiscoveryOutcome> {
        if self.already_discovered(user_id, session_id).await? {
            return Ok(());
        }

        let lock = self.lock_for(user_id, session_id);
        let _guard = lock.lock().await;

        if self.already_discovered(user_id, session_id).await? {
            return Ok(());
        }

        let mut state = SessionState::new();
        let mut auth_required = Vec::new();

        for server in servers {
            match self.discover_one(user_id, session_id, server).await {
                Ok(discovery) => {
                    state.per_server.insert(server.name.clone(), discovery);
                }
                Err(challenge) => {
                    warn!(server = %server.name, %user_id, "MCP server requires downstream authorization");
                    auth_required.push(challenge);
                }
            }
        }

        if !auth_required.is_empty() {
            // Persist what did succeed so a retry after the OAuth callback
            // does not re-discover already-authorized servers.
            self.session_state.save(user_id, session_id, &state).await?;
            return Err(DiscoveryOutcome::AuthRequired(auth_required));
        }

        state.discovery_complete = true;
        self.session_state.save(user_id, session_id, &state).await?;
        info!(%user_id, %session_id, server_count = servers.len(), "MCP discovery complete");
        Ok(())
    }

    async fn already_discovered(&self, user_id: &UserId, session_id: SessionId) -> Result<bool, DiscoveryOutcome> {
        Ok(self
            .session_state
            .find(user_id, session_id)
            .await?
            .map(|state| state.discovery_complete)
            .unwrap_or(false))
    }

    async fn discover_one(
        &self,
        user_id: &UserId,
        _session_id: SessionId,
        server: &McpServerConfig,
    ) -> Result<ServerDiscoveryState, AuthRequired> {
        let mut headers = self.oauth_broker.resolve_headers(server, user_id).await?;

        if let Some(header_name) = &server.user_id_header {
            headers.insert(header_name.clone(), user_id.to_string());
        }

        let challenge = || AuthRequired {
            server_name: server.name.clone(),
            auth_server: server.auth_server.clone().unwrap_or_default(),
            scopes: server.scopes.clone(),
        };

        let session = EphemeralMcpSession::open_with_headers(server, &headers).await.map_err(|e| {
            warn!(server = %server.name, error = %e, "MCP discovery connection failed");
            challenge()
        })?;

        let tools = session.list_tools(server.timeout).await.map_err(|e| {
            warn!(server = %server.name, error = %e, "MCP list_tools failed");
            challenge()
        })?;

        let materialized: Vec<McpToolMetadata> = tools
            .into_iter()
            .map(|mut tool| {
                let override_ = server.tool_governance_overrides.get(&tool.tool_name);
                tool.governance = derive_mcp_governance(
                    &tool.annotations,
                    &tool.description,
                    &tool.tool_name,
                    server.trust_level,
                    override_,
                );
                self.catalog.register(PluginTool {
                    tool_id: format!("mcp_{}-{}", server.name, tool.tool_name),
                    plugin_id: format!("mcp_{}", server.name),
                    name: tool.tool_name.clone(),
                    description: tool.description.clone(),
                    governance: tool.governance,
                    input_schema: tool.input_schema.clone(),
                    auth: server.auth_server.clone(),
                });
                tool
            })
            .collect();

        Ok(ServerDiscoveryState { plugin_data: materialized, mcp_session_id: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::{InMemoryAuthStorageRepository, InMemorySessionStateRepository};
    use std::collections::HashMap;

    #[tokio::test]
    async fn two_users_never_see_each_others_state() {
        let session_repo = Arc::new(InMemorySessionStateRepository::new());
        let catalog = Arc::new(PluginCatalog::new());
        let auth_storage = Arc::new(InMemoryAuthStorageRepository::new());
        let broker = Arc::new(OAuthBroker::new(auth_storage, HashMap::new()));
        let registry = McpRegistry::new(session_repo.clone(), catalog, broker);

        let session_id = SessionId::new();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        // No servers configured: discovery trivially completes for each
        // user independently, and each gets its own session-state entry.
        registry.discover_and_materialize(&alice, session_id, &[]).await.unwrap();
        registry.discover_and_materialize(&bob, session_id, &[]).await.unwrap();

        let alice_state = session_repo.find(&alice, session_id).await.unwrap().unwrap();
        let bob_state = session_repo.find(&bob, session_id).await.unwrap().unwrap();
        assert!(alice_state.discovery_complete);
        assert!(bob_state.discovery_complete);
    }

    #[tokio::test]
    async fn repeated_discovery_is_idempotent_and_skips_rerun() {
        let session_repo = Arc::new(InMemorySessionStateRepository::new());
        let catalog = Arc::new(PluginCatalog::new());
        let auth_storage = Arc::new(InMemoryAuthStorageRepository::new());
        let broker = Arc::new(OAuthBroker::new(auth_storage, HashMap::new()));
        let registry = McpRegistry::new(session_repo, catalog, broker);

        let session_id = SessionId::new();
        let alice = UserId::from("alice");
        registry.discover_and_materialize(&alice, session_id, &[]).await.unwrap();
        registry.discover_and_materialize(&alice, session_id, &[]).await.unwrap();
    }
}
