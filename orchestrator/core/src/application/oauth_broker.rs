// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Downstream OAuth2 brokering: resolve a bearer header for a specific user
//! and MCP server, refreshing or raising an auth challenge as needed
//! (`SPEC_FULL.md` §4.7.2).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::auth::{build_composite_key, AuthRequired, OAuth2AuthData};
use crate::domain::identity::{SessionId, UserId};
use crate::domain::mcp::McpServerConfig;
use crate::domain::repository::AuthStorageRepository;
use crate::infrastructure::oauth2_client::{OAuth2Client, OAuth2ClientError};

#[derive(Debug, thiserror::Error)]
pub enum OAuthCallbackError {
    #[error("no authorization flow pending for this flow_id")]
    UnknownFlow,
    #[error(transparent)]
    Exchange(#[from] OAuth2ClientError),
    #[error(transparent)]
    Repository(#[from] crate::domain::repository::RepositoryError),
}

/// The state an in-flight authorization-code flow needs to remember between
/// issuing the redirect and the callback landing on the verify endpoint.
struct PendingFlow {
    user_id: UserId,
    session_id: SessionId,
    auth_server: String,
    scopes: Vec<String>,
    pkce_verifier: String,
}

/// One OAuth2 client per configured `auth_server`, built at the composition
/// root from whatever static app registration this deployment holds.
pub struct OAuthBroker {
    auth_storage: Arc<dyn AuthStorageRepository>,
    clients: HashMap<String, Arc<OAuth2Client>>,
    pending: DashMap<String, PendingFlow>,
}

impl OAuthBroker {
    pub fn new(auth_storage: Arc<dyn AuthStorageRepository>, clients: HashMap<String, Arc<OAuth2Client>>) -> Self {
        Self { auth_storage, clients, pending: DashMap::new() }
    }

    /// Resolve an `Authorization` header for `(user_id, server_config)`,
    /// refreshing an expired token once before giving up.
    pub async fn resolve_headers(
        &self,
        server_config: &McpServerConfig,
        user_id: &UserId,
    ) -> Result<HashMap<String, String>, AuthRequired> {
        let (Some(auth_server), scopes) = (server_config.auth_server.clone(), server_config.scopes.clone()) else {
            return Ok(server_config.static_headers_excluding_authorization());
        };

        let challenge = || AuthRequired {
            server_name: server_config.name.clone(),
            auth_server: auth_server.clone(),
            scopes: scopes.clone(),
        };

        let composite_key = build_composite_key(&auth_server, &scopes);

        let stored = self
            .auth_storage
            .find_token(user_id, &composite_key)
            .await
            .map_err(|e| {
                warn!(server = %server_config.name, error = %e, "auth storage lookup failed");
                challenge()
            })?;

        match stored {
            Some(token) if token.is_usable(Utc::now()) => Ok(bearer_header(&token)),
            Some(token) => self.refresh_or_challenge(&auth_server, &scopes, user_id, &composite_key, token, challenge).await,
            None => Err(challenge()),
        }
    }

    async fn refresh_or_challenge(
        &self,
        auth_server: &str,
        scopes: &[String],
        user_id: &UserId,
        composite_key: &str,
        expired: OAuth2AuthData,
        challenge: impl Fn() -> AuthRequired,
    ) -> Result<HashMap<String, String>, AuthRequired> {
        let Some(refresh_token) = expired.refresh_token.clone() else {
            let _ = self.auth_storage.delete_token(user_id, composite_key).await;
            return Err(challenge());
        };
        let Some(client) = self.clients.get(auth_server) else {
            let _ = self.auth_storage.delete_token(user_id, composite_key).await;
            return Err(challenge());
        };

        match client.refresh(&refresh_token, scopes.to_vec()).await {
            Ok(refreshed) => {
                if let Err(e) = self.auth_storage.save_token(user_id, composite_key, &refreshed).await {
                    warn!(error = %e, "failed to persist refreshed token");
                }
                info!(%user_id, auth_server, "OAuth2 token refreshed");
                Ok(bearer_header(&refreshed))
            }
            Err(e) => {
                warn!(%user_id, auth_server, error = %e, "OAuth2 refresh failed");
                let _ = self.auth_storage.delete_token(user_id, composite_key).await;
                Err(challenge())
            }
        }
    }

    /// Build the authorization URL (with a fresh CSRF state) for a
    /// challenge surfaced to the client as part of `AuthChallengeResponse`,
    /// stashing the PKCE verifier and the requesting user/session keyed by
    /// that state until the callback lands on the verify endpoint.
    pub fn begin_flow(&self, user_id: &UserId, session_id: SessionId, challenge: &AuthRequired) -> Option<String> {
        let client = self.clients.get(&challenge.auth_server)?;
        let state = Uuid::new_v4().to_string();
        let (url, pkce_verifier) = client.authorization_url(&challenge.scopes, state.clone());
        self.pending.insert(
            state,
            PendingFlow {
                user_id: user_id.clone(),
                session_id,
                auth_server: challenge.auth_server.clone(),
                scopes: challenge.scopes.clone(),
                pkce_verifier,
            },
        );
        Some(url)
    }

    /// Complete a pending authorization-code flow: exchange the code,
    /// persist the token, and return the `(user_id, session_id)` the
    /// verify endpoint should re-trigger discovery for.
    pub async fn complete_flow(&self, flow_id: &str, code: String) -> Result<(UserId, SessionId), OAuthCallbackError> {
        let (_, flow) = self.pending.remove(flow_id).ok_or(OAuthCallbackError::UnknownFlow)?;
        let client = self.clients.get(&flow.auth_server).ok_or(OAuthCallbackError::UnknownFlow)?;
        let token = client.exchange_code(code, flow.pkce_verifier, flow.scopes.clone()).await?;
        self.store_token(&flow.user_id, &flow.auth_server, &flow.scopes, token).await?;
        info!(user_id = %flow.user_id, auth_server = %flow.auth_server, "OAuth2 authorization flow completed");
        Ok((flow.user_id, flow.session_id))
    }

    pub async fn store_token(
        &self,
        user_id: &UserId,
        auth_server: &str,
        scopes: &[String],
        token: OAuth2AuthData,
    ) -> Result<(), crate::domain::repository::RepositoryError> {
        let composite_key = build_composite_key(auth_server, scopes);
        self.auth_storage.save_token(user_id, &composite_key, &token).await
    }
}

fn bearer_header(token: &OAuth2AuthData) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Authorization".to_string(), format!("Bearer {}", token.access_token));
    headers
}
