// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Platform authentication: "the caller is who they claim to be"
//! (`SPEC_FULL.md` §4.7.1). A JWT-backed implementation for production, a
//! dummy one for tests, selected by a factory per the teacher's
//! configuration-selects-implementation convention.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::identity::UserId;
use crate::infrastructure::jwt::{AuthError, JwtValidator};

#[derive(Debug, thiserror::Error)]
pub enum AuthorizerError {
    #[error("missing or malformed Authorization header")]
    MissingBearer,
    #[error(transparent)]
    Token(#[from] AuthError),
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_request(&self, auth_header: &str) -> Result<UserId, AuthorizerError>;
}

fn extract_bearer(auth_header: &str) -> Result<&str, AuthorizerError> {
    auth_header.strip_prefix("Bearer ").ok_or(AuthorizerError::MissingBearer)
}

/// Verifies the platform JWT against a JWKS endpoint and derives the user
/// id from the first present of `preferred_username`/`upn`/`email`/`sub`/`oid`.
pub struct JwtAuthorizer {
    validator: Arc<JwtValidator>,
}

impl JwtAuthorizer {
    pub fn new(validator: Arc<JwtValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn authorize_request(&self, auth_header: &str) -> Result<UserId, AuthorizerError> {
        let token = extract_bearer(auth_header)?;
        let claims = self.validator.validate_with_refresh(token).await?;
        Ok(claims.user_id())
    }
}

/// Extracts `user_id` directly from the bearer literal — for tests only,
/// never wired in production configuration.
pub struct DummyAuthorizer;

#[async_trait]
impl Authorizer for DummyAuthorizer {
    async fn authorize_request(&self, auth_header: &str) -> Result<UserId, AuthorizerError> {
        let token = extract_bearer(auth_header)?;
        Ok(UserId::from(token))
    }
}

/// Authorizer backend selector, read by the composition root from
/// environment/config and threaded into `OrchestratorConfig` rather than a
/// module-level global (`SPEC_FULL.md` §9).
pub enum AuthorizerBackend {
    Jwt { expected_issuer: String, expected_audience: String, jwks_uri: String },
    Dummy,
}

pub fn create_authorizer(backend: &AuthorizerBackend) -> Arc<dyn Authorizer> {
    match backend {
        AuthorizerBackend::Jwt { expected_issuer, expected_audience, jwks_uri } => {
            let validator = JwtValidator::new(expected_issuer.clone(), expected_audience.clone(), jwks_uri.clone());
            Arc::new(JwtAuthorizer::new(Arc::new(validator)))
        }
        AuthorizerBackend::Dummy => Arc::new(DummyAuthorizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dummy_authorizer_extracts_bearer_literal() {
        let authorizer = DummyAuthorizer;
        let user_id = authorizer.authorize_request("Bearer alice").await.unwrap();
        assert_eq!(user_id, UserId::from("alice"));
    }

    #[tokio::test]
    async fn dummy_authorizer_rejects_missing_bearer_prefix() {
        let authorizer = DummyAuthorizer;
        assert!(authorizer.authorize_request("alice").await.is_err());
    }
}
