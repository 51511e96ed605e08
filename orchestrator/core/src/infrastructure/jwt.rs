// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Platform-auth JWT validation: JWKS fetching with a TTL cache, and the
//! `JwtValidator` that verifies signature, issuer, audience, and expiry
//! with a clock-skew leeway (`SPEC_FULL.md` §4.1).

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::identity::UserId;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("JWKS endpoint unreachable: {0}")]
    JwksUnreachable(String),
    #[error("no matching key for kid {0:?}")]
    KeyNotFound(Option<String>),
    #[error("token validation failed: {0}")]
    InvalidToken(String),
    #[error("missing bearer token")]
    MissingToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub oid: Option<String>,
}

impl PlatformClaims {
    /// The effective user identifier: the first present of
    /// `preferred_username`, `upn`, `email`, `sub`, `oid`, per
    /// `SPEC_FULL.md` §4.7.1.
    pub fn user_id(&self) -> UserId {
        // `sub` is a mandatory claim, so it is always present; `oid` is kept
        // as a documented fallback for issuers that omit it (not reachable
        // in practice, per RFC 7519 `sub` being REQUIRED).
        UserId::from(
            self.preferred_username
                .clone()
                .or_else(|| self.upn.clone())
                .or_else(|| self.email.clone())
                .unwrap_or_else(|| self.sub.clone()),
        )
    }
}

struct CachedJwks {
    jwks: JwkSet,
    cached_at: SystemTime,
}

/// JWKS client with a one-hour cache, grounded on the same cache-then-fetch
/// shape as `turbomcp-auth`'s `JwksClient`, defaulted to this crate's
/// longer TTL since platform signing keys rotate infrequently.
pub struct JwksClient {
    jwks_uri: String,
    http: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
    ttl: Duration,
}

impl JwksClient {
    pub fn new(jwks_uri: String) -> Self {
        Self {
            jwks_uri,
            http: reqwest::Client::new(),
            cache: RwLock::new(None),
            ttl: Duration::from_secs(3600),
        }
    }

    pub async fn get_jwks(&self) -> Result<JwkSet, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.cached_at.elapsed().unwrap_or(Duration::MAX) < self.ttl {
                    debug!(jwks_uri = %self.jwks_uri, "using cached JWKS");
                    return Ok(entry.jwks.clone());
                }
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<JwkSet, AuthError> {
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::JwksUnreachable(e.to_string()))?;
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::JwksUnreachable(e.to_string()))?;
        let mut cache = self.cache.write().await;
        *cache = Some(CachedJwks { jwks: jwks.clone(), cached_at: SystemTime::now() });
        Ok(jwks)
    }
}

/// Validates platform-issued JWTs against a JWKS endpoint: signature,
/// issuer, audience, expiry, with clock-skew leeway.
pub struct JwtValidator {
    expected_issuer: String,
    expected_audience: String,
    jwks_client: Arc<JwksClient>,
    clock_skew_leeway: Duration,
}

impl JwtValidator {
    pub fn new(expected_issuer: String, expected_audience: String, jwks_uri: String) -> Self {
        Self {
            expected_issuer,
            expected_audience,
            jwks_client: Arc::new(JwksClient::new(jwks_uri)),
            clock_skew_leeway: Duration::from_secs(60),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<PlatformClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header.kid.clone();

        let jwks = self.jwks_client.get_jwks().await?;
        let jwk = kid
            .as_deref()
            .and_then(|kid| jwks.find(kid))
            .or_else(|| jwks.keys.first())
            .ok_or_else(|| AuthError::KeyNotFound(kid.clone()))?;

        let decoding_key = DecodingKey::from_jwk(jwk).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.expected_audience]);
        validation.set_issuer(&[&self.expected_issuer]);
        validation.leeway = self.clock_skew_leeway.as_secs();

        let data = decode::<PlatformClaims>(token, &decoding_key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(data.claims)
    }

    /// Force a JWKS refresh and retry once — the rotation-recovery path a
    /// failed validation should take before giving up.
    pub async fn validate_with_refresh(&self, token: &str) -> Result<PlatformClaims, AuthError> {
        match self.validate(token).await {
            Ok(claims) => Ok(claims),
            Err(_) => {
                warn!("JWT validation failed, forcing JWKS refresh and retrying once");
                self.jwks_client.refresh().await?;
                self.validate(token).await
            }
        }
    }
}
