// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! OAuth2 authorization-code-with-PKCE client used by the auth broker to
//! exchange codes and refresh tokens against the `auth_server` named in an
//! MCP server's configuration (`SPEC_FULL.md` §4.4).

use chrono::{Duration as ChronoDuration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};

use crate::domain::auth::OAuth2AuthData;

#[derive(Debug, thiserror::Error)]
pub enum OAuth2ClientError {
    #[error("invalid OAuth2 endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// One client per `(auth_server, client_id)` pair. Built by the auth broker
/// from whatever static OAuth2 app registration it holds for a given
/// upstream MCP auth server.
pub struct OAuth2Client {
    client: ConfiguredClient,
    http: reqwest::Client,
}

impl OAuth2Client {
    pub fn new(
        client_id: String,
        client_secret: Option<String>,
        auth_url: String,
        token_url: String,
        redirect_url: String,
    ) -> Result<Self, OAuth2ClientError> {
        let auth_url = AuthUrl::new(auth_url).map_err(|e| OAuth2ClientError::InvalidUrl(e.to_string()))?;
        let token_url = TokenUrl::new(token_url).map_err(|e| OAuth2ClientError::InvalidUrl(e.to_string()))?;
        let redirect_url =
            RedirectUrl::new(redirect_url).map_err(|e| OAuth2ClientError::InvalidUrl(e.to_string()))?;

        let mut client = BasicClient::new(ClientId::new(client_id))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);
        if let Some(secret) = client_secret {
            client = client.set_client_secret(ClientSecret::new(secret));
        }

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| OAuth2ClientError::InvalidUrl(e.to_string()))?;

        Ok(Self { client, http })
    }

    /// Build the authorization URL a user must visit, returning it alongside
    /// the PKCE verifier the caller must hold onto (keyed by the CSRF state)
    /// until the redirect comes back with a code.
    pub fn authorization_url(&self, scopes: &[String], csrf_state: String) -> (String, String) {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (auth_url, _state) = self
            .client
            .authorize_url(|| CsrfToken::new(csrf_state))
            .add_scopes(scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(pkce_challenge)
            .url();

        (auth_url.to_string(), pkce_verifier.secret().to_string())
    }

    pub async fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
        scopes: Vec<String>,
    ) -> Result<OAuth2AuthData, OAuth2ClientError> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
            .request_async(&self.http)
            .await
            .map_err(|e| OAuth2ClientError::ExchangeFailed(e.to_string()))?;

        Ok(to_auth_data(&response, scopes))
    }

    pub async fn refresh(
        &self,
        refresh_token: &str,
        scopes: Vec<String>,
    ) -> Result<OAuth2AuthData, OAuth2ClientError> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| OAuth2ClientError::RefreshFailed(e.to_string()))?;

        Ok(to_auth_data(&response, scopes))
    }
}

fn to_auth_data(
    response: &oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    fallback_scopes: Vec<String>,
) -> OAuth2AuthData {
    let expires_at = response
        .expires_in()
        .map(|duration| Utc::now() + ChronoDuration::from_std(duration).unwrap_or_default())
        .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(1));

    let scopes = response
        .scopes()
        .map(|scopes| scopes.iter().map(|s| s.as_str().to_string()).collect())
        .unwrap_or(fallback_scopes);

    OAuth2AuthData {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_at,
        scopes,
    }
}
