// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! OAuth2 token storage value objects and the composite-key construction
//! that keeps per-user, per-scope-set tokens isolated (`SPEC_FULL.md` §4.7.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2AuthData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

/// Small safety margin subtracted from `expires_at` so a token is treated
/// as expired slightly before the server would reject it.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 30;

impl OAuth2AuthData {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - chrono::Duration::seconds(EXPIRY_SAFETY_MARGIN_SECS)
    }
}

/// `"{auth_server}|{sorted_scopes_joined}"` — scope order never affects the
/// key, so identical scope sets always collide and different sets never do.
pub fn build_composite_key(auth_server: &str, scopes: &[String]) -> String {
    let mut sorted: Vec<&str> = scopes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("{auth_server}|{}", sorted.join(","))
}

/// Raised when a request needs a token that is absent or unrecoverably
/// expired; collected across MCP servers into an `AuthChallengeResponse`.
#[derive(Debug, Clone)]
pub struct AuthRequired {
    pub server_name: String,
    pub auth_server: String,
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_ignores_scope_order() {
        let a = build_composite_key("https://as.example", &["repo".into(), "read:user".into()]);
        let b = build_composite_key("https://as.example", &["read:user".into(), "repo".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn composite_key_isolates_different_scope_sets() {
        let a = build_composite_key("https://as.example", &["repo".into()]);
        let b = build_composite_key("https://as.example", &["repo".into(), "admin".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn token_past_expiry_minus_margin_is_unusable() {
        let token = OAuth2AuthData {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(10),
            scopes: vec!["repo".into()],
        };
        assert!(!token.is_usable(Utc::now()));
    }
}
