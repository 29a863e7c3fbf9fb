//! OAuth coordinator: authorization-code flow with CSRF-bound state,
//! token exchange, and revocation.
//!
//! State tokens are cryptographically random, bound to the principal,
//! single-use, and expire after ten minutes. They live in an in-process
//! map; a multi-process deployment would move [`OAuthStateStore`] behind
//! the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::error::ProviderError;
use crate::github::GitHubClient;
use crate::gitlab::GitLabClient;
use crate::store::{ids, OAuthConnection, Provider, Store};
use mendbot_core::Vault;

const STATE_TTL: Duration = Duration::from_secs(600);
const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Missing, expired, reused, or unknown state. Hard reject before
    /// any token exchange.
    #[error("state parameter rejected")]
    StateRejected,
    #[error("token exchange failed: {0}")]
    ExchangeFailed(ProviderError),
    #[error("user info fetch failed: {0}")]
    UserInfoFailed(ProviderError),
    #[error("no active connection")]
    NotConnected,
    #[error("internal error: {0}")]
    Internal(String),
}

struct PendingState {
    user_id: String,
    issued_at: Instant,
}

/// Transient store for CSRF states.
#[derive(Default)]
pub struct OAuthStateStore {
    states: Mutex<HashMap<String, PendingState>>,
}

impl OAuthStateStore {
    /// Issue a fresh state bound to `user_id`.
    pub fn issue(&self, user_id: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let state = general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        // Opportunistic cleanup keeps the map bounded without a timer.
        states.retain(|_, pending| pending.issued_at.elapsed() < STATE_TTL);
        states.insert(
            state.clone(),
            PendingState {
                user_id: user_id.to_string(),
                issued_at: Instant::now(),
            },
        );
        state
    }

    /// Consume a state. Returns the bound principal exactly once, and
    /// only within the TTL.
    pub fn take(&self, state: &str) -> Option<String> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let pending = states.remove(state)?;
        if pending.issued_at.elapsed() >= STATE_TTL {
            return None;
        }
        Some(pending.user_id)
    }
}

/// Principal-facing view of a connection. Never carries tokens.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub provider: Provider,
    pub provider_username: String,
    pub scopes: Vec<String>,
    pub connected_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectOutcome {
    pub revoked_locally: bool,
    pub revoked_remotely: bool,
}

pub struct OAuthCoordinator {
    store: Arc<dyn Store>,
    vault: Vault,
    github: Arc<GitHubClient>,
    gitlab: Arc<GitLabClient>,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
    states: OAuthStateStore,
}

impl OAuthCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        vault: Vault,
        github: Arc<GitHubClient>,
        gitlab: Arc<GitLabClient>,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            store,
            vault,
            github,
            gitlab,
            client_id,
            client_secret,
            redirect_uri,
            scopes,
            states: OAuthStateStore::default(),
        }
    }

    /// Start the authorization-code flow: mint a state and return the
    /// provider's authorization URL.
    pub fn begin(&self, user_id: &str) -> Result<String, OAuthError> {
        let state = self.states.issue(user_id);

        let mut url =
            Url::parse(AUTHORIZE_URL).map_err(|e| OAuthError::Internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("response_type", "code");

        info!("Issued authorization URL for user {}", user_id);
        Ok(url.into())
    }

    /// Finish the flow: verify the state, exchange the code, fetch the
    /// provider identity, and upsert the encrypted connection.
    ///
    /// A failed user-info fetch leaves no partial record; nothing is
    /// written until every remote step has succeeded.
    pub async fn complete(&self, code: &str, state: &str) -> Result<ConnectionSummary, OAuthError> {
        let user_id = self.states.take(state).ok_or(OAuthError::StateRejected)?;

        let tokens = self
            .github
            .exchange_code(&self.client_id, &self.client_secret, &self.redirect_uri, code)
            .await
            .map_err(OAuthError::ExchangeFailed)?;

        let provider_user = self
            .github
            .get_authenticated_user(&tokens.access_token)
            .await
            .map_err(OAuthError::UserInfoFailed)?;

        let scopes: Vec<String> = tokens
            .scope
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let access_ct = self
            .vault
            .encrypt_str(&tokens.access_token)
            .map_err(|e| OAuthError::Internal(e.to_string()))?;
        let refresh_ct = match &tokens.refresh_token {
            Some(refresh) => Some(
                self.vault
                    .encrypt_str(refresh)
                    .map_err(|e| OAuthError::Internal(e.to_string()))?,
            ),
            None => None,
        };
        let expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

        let now = Utc::now();
        let stored = self
            .store
            .upsert_oauth_connection(OAuthConnection {
                id: ids::oauth_connection(),
                user_id: user_id.clone(),
                provider: Provider::Github,
                provider_user_id: provider_user.id.to_string(),
                provider_username: provider_user.login.clone(),
                access_token: access_ct,
                refresh_token: refresh_ct,
                scopes,
                expires_at,
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|e| OAuthError::Internal(e.to_string()))?;

        info!(
            "Connected {} account {} for user {}",
            stored.provider.as_str(),
            provider_user.login,
            user_id
        );

        Ok(ConnectionSummary {
            provider: stored.provider,
            provider_username: stored.provider_username,
            scopes: stored.scopes,
            connected_at: stored.created_at,
        })
    }

    /// Revoke the connection. Local revocation is durable even when the
    /// remote revoke fails; that case is reported, not retried.
    pub async fn disconnect(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<DisconnectOutcome, OAuthError> {
        let conn = self
            .store
            .get_oauth_connection(user_id, provider)
            .await
            .map_err(|e| OAuthError::Internal(e.to_string()))?
            .ok_or(OAuthError::NotConnected)?;

        let revoked_remotely = match self.vault.decrypt_str(&conn.access_token) {
            Ok(token) => {
                let result = match provider {
                    Provider::Github => {
                        self.github
                            .revoke_token(&self.client_id, &self.client_secret, &token)
                            .await
                    }
                    Provider::Gitlab => {
                        self.gitlab
                            .revoke_token(&self.client_id, &self.client_secret, &token)
                            .await
                    }
                };
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Remote token revocation failed for user {}: {} (revoking locally anyway)",
                            user_id, e
                        );
                        false
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Could not decrypt stored token for user {}: {} (revoking locally anyway)",
                    user_id, e
                );
                false
            }
        };

        let revoked_locally = self
            .store
            .deactivate_oauth_connection(user_id, provider)
            .await
            .map_err(|e| OAuthError::Internal(e.to_string()))?;

        info!(
            "Disconnected {} for user {} (remote revoke: {})",
            provider.as_str(),
            user_id,
            revoked_remotely
        );

        Ok(DisconnectOutcome {
            revoked_locally,
            revoked_remotely,
        })
    }

    pub async fn list_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionSummary>, OAuthError> {
        let mut out = Vec::new();
        for provider in [Provider::Github, Provider::Gitlab] {
            if let Some(conn) = self
                .store
                .get_oauth_connection(user_id, provider)
                .await
                .map_err(|e| OAuthError::Internal(e.to_string()))?
            {
                out.push(ConnectionSummary {
                    provider: conn.provider,
                    provider_username: conn.provider_username,
                    scopes: conn.scopes,
                    connected_at: conn.created_at,
                });
            }
        }
        Ok(out)
    }

    /// Decrypt the access token for `(user_id, provider)`.
    ///
    /// Returns `NotConnected` when there is no active connection or the
    /// token is expired and unrefreshable. (The first provider family's
    /// OAuth tokens do not expire, so there is no refresh path to take;
    /// an expired second-family token without a refresh token surfaces
    /// here.)
    pub async fn access_token(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Zeroizing<String>, OAuthError> {
        let conn = self
            .store
            .get_oauth_connection(user_id, provider)
            .await
            .map_err(|e| OAuthError::Internal(e.to_string()))?
            .ok_or(OAuthError::NotConnected)?;

        if let Some(expires_at) = conn.expires_at {
            if expires_at <= Utc::now() {
                warn!(
                    "Stored {} token for user {} is expired",
                    provider.as_str(),
                    user_id
                );
                return Err(OAuthError::NotConnected);
            }
        }

        self.vault
            .decrypt_str(&conn.access_token)
            .map_err(|e| OAuthError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_single_use() {
        let store = OAuthStateStore::default();
        let state = store.issue("u1");
        assert_eq!(store.take(&state).as_deref(), Some("u1"));
        assert_eq!(store.take(&state), None);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let store = OAuthStateStore::default();
        store.issue("u1");
        assert_eq!(store.take("not-a-real-state"), None);
    }

    #[test]
    fn states_are_unique_and_high_entropy() {
        let store = OAuthStateStore::default();
        let a = store.issue("u1");
        let b = store.issue("u1");
        assert_ne!(a, b);
        // 32 random bytes, base64url: 43 chars.
        assert!(a.len() >= 40);
    }

    #[test]
    fn state_binds_to_the_issuing_principal() {
        let store = OAuthStateStore::default();
        let state_a = store.issue("alice");
        let state_b = store.issue("bob");
        assert_eq!(store.take(&state_b).as_deref(), Some("bob"));
        assert_eq!(store.take(&state_a).as_deref(), Some("alice"));
    }
}
