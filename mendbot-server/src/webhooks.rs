//! Webhook lifecycle: provisioning, deprovisioning, and signature
//! verification.
//!
//! Each repository connection exclusively owns the hook it installed and
//! the secret that hook signs with. Secrets are high-entropy, generated
//! fresh per install, and stored only as vault ciphertext.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::github::{GitHubClient, WebhookConfig};
use crate::gitlab::GitLabClient;
use crate::oauth::OAuthCoordinator;
use crate::store::{Provider, Store, WebhookStatus};
use mendbot_core::Vault;

type HmacSha256 = Hmac<Sha256>;

/// Events subscribed to when the caller does not narrow the set.
pub fn default_events(provider: Provider) -> Vec<String> {
    match provider {
        Provider::Github => vec![
            "workflow_run".to_string(),
            "pull_request".to_string(),
            "push".to_string(),
        ],
        Provider::Gitlab => vec![
            "pipeline".to_string(),
            "merge_request".to_string(),
            "push".to_string(),
        ],
    }
}

/// Generate a fresh 32-byte webhook secret, base64url-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Verify an HMAC-SHA256 signature header (`sha256=<hex>`) over the
/// exact bytes received, before any parsing or re-encoding.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Verify the second family's shared-token header in constant time.
pub fn verify_token(secret: &str, header_token: &str) -> bool {
    secret.as_bytes().ct_eq(header_token.as_bytes()).into()
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub webhook_id: String,
    pub webhook_url: String,
    pub events: Vec<String>,
}

#[derive(Debug)]
pub struct RemoveOutcome {
    /// Whether the provider-side delete succeeded. Local fields are
    /// cleared either way.
    pub webhook_deleted: bool,
}

pub struct WebhookManager {
    store: Arc<dyn Store>,
    vault: Vault,
    github: Arc<GitHubClient>,
    gitlab: Arc<GitLabClient>,
    ingest_base_url: String,
}

impl WebhookManager {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Vault,
        github: Arc<GitHubClient>,
        gitlab: Arc<GitLabClient>,
        ingest_base_url: String,
    ) -> Self {
        Self {
            store,
            vault,
            github,
            gitlab,
            ingest_base_url: ingest_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn ingest_url(&self, provider: Provider) -> String {
        format!("{}/api/v2/webhooks/{}", self.ingest_base_url, provider.as_str())
    }

    /// Provision a hook for the connection. On provider failure the
    /// connection is marked `failed` with no secret stored; it remains
    /// usable but dormant.
    pub async fn install(
        &self,
        oauth: &OAuthCoordinator,
        repository_connection_id: &str,
        events: Option<Vec<String>>,
    ) -> anyhow::Result<InstallOutcome> {
        let conn = self
            .store
            .get_repository_connection(repository_connection_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("repository connection {} not found", repository_connection_id)
            })?;

        let token = oauth.access_token(&conn.user_id, conn.provider).await?;
        let events = events.unwrap_or_else(|| default_events(conn.provider));
        let secret = generate_secret();
        let url = self.ingest_url(conn.provider);

        let created = match conn.provider {
            Provider::Github => {
                let (owner, repo) = split_full_name(&conn.repository_full_name)?;
                self.github
                    .create_webhook(
                        &token,
                        owner,
                        repo,
                        WebhookConfig {
                            url: &url,
                            secret: &secret,
                            events: &events,
                            content_type: "json",
                        },
                    )
                    .await
            }
            Provider::Gitlab => {
                self.gitlab
                    .create_webhook(&token, &conn.repository_full_name, &url, &secret, &events)
                    .await
            }
        };

        let webhook_id = match created {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(
                    "Webhook installation failed for {}: {}",
                    conn.repository_full_name, e
                );
                self.store.mark_webhook_failed(&conn.id).await?;
                return Err(e.into());
            }
        };

        let secret_ciphertext = self.vault.encrypt_str(&secret)?;
        self.store
            .update_webhook_provisioned(&conn.id, &webhook_id, &secret_ciphertext, &url, &events)
            .await?;

        info!(
            "Webhook {} active for {} ({} events)",
            webhook_id,
            conn.repository_full_name,
            events.len()
        );

        Ok(InstallOutcome {
            webhook_id,
            webhook_url: url,
            events,
        })
    }

    /// Remove the hook. The provider-side delete is best-effort; local
    /// webhook fields are cleared unconditionally afterwards.
    pub async fn remove(
        &self,
        oauth: &OAuthCoordinator,
        repository_connection_id: &str,
    ) -> anyhow::Result<RemoveOutcome> {
        let conn = self
            .store
            .get_repository_connection(repository_connection_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("repository connection {} not found", repository_connection_id)
            })?;

        let mut webhook_deleted = false;

        if let Some(webhook_id) = conn.webhook_id.as_deref() {
            match self.delete_remote(oauth, &conn, webhook_id).await {
                Ok(()) => webhook_deleted = true,
                Err(e) => {
                    warn!(
                        "Provider-side webhook delete failed for {} (clearing locally anyway): {}",
                        conn.repository_full_name, e
                    );
                }
            }
        }

        self.store.clear_webhook(&conn.id).await?;

        info!(
            "Webhook removed for {} (remote delete: {})",
            conn.repository_full_name, webhook_deleted
        );

        Ok(RemoveOutcome { webhook_deleted })
    }

    async fn delete_remote(
        &self,
        oauth: &OAuthCoordinator,
        conn: &crate::store::RepositoryConnection,
        webhook_id: &str,
    ) -> anyhow::Result<()> {
        let token = oauth.access_token(&conn.user_id, conn.provider).await?;
        let hook_id: u64 = webhook_id
            .parse()
            .map_err(|_| anyhow::anyhow!("stored webhook id {:?} is not numeric", webhook_id))?;

        match conn.provider {
            Provider::Github => {
                let (owner, repo) = split_full_name(&conn.repository_full_name)?;
                self.github.delete_webhook(&token, owner, repo, hook_id).await?;
            }
            Provider::Gitlab => {
                self.gitlab
                    .delete_webhook(&token, &conn.repository_full_name, hook_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Decrypt the stored secret for a connection, if the hook is active.
    pub fn decrypt_secret(
        &self,
        conn: &crate::store::RepositoryConnection,
    ) -> Option<zeroize::Zeroizing<String>> {
        if conn.webhook_status != Some(WebhookStatus::Active) {
            return None;
        }
        let ciphertext = conn.webhook_secret.as_deref()?;
        match self.vault.decrypt_str(ciphertext) {
            Ok(secret) => Some(secret),
            Err(e) => {
                warn!(
                    "Could not decrypt webhook secret for {}: {}",
                    conn.repository_full_name, e
                );
                None
            }
        }
    }
}

pub fn split_full_name(full_name: &str) -> anyhow::Result<(&str, &str)> {
    full_name
        .split_once('/')
        .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
        .ok_or_else(|| anyhow::anyhow!("malformed repository name {:?}", full_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = br#"{"action":"completed"}"#;
        let signature = sign("topsecret", payload);
        assert!(verify_signature("topsecret", payload, &signature));
    }

    #[test]
    fn rejects_wrong_key() {
        let payload = br#"{"action":"completed"}"#;
        let signature = sign("other-key", payload);
        assert!(!verify_signature("topsecret", payload, &signature));
    }

    #[test]
    fn rejects_tampered_payload() {
        let signature = sign("topsecret", br#"{"action":"completed"}"#);
        assert!(!verify_signature(
            "topsecret",
            br#"{"action":"requested"}"#,
            &signature
        ));
    }

    #[test]
    fn rejects_missing_or_malformed_signature() {
        let payload = b"body";
        assert!(!verify_signature("s", payload, ""));
        assert!(!verify_signature("s", payload, "sha1=abcdef"));
        assert!(!verify_signature("s", payload, "sha256=not-hex"));
    }

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(verify_token("secret-token", "secret-token"));
        assert!(!verify_token("secret-token", "secret-tokeN"));
        assert!(!verify_token("secret-token", "secret-toke"));
        assert!(!verify_token("secret-token", ""));
    }

    #[test]
    fn generated_secrets_are_unique_and_long() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        // 32 bytes base64url -> 43 chars of entropy.
        assert!(a.len() >= 40);
    }

    #[test]
    fn default_event_sets_per_provider() {
        assert_eq!(
            default_events(Provider::Github),
            vec!["workflow_run", "pull_request", "push"]
        );
        assert_eq!(
            default_events(Provider::Gitlab),
            vec!["pipeline", "merge_request", "push"]
        );
    }

    #[test]
    fn full_name_must_have_owner_and_repo() {
        assert!(split_full_name("acme/web").is_ok());
        assert!(split_full_name("acme").is_err());
        assert!(split_full_name("/web").is_err());
        assert!(split_full_name("acme/").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // A correctly computed signature verifies for any secret and
            // payload.
            #[test]
            fn prop_valid_signatures_verify(
                secret in "[!-~]{1,64}",
                payload in proptest::collection::vec(any::<u8>(), 0..2048),
            ) {
                let signature = sign(&secret, &payload);
                prop_assert!(verify_signature(&secret, &payload, &signature));
            }

            // Flipping any payload byte invalidates the signature.
            #[test]
            fn prop_tampered_payloads_fail(
                secret in "[!-~]{1,64}",
                payload in proptest::collection::vec(any::<u8>(), 1..2048),
                flip in 0usize..2048,
            ) {
                let signature = sign(&secret, &payload);
                let mut tampered = payload.clone();
                let idx = flip % tampered.len();
                tampered[idx] ^= 0x01;
                prop_assert!(!verify_signature(&secret, &tampered, &signature));
            }
        }
    }
}
