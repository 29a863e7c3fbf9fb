//! Slim client for the second provider family.
//!
//! Only the operations the webhook manager and OAuth coordinator need:
//! hook lifecycle, token revocation, and user lookup. Pipeline events
//! arrive through the ingest endpoint and are verified by token
//! comparison rather than an HMAC signature.

use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use crate::error::ProviderError;
use crate::net::{execute_with_retry, RetryPolicy};

const API_BASE: &str = "https://gitlab.com/api/v4";
const OAUTH_BASE: &str = "https://gitlab.com/oauth";

#[derive(Clone)]
pub struct GitLabClient {
    client: Client,
    api_base: String,
    oauth_base: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
}

impl GitLabClient {
    pub fn new(retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .user_agent(concat!("mendbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: API_BASE.to_string(),
            oauth_base: OAUTH_BASE.to_string(),
            retry,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder.header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
    }

    /// Project path as it appears in URLs (`group/project` percent-encoded).
    fn project_id(path: &str) -> String {
        path.replace('/', "%2F")
    }

    pub async fn create_webhook(
        &self,
        token: &str,
        project_path: &str,
        hook_url: &str,
        secret_token: &str,
        events: &[String],
    ) -> Result<u64, ProviderError> {
        let url = format!(
            "{}/projects/{}/hooks",
            self.api_base,
            Self::project_id(project_path)
        );
        let body = serde_json::json!({
            "url": hook_url,
            "token": secret_token,
            "pipeline_events": events.iter().any(|e| e == "pipeline"),
            "merge_requests_events": events.iter().any(|e| e == "merge_request"),
            "push_events": events.iter().any(|e| e == "push"),
            "enable_ssl_verification": true,
        });
        let response = execute_with_retry(self.retry, "gitlab_create_webhook", || {
            self.authed(self.client.post(&url), token).json(&body)
        })
        .await?;
        let hook: HookResponse = response.json().await.map_err(|e| ProviderError::Provider {
            status: 200,
            body: format!("undecodable hook response: {}", e),
        })?;
        info!("Installed hook {} on {}", hook.id, project_path);
        Ok(hook.id)
    }

    pub async fn delete_webhook(
        &self,
        token: &str,
        project_path: &str,
        hook_id: u64,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/projects/{}/hooks/{}",
            self.api_base,
            Self::project_id(project_path),
            hook_id
        );
        execute_with_retry(self.retry, "gitlab_delete_webhook", || {
            self.authed(self.client.delete(&url), token)
        })
        .await?;
        Ok(())
    }

    pub async fn revoke_token(
        &self,
        client_id: &str,
        client_secret: &str,
        token: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/revoke", self.oauth_base);
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("token", token),
        ];
        execute_with_retry(self.retry, "gitlab_revoke_token", || {
            self.client.post(&url).form(&params)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_path_is_url_encoded() {
        assert_eq!(GitLabClient::project_id("group/project"), "group%2Fproject");
        assert_eq!(
            GitLabClient::project_id("group/sub/project"),
            "group%2Fsub%2Fproject"
        );
    }
}
