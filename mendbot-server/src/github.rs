//! Typed client for the GitHub REST API.
//!
//! Every operation takes the caller's OAuth token as an explicit
//! parameter; the client holds no credentials and never reads storage.
//! Transient failures and rate limits are retried internally (see
//! [`crate::net`]); all other failures surface as [`ProviderError`].

use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ProviderError;
use crate::net::{execute_with_retry, RetryPolicy};

const API_BASE: &str = "https://api.github.com";
const OAUTH_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const API_VERSION: &str = "2022-11-28";

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_base: String,
    token_url: String,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    pub default_branch: String,
    pub private: bool,
    #[serde(default)]
    pub permissions: Option<RepositoryPermissions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPermissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub pull: bool,
}

/// Decoded file contents plus the blob sha needed for compare-and-swap
/// updates.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content: String,
    pub sha: String,
    pub encoding: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: String,
    sha: String,
    encoding: String,
}

#[derive(Debug, Clone)]
pub struct FileWrite<'a> {
    pub content: &'a str,
    /// Current blob sha; supplying a stale one makes the provider reject
    /// the write, which is exactly the fail-fast the orchestrator wants.
    pub sha: Option<&'a str>,
    pub branch: &'a str,
    pub message: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateFileRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateFileResponse {
    commit: CommitInfo,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest<'a> {
    pub head: &'a str,
    pub base: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub draft: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig<'a> {
    pub url: &'a str,
    pub secret: &'a str,
    pub events: &'a [String],
    pub content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunInfo {
    pub id: u64,
    pub status: String,
    pub conclusion: Option<String>,
    pub head_branch: String,
    pub head_sha: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub name: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    jobs: Vec<WorkflowJob>,
}

#[derive(Debug, Deserialize)]
struct GitRefResponse {
    object: GitRefObject,
}

#[derive(Debug, Deserialize)]
struct GitRefObject {
    sha: String,
}

/// Token exchange result. `expires_in`/`refresh_token` arrive only for
/// apps configured with expiring tokens.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderUser {
    pub id: u64,
    pub login: String,
}

impl GitHubClient {
    pub fn new(retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .user_agent(concat!("mendbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: API_BASE.to_string(),
            token_url: OAUTH_TOKEN_URL.to_string(),
            retry,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    // --- Repositories -------------------------------------------------------

    pub async fn list_repositories(
        &self,
        token: &str,
        sort: &str,
        page: u32,
    ) -> Result<Vec<Repository>, ProviderError> {
        let url = format!(
            "{}/user/repos?visibility=all&affiliation=owner,collaborator,organization_member\
             &sort={}&direction=desc&per_page=100&page={}",
            self.api_base, sort, page
        );
        let response = execute_with_retry(self.retry, "list_repositories", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        decode_json(response).await
    }

    pub async fn get_repository(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Repository, ProviderError> {
        let url = format!("{}/repos/{}/{}", self.api_base, owner, repo);
        let response = execute_with_retry(self.retry, "get_repository", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        decode_json(response).await
    }

    // --- Contents -----------------------------------------------------------

    pub async fn get_file(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<FileContent, ProviderError> {
        let mut url = format!("{}/repos/{}/{}/contents/{}", self.api_base, owner, repo, path);
        if let Some(r) = reference {
            url.push_str("?ref=");
            url.push_str(r);
        }
        let response = execute_with_retry(self.retry, "get_file", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        let raw: ContentsResponse = decode_json(response).await?;

        // The contents API base64-encodes with embedded newlines.
        let stripped: String = raw.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = general_purpose::STANDARD
            .decode(&stripped)
            .map_err(|e| ProviderError::Provider {
                status: 200,
                body: format!("undecodable file content: {}", e),
            })?;
        let content = String::from_utf8(bytes).map_err(|e| ProviderError::Provider {
            status: 200,
            body: format!("file content is not UTF-8: {}", e),
        })?;

        Ok(FileContent {
            content,
            sha: raw.sha,
            encoding: raw.encoding,
        })
    }

    /// Create or update one file on a branch. Returns the new commit sha.
    pub async fn create_or_update_file(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        write: FileWrite<'_>,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/repos/{}/{}/contents/{}", self.api_base, owner, repo, path);
        let body = CreateFileRequest {
            message: write.message,
            content: general_purpose::STANDARD.encode(write.content.as_bytes()),
            branch: write.branch,
            sha: write.sha,
        };
        let response = execute_with_retry(self.retry, "create_or_update_file", || {
            self.authed(self.client.put(&url), token).json(&body)
        })
        .await?;
        let created: CreateFileResponse = decode_json(response).await?;
        Ok(created.commit.sha)
    }

    // --- Refs ---------------------------------------------------------------

    pub async fn get_branch_head(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{}/repos/{}/{}/git/ref/heads/{}",
            self.api_base, owner, repo, branch
        );
        let response = execute_with_retry(self.retry, "get_branch_head", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        let git_ref: GitRefResponse = decode_json(response).await?;
        Ok(git_ref.object.sha)
    }

    pub async fn create_branch(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        from_sha: &str,
        name: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/repos/{}/{}/git/refs", self.api_base, owner, repo);
        let body = serde_json::json!({
            "ref": format!("refs/heads/{}", name),
            "sha": from_sha,
        });
        execute_with_retry(self.retry, "create_branch", || {
            self.authed(self.client.post(&url), token).json(&body)
        })
        .await?;
        info!("Created branch {} in {}/{}", name, owner, repo);
        Ok(())
    }

    // --- Pull requests ------------------------------------------------------

    pub async fn create_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr: NewPullRequest<'_>,
    ) -> Result<PullRequest, ProviderError> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_base, owner, repo);
        let body = serde_json::json!({
            "title": pr.title,
            "body": pr.body,
            "head": pr.head,
            "base": pr.base,
            "draft": pr.draft,
        });
        let response = execute_with_retry(self.retry, "create_pull_request", || {
            self.authed(self.client.post(&url), token).json(&body)
        })
        .await?;
        decode_json(response).await
    }

    // --- Webhooks -----------------------------------------------------------

    pub async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        config: WebhookConfig<'_>,
    ) -> Result<u64, ProviderError> {
        let url = format!("{}/repos/{}/{}/hooks", self.api_base, owner, repo);
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": config.events,
            "config": {
                "url": config.url,
                "content_type": config.content_type,
                "secret": config.secret,
                "insecure_ssl": "0",
            },
        });
        let response = execute_with_retry(self.retry, "create_webhook", || {
            self.authed(self.client.post(&url), token).json(&body)
        })
        .await?;
        let hook: WebhookResponse = decode_json(response).await?;
        info!("Installed webhook {} on {}/{}", hook.id, owner, repo);
        Ok(hook.id)
    }

    pub async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/repos/{}/{}/hooks/{}", self.api_base, owner, repo, hook_id);
        execute_with_retry(self.retry, "delete_webhook", || {
            self.authed(self.client.delete(&url), token)
        })
        .await?;
        Ok(())
    }

    // --- Actions ------------------------------------------------------------

    pub async fn get_workflow_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<WorkflowRunInfo, ProviderError> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs/{}",
            self.api_base, owner, repo, run_id
        );
        let response = execute_with_retry(self.retry, "get_workflow_run", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        decode_json(response).await
    }

    pub async fn list_run_jobs(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<WorkflowJob>, ProviderError> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs/{}/jobs?per_page=100",
            self.api_base, owner, repo, run_id
        );
        let response = execute_with_retry(self.retry, "list_run_jobs", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        let jobs: JobsResponse = decode_json(response).await?;
        Ok(jobs.jobs)
    }

    /// Download the textual logs for a run.
    ///
    /// The run-level archive endpoint serves a zip; instead this fetches
    /// the plain-text log of every job that did not succeed and
    /// concatenates them, which is the form the log parser consumes.
    pub async fn download_run_logs(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<u8>, ProviderError> {
        let jobs = self.list_run_jobs(token, owner, repo, run_id).await?;

        let mut combined = Vec::new();
        for job in jobs
            .iter()
            .filter(|j| j.conclusion.as_deref() != Some("success"))
        {
            let url = format!(
                "{}/repos/{}/{}/actions/jobs/{}/logs",
                self.api_base, owner, repo, job.id
            );
            let response = execute_with_retry(self.retry, "download_job_logs", || {
                self.authed(self.client.get(&url), token)
            })
            .await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ProviderError::TransientNetwork(e.to_string()))?;

            combined.extend_from_slice(format!("##[group]{}\n", job.name).as_bytes());
            combined.extend_from_slice(&bytes);
            combined.push(b'\n');
        }
        Ok(combined)
    }

    pub async fn rerun_workflow(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
        failed_only: bool,
    ) -> Result<(), ProviderError> {
        let suffix = if failed_only { "rerun-failed-jobs" } else { "rerun" };
        let url = format!(
            "{}/repos/{}/{}/actions/runs/{}/{}",
            self.api_base, owner, repo, run_id, suffix
        );
        execute_with_retry(self.retry, "rerun_workflow", || {
            self.authed(self.client.post(&url), token)
        })
        .await?;
        info!(
            "Requested rerun of run {} in {}/{} (failed_only: {})",
            run_id, owner, repo, failed_only
        );
        Ok(())
    }

    // --- OAuth --------------------------------------------------------------

    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        code: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        let response = execute_with_retry(self.retry, "exchange_code", || {
            self.client
                .post(&self.token_url)
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&params)
        })
        .await?;

        // GitHub reports exchange failures with a 200 and an error body.
        let value: serde_json::Value = decode_json(response).await?;
        if value.get("error").is_some() {
            return Err(ProviderError::Unauthorized);
        }
        serde_json::from_value(value).map_err(|e| ProviderError::Provider {
            status: 200,
            body: format!("unexpected token response: {}", e),
        })
    }

    pub async fn get_authenticated_user(&self, token: &str) -> Result<ProviderUser, ProviderError> {
        let url = format!("{}/user", self.api_base);
        let response = execute_with_retry(self.retry, "get_authenticated_user", || {
            self.authed(self.client.get(&url), token)
        })
        .await?;
        decode_json(response).await
    }

    /// Revoke an OAuth token. Requires the app's client credentials
    /// (basic auth) per the provider's API.
    pub async fn revoke_token(
        &self,
        client_id: &str,
        client_secret: &str,
        token: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/applications/{}/token", self.api_base, client_id);
        let body = serde_json::json!({ "access_token": token });
        execute_with_retry(self.retry, "revoke_token", || {
            self.client
                .delete(&url)
                .basic_auth(client_id, Some(client_secret))
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .header("X-GitHub-Api-Version", API_VERSION)
                .json(&body)
        })
        .await?;
        Ok(())
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::TransientNetwork(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| ProviderError::Provider {
        status,
        body: format!("undecodable response ({}): {}", e, body.chars().take(256).collect::<String>()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_tolerates_missing_optional_fields() {
        let json = r#"{"access_token":"gho_abc","token_type":"bearer","scope":"repo"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token, "gho_abc");
        assert!(parsed.refresh_token.is_none());
        assert!(parsed.expires_in.is_none());
    }

    #[test]
    fn repository_permissions_are_optional() {
        let json = r#"{"full_name":"acme/web","default_branch":"main","private":false}"#;
        let parsed: Repository = serde_json::from_str(json).unwrap();
        assert!(parsed.permissions.is_none());

        let json = r#"{"full_name":"acme/web","default_branch":"main","private":true,
                        "permissions":{"admin":true,"push":true,"pull":true}}"#;
        let parsed: Repository = serde_json::from_str(json).unwrap();
        assert!(parsed.permissions.unwrap().push);
    }
}
