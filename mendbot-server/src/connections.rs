//! Repository connection service: connect/disconnect repositories and
//! drive the webhook lifecycle on their behalf.
//!
//! Local state is authoritative. Remote failures during connect leave a
//! dormant-but-usable connection; remote failures during disconnect are
//! reported in the response without blocking local cleanup.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::github::GitHubClient;
use crate::oauth::{OAuthCoordinator, OAuthError};
use crate::store::{ids, Provider, RepositoryConnection, Store, StoreError, WebhookStatus};
use crate::webhooks::{default_events, split_full_name, WebhookManager};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("repository {0} is already connected")]
    AlreadyConnected(String),
    #[error("repository connection not found")]
    NotFound,
    #[error("no active oauth connection")]
    NoCredentials,
    #[error("malformed repository name {0:?}")]
    BadName(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl From<OAuthError> for ConnectionError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::NotConnected => ConnectionError::NoCredentials,
            other => ConnectionError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub full_name: String,
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub auto_pr_enabled: bool,
    #[serde(default = "default_true")]
    pub setup_webhook: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct ConnectionPatch {
    #[serde(default)]
    pub auto_pr_enabled: Option<bool>,
    #[serde(default)]
    pub is_enabled: Option<bool>,
}

/// API view of a repository connection. The webhook secret never leaves
/// the store, encrypted or otherwise.
#[derive(Debug, Serialize)]
pub struct ConnectionView {
    pub id: String,
    pub provider: Provider,
    pub repository_full_name: String,
    pub default_branch: String,
    pub is_enabled: bool,
    pub auto_pr_enabled: bool,
    pub webhook_status: Option<WebhookStatus>,
    pub webhook_url: Option<String>,
    pub events: Vec<String>,
    pub webhook_last_delivery_at: Option<chrono::DateTime<Utc>>,
    pub created_at: chrono::DateTime<Utc>,
}

impl From<RepositoryConnection> for ConnectionView {
    fn from(c: RepositoryConnection) -> Self {
        ConnectionView {
            id: c.id,
            provider: c.provider,
            repository_full_name: c.repository_full_name,
            default_branch: c.default_branch,
            is_enabled: c.is_enabled,
            auto_pr_enabled: c.auto_pr_enabled,
            webhook_status: c.webhook_status,
            webhook_url: c.webhook_url,
            events: c.webhook_events,
            webhook_last_delivery_at: c.webhook_last_delivery_at,
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectOutcome {
    pub connection: ConnectionView,
    pub webhook_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DisconnectSummary {
    pub deleted: bool,
    pub webhook_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct AvailableRepository {
    pub full_name: String,
    pub default_branch: String,
    pub private: bool,
    pub can_push: bool,
}

pub struct ConnectionService {
    store: Arc<dyn Store>,
    github: Arc<GitHubClient>,
    webhooks: Arc<WebhookManager>,
}

impl ConnectionService {
    pub fn new(
        store: Arc<dyn Store>,
        github: Arc<GitHubClient>,
        webhooks: Arc<WebhookManager>,
    ) -> Self {
        Self {
            store,
            github,
            webhooks,
        }
    }

    /// Repositories the principal's token can see, for the connect UI.
    pub async fn list_available(
        &self,
        oauth: &OAuthCoordinator,
        user_id: &str,
        sort: &str,
        page: u32,
    ) -> Result<Vec<AvailableRepository>, ConnectionError> {
        let token = oauth.access_token(user_id, Provider::Github).await?;
        let repos = self
            .github
            .list_repositories(&token, sort, page)
            .await
            .map_err(|e| ConnectionError::Internal(e.to_string()))?;

        Ok(repos
            .into_iter()
            .map(|r| AvailableRepository {
                can_push: r.permissions.as_ref().map(|p| p.push).unwrap_or(false),
                full_name: r.full_name,
                default_branch: r.default_branch,
                private: r.private,
            })
            .collect())
    }

    /// Create the connection, then (optionally) install the hook. The
    /// connection is committed before provisioning starts, so a provider
    /// failure leaves a usable-but-dormant record, never a half-created
    /// one.
    pub async fn connect(
        &self,
        oauth: &OAuthCoordinator,
        user_id: &str,
        request: ConnectRequest,
    ) -> Result<ConnectOutcome, ConnectionError> {
        let provider = request.provider.unwrap_or(Provider::Github);
        split_full_name(&request.full_name)
            .map_err(|_| ConnectionError::BadName(request.full_name.clone()))?;

        let oauth_conn = self
            .store
            .get_oauth_connection(user_id, provider)
            .await?
            .ok_or(ConnectionError::NoCredentials)?;

        // Resolve the default branch from the provider unless supplied.
        let default_branch = match &request.default_branch {
            Some(branch) => branch.clone(),
            None if provider == Provider::Github => {
                let token = oauth.access_token(user_id, provider).await?;
                let (owner, repo) = split_full_name(&request.full_name)
                    .map_err(|_| ConnectionError::BadName(request.full_name.clone()))?;
                match self.github.get_repository(&token, owner, repo).await {
                    Ok(repository) => repository.default_branch,
                    Err(e) => {
                        warn!(
                            "Could not resolve default branch for {}: {} (assuming main)",
                            request.full_name, e
                        );
                        "main".to_string()
                    }
                }
            }
            None => "main".to_string(),
        };

        let now = Utc::now();
        let connection = RepositoryConnection {
            id: ids::repository_connection(),
            user_id: user_id.to_string(),
            provider,
            oauth_connection_id: oauth_conn.id,
            repository_full_name: request.full_name.clone(),
            default_branch,
            is_enabled: true,
            auto_pr_enabled: request.auto_pr_enabled,
            webhook_id: None,
            webhook_secret: None,
            webhook_url: None,
            webhook_events: Vec::new(),
            webhook_status: None,
            webhook_last_delivery_at: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_repository_connection(connection.clone()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => {
                return Err(ConnectionError::AlreadyConnected(request.full_name));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Connected repository {} for user {} (auto_pr: {})",
            request.full_name, user_id, request.auto_pr_enabled
        );

        let mut webhook_installed = false;
        let mut webhook_error = None;
        if request.setup_webhook {
            let events = request
                .events
                .clone()
                .unwrap_or_else(|| default_events(provider));
            match self
                .webhooks
                .install(oauth, &connection.id, Some(events))
                .await
            {
                Ok(_) => webhook_installed = true,
                Err(e) => webhook_error = Some(e.to_string()),
            }
        }

        let stored = self
            .store
            .get_repository_connection(&connection.id)
            .await?
            .ok_or(ConnectionError::NotFound)?;

        Ok(ConnectOutcome {
            connection: stored.into(),
            webhook_installed,
            webhook_error,
        })
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Result<ConnectionView, ConnectionError> {
        let conn = self.owned_connection(user_id, id).await?;
        Ok(conn.into())
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ConnectionView>, ConnectionError> {
        let conns = self.store.list_repository_connections(user_id).await?;
        Ok(conns.into_iter().map(Into::into).collect())
    }

    pub async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: ConnectionPatch,
    ) -> Result<ConnectionView, ConnectionError> {
        self.owned_connection(user_id, id).await?;
        self.store
            .update_connection_settings(id, patch.auto_pr_enabled, patch.is_enabled)
            .await?;
        let updated = self
            .store
            .get_repository_connection(id)
            .await?
            .ok_or(ConnectionError::NotFound)?;
        Ok(updated.into())
    }

    /// Remove the connection. Webhook teardown (best-effort remote, then
    /// unconditional local clear) runs first; the row is deleted after,
    /// so a crash in between leaves a consistent inactive connection.
    pub async fn disconnect(
        &self,
        oauth: &OAuthCoordinator,
        user_id: &str,
        id: &str,
        delete_webhook: bool,
    ) -> Result<DisconnectSummary, ConnectionError> {
        let conn = self.owned_connection(user_id, id).await?;

        let mut webhook_deleted = false;
        if delete_webhook && conn.webhook_id.is_some() {
            match self.webhooks.remove(oauth, id).await {
                Ok(outcome) => webhook_deleted = outcome.webhook_deleted,
                Err(e) => {
                    warn!(
                        "Webhook teardown failed for {} (continuing with disconnect): {}",
                        conn.repository_full_name, e
                    );
                }
            }
        }

        let deleted = self.store.delete_repository_connection(id).await?;
        info!(
            "Disconnected repository {} for user {} (webhook deleted: {})",
            conn.repository_full_name, user_id, webhook_deleted
        );

        Ok(DisconnectSummary {
            deleted,
            webhook_deleted,
        })
    }

    async fn owned_connection(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<RepositoryConnection, ConnectionError> {
        let conn = self
            .store
            .get_repository_connection(id)
            .await?
            .ok_or(ConnectionError::NotFound)?;
        // Principal scoping: a connection is only visible to its owner.
        if conn.user_id != user_id {
            return Err(ConnectionError::NotFound);
        }
        Ok(conn)
    }
}
