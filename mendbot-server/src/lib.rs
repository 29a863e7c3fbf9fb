pub mod api;
pub mod config;
pub mod connections;
pub mod error;
pub mod github;
pub mod gitlab;
pub mod ingest;
pub mod llm;
pub mod net;
pub mod oauth;
pub mod remediation;
pub mod store;
pub mod tracker;
pub mod webhooks;

use std::sync::Arc;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::connections::ConnectionService;
use crate::github::GitHubClient;
use crate::gitlab::GitLabClient;
use crate::llm::SolutionModel;
use crate::net::RetryPolicy;
use crate::oauth::OAuthCoordinator;
use crate::remediation::{Budgets, RemediationDispatcher, RemediationOrchestrator};
use crate::store::Store;
use crate::tracker::WorkflowTracker;
use crate::webhooks::WebhookManager;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub oauth: Arc<OAuthCoordinator>,
    pub webhooks: Arc<WebhookManager>,
    pub connections: ConnectionService,
    pub tracker: WorkflowTracker,
    pub dispatcher: RemediationDispatcher,
}

impl AppState {
    /// Wire the services together. Each component receives exactly the
    /// capabilities it needs; the store and clients are shared behind
    /// `Arc`.
    pub fn new(config: Config, store: Arc<dyn Store>, model: Arc<dyn SolutionModel>) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.provider_retry_max_attempts,
        };
        let github = Arc::new(GitHubClient::new(retry));
        let gitlab = Arc::new(GitLabClient::new(retry));

        let oauth = Arc::new(OAuthCoordinator::new(
            store.clone(),
            config.vault.clone(),
            github.clone(),
            gitlab.clone(),
            config.oauth_client_id.clone(),
            config.oauth_client_secret.clone(),
            config.oauth_redirect_uri.clone(),
            config.oauth_scopes.clone(),
        ));

        let webhooks = Arc::new(WebhookManager::new(
            store.clone(),
            config.vault.clone(),
            github.clone(),
            gitlab.clone(),
            config.ingest_base_url.clone(),
        ));

        let connections = ConnectionService::new(store.clone(), github.clone(), webhooks.clone());
        let tracker = WorkflowTracker::new(store.clone());

        let orchestrator = Arc::new(RemediationOrchestrator::new(
            store.clone(),
            github,
            model,
            oauth.clone(),
            Budgets {
                max_files_per_pr: config.max_files_per_pr,
                max_errors_per_file: config.max_errors_per_file,
                log_context_max_chars: config.log_context_max_chars,
                deadline: config.remediation_deadline,
            },
        ));
        let dispatcher = RemediationDispatcher::new(orchestrator, config.remediation_workers);

        Self {
            config,
            store,
            oauth,
            webhooks,
            connections,
            tracker,
            dispatcher,
        }
    }
}

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "mendbot"
    })))
}

/// Assemble the full HTTP surface. The legacy `/api/v1` prefix resolves
/// the ingest endpoints to the same handlers as `/api/v2`.
pub fn app_router(state: Arc<AppState>) -> Router {
    let v2 = api::router().merge(ingest::router());

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v2", v2)
        .nest("/api/v1", ingest::router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
