//! Connection and webhook lifecycle scenarios against the in-memory
//! store. Remote provider calls are made to fail by seeding no OAuth
//! connection; the properties under test are exactly the local-side
//! guarantees that must hold when the remote side is unavailable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use mendbot_core::Vault;
use mendbot_server::config::Config;
use mendbot_server::llm::{ModelError, Solution, SolutionModel, SolutionRequest};
use mendbot_server::store::{
    ids, InMemoryStore, OAuthConnection, Provider, RepositoryConnection, Store, WebhookStatus,
};
use mendbot_server::webhooks::generate_secret;
use mendbot_server::AppState;

struct NoopModel;

#[async_trait::async_trait]
impl SolutionModel for NoopModel {
    async fn generate_solution(&self, _request: &SolutionRequest) -> Result<Solution, ModelError> {
        Err(ModelError::NoChanges)
    }
}

fn test_config(vault: Vault) -> Config {
    Config {
        oauth_client_id: "client-id".to_string(),
        oauth_client_secret: "client-secret".to_string(),
        oauth_redirect_uri: "https://mendbot.test/callback".to_string(),
        oauth_scopes: vec!["repo".to_string()],
        ingest_base_url: "https://mendbot.test".to_string(),
        vault,
        max_files_per_pr: 3,
        max_errors_per_file: 5,
        remediation_deadline: Duration::from_secs(30),
        provider_retry_max_attempts: 1,
        llm_endpoint: "http://127.0.0.1:1".to_string(),
        llm_api_key: None,
        llm_model: "test".to_string(),
        llm_timeout: Duration::from_secs(1),
        llm_max_tokens: 256,
        log_context_max_chars: 4000,
        remediation_workers: 2,
        port: 0,
        state_dir: ".".into(),
    }
}

fn setup() -> (Arc<AppState>, Arc<InMemoryStore>, Vault) {
    let vault = Vault::new(&[9u8; 32]).unwrap();
    let store = Arc::new(InMemoryStore::new());
    let state = Arc::new(AppState::new(
        test_config(vault.clone()),
        store.clone(),
        Arc::new(NoopModel),
    ));
    (state, store, vault)
}

async fn seed_oauth(store: &dyn Store, vault: &Vault, user: &str) {
    let now = Utc::now();
    store
        .upsert_oauth_connection(OAuthConnection {
            id: ids::oauth_connection(),
            user_id: user.to_string(),
            provider: Provider::Github,
            provider_user_id: "1000".to_string(),
            provider_username: "octocat".to_string(),
            access_token: vault.encrypt_str("gho_testtoken").unwrap(),
            refresh_token: None,
            scopes: vec!["repo".to_string()],
            expires_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

async fn seed_active_webhook_connection(
    store: &dyn Store,
    vault: &Vault,
    user: &str,
) -> RepositoryConnection {
    let now = Utc::now();
    let conn = RepositoryConnection {
        id: ids::repository_connection(),
        user_id: user.to_string(),
        provider: Provider::Github,
        oauth_connection_id: "oac_seeded".to_string(),
        repository_full_name: "acme/web".to_string(),
        default_branch: "main".to_string(),
        is_enabled: true,
        auto_pr_enabled: true,
        webhook_id: Some("9001".to_string()),
        webhook_secret: Some(vault.encrypt_str(&generate_secret()).unwrap()),
        webhook_url: Some("https://mendbot.test/api/v2/webhooks/github".to_string()),
        webhook_events: vec!["workflow_run".to_string()],
        webhook_status: Some(WebhookStatus::Active),
        webhook_last_delivery_at: None,
        created_at: now,
        updated_at: now,
    };
    store.insert_repository_connection(conn.clone()).await.unwrap();
    conn
}

#[tokio::test]
async fn connect_without_webhook_creates_local_record() {
    let (state, store, _vault) = setup();
    seed_oauth(store.as_ref(), &state.config.vault, "u1").await;

    let outcome = state
        .connections
        .connect(
            &state.oauth,
            "u1",
            mendbot_server::connections::ConnectRequest {
                full_name: "acme/web".to_string(),
                provider: None,
                events: None,
                auto_pr_enabled: true,
                setup_webhook: false,
                default_branch: Some("main".to_string()),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.connection.repository_full_name, "acme/web");
    assert!(outcome.connection.auto_pr_enabled);
    assert!(!outcome.webhook_installed);
    assert_eq!(outcome.connection.webhook_status, None);

    let listed = state.connections.list("u1").await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn connecting_the_same_repository_twice_conflicts() {
    let (state, store, _vault) = setup();
    seed_oauth(store.as_ref(), &state.config.vault, "u1").await;

    let request = || mendbot_server::connections::ConnectRequest {
        full_name: "acme/web".to_string(),
        provider: None,
        events: None,
        auto_pr_enabled: true,
        setup_webhook: false,
        default_branch: Some("main".to_string()),
    };

    state
        .connections
        .connect(&state.oauth, "u1", request())
        .await
        .unwrap();
    let err = state
        .connections
        .connect(&state.oauth, "u1", request())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        mendbot_server::connections::ConnectionError::AlreadyConnected(_)
    ));
}

#[tokio::test]
async fn connect_without_oauth_connection_is_rejected() {
    let (state, _store, _vault) = setup();

    let err = state
        .connections
        .connect(
            &state.oauth,
            "u1",
            mendbot_server::connections::ConnectRequest {
                full_name: "acme/web".to_string(),
                provider: None,
                events: None,
                auto_pr_enabled: true,
                setup_webhook: false,
                default_branch: Some("main".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        mendbot_server::connections::ConnectionError::NoCredentials
    ));
}

#[tokio::test]
async fn webhook_removal_is_local_durable_when_remote_fails() {
    let (state, store, _vault) = setup();
    // No OAuth connection seeded: the remote delete cannot even
    // authenticate, standing in for a provider outage.
    let conn = seed_active_webhook_connection(store.as_ref(), &state.config.vault, "u1").await;

    let outcome = state.webhooks.remove(&state.oauth, &conn.id).await.unwrap();
    assert!(!outcome.webhook_deleted);

    let stored = store.get_repository_connection(&conn.id).await.unwrap().unwrap();
    assert_eq!(stored.webhook_id, None);
    assert_eq!(stored.webhook_secret, None);
    assert_eq!(stored.webhook_url, None);
    assert_eq!(stored.webhook_status, Some(WebhookStatus::Inactive));
}

#[tokio::test]
async fn disconnect_reports_partial_success_and_removes_the_row() {
    let (state, store, _vault) = setup();
    let conn = seed_active_webhook_connection(store.as_ref(), &state.config.vault, "u1").await;

    let summary = state
        .connections
        .disconnect(&state.oauth, "u1", &conn.id, true)
        .await
        .unwrap();
    assert!(summary.deleted);
    assert!(!summary.webhook_deleted);

    assert!(store.get_repository_connection(&conn.id).await.unwrap().is_none());
}

#[tokio::test]
async fn disconnect_is_scoped_to_the_owner() {
    let (state, store, _vault) = setup();
    let conn = seed_active_webhook_connection(store.as_ref(), &state.config.vault, "u1").await;

    let err = state
        .connections
        .disconnect(&state.oauth, "someone-else", &conn.id, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        mendbot_server::connections::ConnectionError::NotFound
    ));
    assert!(store.get_repository_connection(&conn.id).await.unwrap().is_some());
}

#[tokio::test]
async fn reconnect_after_disconnect_provisions_fresh_state() {
    let (state, store, _vault) = setup();
    seed_oauth(store.as_ref(), &state.config.vault, "u1").await;
    let conn = seed_active_webhook_connection(store.as_ref(), &state.config.vault, "u1").await;
    let old_secret = conn.webhook_secret.clone();

    state
        .connections
        .disconnect(&state.oauth, "u1", &conn.id, true)
        .await
        .unwrap();

    let outcome = state
        .connections
        .connect(
            &state.oauth,
            "u1",
            mendbot_server::connections::ConnectRequest {
                full_name: "acme/web".to_string(),
                provider: None,
                events: None,
                auto_pr_enabled: true,
                setup_webhook: false,
                default_branch: Some("main".to_string()),
            },
        )
        .await
        .unwrap();

    // A fresh connection starts unprovisioned; a subsequent install
    // would mint a new secret rather than resurrect the old one.
    let fresh = store
        .get_repository_connection(&outcome.connection.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(fresh.id, conn.id);
    assert_eq!(fresh.webhook_secret, None);
    assert_ne!(fresh.webhook_secret, old_secret);
}

#[tokio::test]
async fn update_connection_settings_toggles_flags() {
    let (state, store, _vault) = setup();
    let conn = seed_active_webhook_connection(store.as_ref(), &state.config.vault, "u1").await;

    let updated = state
        .connections
        .update(
            "u1",
            &conn.id,
            mendbot_server::connections::ConnectionPatch {
                auto_pr_enabled: Some(false),
                is_enabled: None,
            },
        )
        .await
        .unwrap();
    assert!(!updated.auto_pr_enabled);
    assert!(updated.is_enabled);

    let stored = store.get_repository_connection(&conn.id).await.unwrap().unwrap();
    assert!(!stored.auto_pr_enabled);
}
