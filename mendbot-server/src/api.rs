//! Authenticated REST surface: OAuth and repository-connection
//! endpoints.
//!
//! Identity issuance is external; the fronting identity layer injects
//! the validated principal as `X-User-Id`, and requests without it are
//! rejected.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::connections::{ConnectRequest, ConnectionError, ConnectionPatch};
use crate::oauth::OAuthError;
use crate::store::Provider;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/oauth/github/authorize", get(begin_authorize))
        .route("/oauth/github/callback", get(oauth_callback))
        .route("/oauth/github", delete(oauth_disconnect))
        .route("/oauth/connections", get(list_oauth_connections))
        .route("/repositories/available", get(list_available))
        .route("/repositories/connect", post(connect_repository))
        .route("/repositories/connections", get(list_connections))
        .route(
            "/repositories/connections/:id",
            get(get_connection)
                .patch(update_connection)
                .delete(disconnect_repository),
        )
}

fn principal(headers: &HeaderMap) -> Result<String, StatusCode> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(StatusCode::UNAUTHORIZED)
}

fn oauth_status(e: &OAuthError) -> StatusCode {
    match e {
        OAuthError::StateRejected => StatusCode::BAD_REQUEST,
        OAuthError::ExchangeFailed(_) | OAuthError::UserInfoFailed(_) => StatusCode::UNAUTHORIZED,
        OAuthError::NotConnected => StatusCode::NOT_FOUND,
        OAuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn connection_status(e: &ConnectionError) -> StatusCode {
    match e {
        ConnectionError::AlreadyConnected(_) => StatusCode::CONFLICT,
        ConnectionError::NotFound => StatusCode::NOT_FOUND,
        ConnectionError::NoCredentials | ConnectionError::BadName(_) => StatusCode::BAD_REQUEST,
        ConnectionError::Store(_) | ConnectionError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn begin_authorize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let url = state.oauth.begin(&user_id).map_err(|e| oauth_status(&e))?;
    Ok(Json(json!({ "authorization_url": url })))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, StatusCode> {
    match state.oauth.complete(&query.code, &query.state).await {
        Ok(summary) => Ok(Json(json!({ "status": "connected", "connection": summary }))),
        Err(e) => {
            warn!("OAuth callback rejected: {}", e);
            Err(oauth_status(&e))
        }
    }
}

async fn oauth_disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let outcome = state
        .oauth
        .disconnect(&user_id, Provider::Github)
        .await
        .map_err(|e| oauth_status(&e))?;
    Ok(Json(json!({
        "status": "disconnected",
        "revoked_remotely": outcome.revoked_remotely,
    })))
}

async fn list_oauth_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let connections = state
        .oauth
        .list_connections(&user_id)
        .await
        .map_err(|e| oauth_status(&e))?;
    Ok(Json(json!({ "connections": connections })))
}

#[derive(Debug, Deserialize)]
struct AvailableQuery {
    #[serde(default = "default_sort")]
    sort: String,
    #[serde(default = "default_page")]
    page: u32,
}

fn default_sort() -> String {
    "updated".to_string()
}

fn default_page() -> u32 {
    1
}

async fn list_available(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AvailableQuery>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let repositories = state
        .connections
        .list_available(&state.oauth, &user_id, &query.sort, query.page)
        .await
        .map_err(|e| connection_status(&e))?;
    Ok(Json(json!({ "repositories": repositories, "page": query.page })))
}

async fn connect_repository(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let user_id = principal(&headers)?;
    let outcome = state
        .connections
        .connect(&state.oauth, &user_id, request)
        .await
        .map_err(|e| connection_status(&e))?;
    Ok((StatusCode::CREATED, Json(json!(outcome))))
}

async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let connections = state
        .connections
        .list(&user_id)
        .await
        .map_err(|e| connection_status(&e))?;
    Ok(Json(json!({ "connections": connections })))
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let connection = state
        .connections
        .get(&user_id, &id)
        .await
        .map_err(|e| connection_status(&e))?;
    Ok(Json(json!(connection)))
}

async fn update_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<ConnectionPatch>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let connection = state
        .connections
        .update(&user_id, &id, patch)
        .await
        .map_err(|e| connection_status(&e))?;
    Ok(Json(json!(connection)))
}

#[derive(Debug, Deserialize)]
struct DisconnectQuery {
    #[serde(default = "default_true")]
    delete_webhook: bool,
}

fn default_true() -> bool {
    true
}

async fn disconnect_repository(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DisconnectQuery>,
) -> Result<Json<Value>, StatusCode> {
    let user_id = principal(&headers)?;
    let summary = state
        .connections
        .disconnect(&state.oauth, &user_id, &id, query.delete_webhook)
        .await
        .map_err(|e| connection_status(&e))?;
    Ok(Json(json!(summary)))
}
