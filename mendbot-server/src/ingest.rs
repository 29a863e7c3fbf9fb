//! Universal webhook ingest endpoints, one per provider family.
//!
//! Both handlers verify over the exact bytes received before any
//! parsing, answer 2xx for accepted or knowingly-ignored events, 401
//! only for verification failures, and 400 only for payloads missing
//! the repository identifier. Providers retry on non-2xx, so transient
//! internal failures are swallowed with a 2xx and logged.
//!
//! Remediation is always dispatched to the worker pool, never run
//! inline: the handler's job ends at signature verification plus
//! tracker upsert, well inside the provider's receiver timeout.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::store::Provider;
use crate::tracker::{
    run_event_from_github, run_event_from_gitlab, GitHubWebhookPayload, GitLabPipelinePayload,
    TrackOutcome,
};
use crate::webhooks::{verify_signature, verify_token};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/github", post(github_webhook))
        .route("/webhooks/gitlab", post(gitlab_webhook))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn accepted(message: &str) -> Json<Value> {
    Json(json!({ "status": "ok", "message": message }))
}

async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let event_type = header(&headers, "x-github-event").unwrap_or("unknown");
    let delivery_id = header(&headers, "x-github-delivery").map(|s| s.to_string());

    let signature = header(&headers, "x-hub-signature-256")
        .map(|s| s.to_string())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let payload: GitHubWebhookPayload =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let full_name = payload
        .repository
        .as_ref()
        .map(|r| r.full_name.clone())
        .ok_or(StatusCode::BAD_REQUEST)?;

    info!(
        "Received github webhook: event={} repository={} delivery={:?}",
        event_type, full_name, delivery_id
    );

    let connection = match state
        .store
        .find_connection_for_repository(Provider::Github, &full_name)
        .await
    {
        Ok(Some(conn)) => conn,
        Ok(None) => {
            // Deliveries for repositories that were just disconnected are
            // ignored without error.
            return Ok(accepted("repository not connected"));
        }
        Err(e) => {
            error!("Store lookup failed for {}: {}", full_name, e);
            return Ok(accepted("deferred"));
        }
    };

    if !connection.is_enabled {
        return Ok(accepted("connection disabled"));
    }

    // Verification works on the raw bytes, before any re-encoding.
    let secret = state
        .webhooks
        .decrypt_secret(&connection)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if !verify_signature(&secret, &body, &signature) {
        warn!("Signature verification failed for {}", full_name);
        return Err(StatusCode::UNAUTHORIZED);
    }

    if let Some(delivery) = &delivery_id {
        match state.store.claim_delivery(delivery, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Duplicate delivery {} ignored", delivery);
                return Ok(accepted("duplicate delivery"));
            }
            Err(e) => {
                // Dedup is best-effort; the tracker upsert is idempotent
                // anyway.
                warn!("Delivery claim failed for {}: {}", delivery, e);
            }
        }
    }

    if let Err(e) = state
        .store
        .touch_webhook_delivery(&connection.id, Utc::now())
        .await
    {
        warn!("Could not record delivery time for {}: {}", full_name, e);
    }

    match event_type {
        "workflow_run" => {
            let Some(event) = run_event_from_github(&payload) else {
                return Ok(accepted("event missing required fields"));
            };
            match state.tracker.process_run_event(&connection, event).await {
                Ok(TrackOutcome::RemediationRequested { incident_id }) => {
                    state.dispatcher.dispatch(incident_id.clone());
                    Ok(Json(json!({
                        "status": "ok",
                        "message": "remediation dispatched",
                        "incident_id": incident_id,
                    })))
                }
                Ok(TrackOutcome::IncidentRecorded { incident_id }) => Ok(Json(json!({
                    "status": "ok",
                    "message": "incident recorded",
                    "incident_id": incident_id,
                }))),
                Ok(TrackOutcome::Recorded { .. }) => Ok(accepted("run recorded")),
                Err(e) => {
                    // A 5xx would make the provider retry into the same
                    // failure; swallow and leave a diagnostic.
                    error!(
                        "Tracker failed for {} delivery {:?}: {}",
                        full_name, delivery_id, e
                    );
                    Ok(accepted("deferred"))
                }
            }
        }
        "pull_request" | "push" => Ok(accepted("event recorded")),
        other => {
            info!("Ignoring github event {:?}", other);
            Ok(accepted("event not processed"))
        }
    }
}

async fn gitlab_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let event_type = header(&headers, "x-gitlab-event").unwrap_or("unknown");
    let delivery_id = header(&headers, "x-gitlab-event-uuid").map(|s| s.to_string());
    let token = header(&headers, "x-gitlab-token")
        .map(|s| s.to_string())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let payload: GitLabPipelinePayload =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let project_path = payload
        .project
        .as_ref()
        .map(|p| p.path_with_namespace.clone())
        .ok_or(StatusCode::BAD_REQUEST)?;

    info!(
        "Received gitlab webhook: event={} project={}",
        event_type, project_path
    );

    let connection = match state
        .store
        .find_connection_for_repository(Provider::Gitlab, &project_path)
        .await
    {
        Ok(Some(conn)) => conn,
        Ok(None) => return Ok(accepted("project not connected")),
        Err(e) => {
            error!("Store lookup failed for {}: {}", project_path, e);
            return Ok(accepted("deferred"));
        }
    };

    if !connection.is_enabled {
        return Ok(accepted("connection disabled"));
    }

    let secret = state
        .webhooks
        .decrypt_secret(&connection)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if !verify_token(&secret, &token) {
        warn!("Token verification failed for {}", project_path);
        return Err(StatusCode::UNAUTHORIZED);
    }

    if let Some(delivery) = &delivery_id {
        if let Ok(false) = state.store.claim_delivery(delivery, Utc::now()).await {
            return Ok(accepted("duplicate delivery"));
        }
    }

    if let Err(e) = state
        .store
        .touch_webhook_delivery(&connection.id, Utc::now())
        .await
    {
        warn!("Could not record delivery time for {}: {}", project_path, e);
    }

    match event_type {
        "Pipeline Hook" => {
            let Some(event) = run_event_from_gitlab(&payload) else {
                return Ok(accepted("event missing required fields"));
            };
            match state.tracker.process_run_event(&connection, event).await {
                Ok(TrackOutcome::RemediationRequested { incident_id }) => {
                    state.dispatcher.dispatch(incident_id.clone());
                    Ok(Json(json!({
                        "status": "ok",
                        "message": "remediation dispatched",
                        "incident_id": incident_id,
                    })))
                }
                Ok(TrackOutcome::IncidentRecorded { incident_id }) => Ok(Json(json!({
                    "status": "ok",
                    "message": "incident recorded",
                    "incident_id": incident_id,
                }))),
                Ok(TrackOutcome::Recorded { .. }) => Ok(accepted("pipeline recorded")),
                Err(e) => {
                    error!("Tracker failed for {}: {}", project_path, e);
                    Ok(accepted("deferred"))
                }
            }
        }
        "Merge Request Hook" | "Push Hook" => Ok(accepted("event recorded")),
        other => {
            info!("Ignoring gitlab event {:?}", other);
            Ok(accepted("event not processed"))
        }
    }
}
