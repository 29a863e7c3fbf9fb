//! Workflow tracker: consumes verified webhook events, upserts runs,
//! mints incidents on failure, and requests remediation at most once per
//! incident.
//!
//! Deliveries for the same run may arrive duplicated or out of order;
//! the run upsert is idempotent and latest-wins, and the remediation
//! guard is an atomic first-write-wins claim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mendbot_core::Severity;
use serde::Deserialize;
use tracing::{info, warn};

use crate::store::{
    ids, Incident, IncidentStatus, RepositoryConnection, RunState, Store, StoreError, WorkflowRun,
};

/// A provider-agnostic run event, normalized from either family's
/// payload before it reaches the tracker.
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub provider_run_id: String,
    pub run_number: Option<i64>,
    pub workflow_name: String,
    pub workflow_id: String,
    pub state: RunState,
    pub conclusion: Option<String>,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub event: Option<String>,
    pub run_url: Option<String>,
    pub payload_updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

/// What the ingest layer should do after the tracker has persisted an
/// event.
#[derive(Debug)]
pub enum TrackOutcome {
    /// Run state recorded; nothing further to do.
    Recorded { run_id: String },
    /// A failed run produced (or re-surfaced) an incident and this call
    /// won the remediation claim: dispatch the orchestrator exactly once.
    RemediationRequested { incident_id: String },
    /// An incident exists but remediation was already claimed, disabled,
    /// or already produced a pull request.
    IncidentRecorded { incident_id: String },
}

pub struct WorkflowTracker {
    store: Arc<dyn Store>,
}

impl WorkflowTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn process_run_event(
        &self,
        connection: &RepositoryConnection,
        event: RunEvent,
    ) -> Result<TrackOutcome, StoreError> {
        let now = Utc::now();
        let run = WorkflowRun {
            id: ids::workflow_run(),
            repository_connection_id: connection.id.clone(),
            provider_run_id: event.provider_run_id.clone(),
            run_number: event.run_number,
            workflow_name: event.workflow_name.clone(),
            workflow_id: event.workflow_id.clone(),
            state: event.state,
            conclusion: event.conclusion.clone(),
            branch: event.branch.clone(),
            commit_sha: event.commit_sha.clone(),
            commit_message: event.commit_message.clone(),
            author: event.author.clone(),
            event: event.event.clone(),
            run_url: event.run_url.clone(),
            payload_updated_at: event.payload_updated_at,
            started_at: event.started_at,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.upsert_workflow_run(run).await?;
        info!(
            "Tracked run {} for {} (state: {})",
            stored.provider_run_id,
            connection.repository_full_name,
            stored.state.as_str()
        );

        // Only failed terminal transitions matter for remediation;
        // everything else is observability.
        if stored.state != RunState::Failed {
            return Ok(TrackOutcome::Recorded { run_id: stored.id });
        }

        let severity = if stored.branch == connection.default_branch {
            Severity::High
        } else {
            Severity::Medium
        };

        let incident = match self.store.find_incident_for_run(&stored.id).await? {
            Some(incident) => {
                // An identical failure reopens the same logical incident.
                if incident.status == IncidentStatus::Resolved {
                    self.store
                        .set_incident_status(&incident.incident_id, IncidentStatus::Open)
                        .await?;
                    info!("Reopened incident {}", incident.incident_id);
                }
                incident
            }
            None => {
                let incident = Incident {
                    incident_id: ids::incident(),
                    user_id: connection.user_id.clone(),
                    repository_connection_id: Some(connection.id.clone()),
                    workflow_run_id: Some(stored.id.clone()),
                    severity,
                    status: IncidentStatus::Open,
                    source: "webhook".to_string(),
                    failure_type: "workflow_failure".to_string(),
                    error_message: format!(
                        "Workflow '{}' failed on {}",
                        stored.workflow_name, stored.branch
                    ),
                    root_cause: None,
                    confidence: None,
                    remediation_attempted_at: None,
                    remediation_outcome: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_incident(incident.clone()).await?;
                info!(
                    "Opened incident {} for run {} ({})",
                    incident.incident_id,
                    stored.provider_run_id,
                    severity.as_str()
                );
                incident
            }
        };

        if !connection.auto_pr_enabled || !connection.is_enabled {
            return Ok(TrackOutcome::IncidentRecorded {
                incident_id: incident.incident_id,
            });
        }

        if self
            .store
            .get_pull_request_for_incident(&incident.incident_id)
            .await?
            .is_some()
        {
            info!(
                "Incident {} already has a pull request, not re-remediating",
                incident.incident_id
            );
            return Ok(TrackOutcome::IncidentRecorded {
                incident_id: incident.incident_id,
            });
        }

        // First write wins; concurrent duplicate deliveries observe the
        // claim and exit without dispatching.
        if self
            .store
            .try_claim_remediation(&incident.incident_id, now)
            .await?
        {
            Ok(TrackOutcome::RemediationRequested {
                incident_id: incident.incident_id,
            })
        } else {
            Ok(TrackOutcome::IncidentRecorded {
                incident_id: incident.incident_id,
            })
        }
    }
}

// --- Payload decoding --------------------------------------------------------

/// The subset of the first provider family's webhook body the tracker
/// depends on. Any absent required field makes the delivery `ignored`.
#[derive(Debug, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub repository: Option<RepositoryField>,
    pub workflow_run: Option<WorkflowRunField>,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryField {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunField {
    pub id: u64,
    pub name: Option<String>,
    pub head_branch: Option<String>,
    pub head_sha: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub html_url: Option<String>,
    pub workflow_id: Option<u64>,
    pub event: Option<String>,
    pub run_number: Option<i64>,
    pub actor: Option<ActorField>,
    pub head_commit: Option<HeadCommitField>,
    pub run_started_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActorField {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct HeadCommitField {
    pub message: Option<String>,
    pub author: Option<CommitAuthorField>,
}

#[derive(Debug, Deserialize)]
pub struct CommitAuthorField {
    pub name: Option<String>,
}

/// Map a `workflow_run` payload to a normalized event. Returns `None`
/// when a field the tracker depends on is missing.
pub fn run_event_from_github(payload: &GitHubWebhookPayload) -> Option<RunEvent> {
    let action = payload.action.as_deref()?;
    let run = payload.workflow_run.as_ref()?;

    let state = github_run_state(action, run.status.as_deref(), run.conclusion.as_deref())?;
    let branch = run.head_branch.clone()?;
    let commit_sha = run.head_sha.clone()?;

    Some(RunEvent {
        provider_run_id: run.id.to_string(),
        run_number: run.run_number,
        workflow_name: run.name.clone().unwrap_or_else(|| "unknown".to_string()),
        workflow_id: run
            .workflow_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        state,
        conclusion: run.conclusion.clone(),
        branch,
        commit_sha,
        commit_message: run.head_commit.as_ref().and_then(|c| c.message.clone()),
        author: run
            .head_commit
            .as_ref()
            .and_then(|c| c.author.as_ref())
            .and_then(|a| a.name.clone())
            .or_else(|| run.actor.as_ref().map(|a| a.login.clone())),
        event: run.event.clone(),
        run_url: run.html_url.clone(),
        payload_updated_at: run.updated_at.as_deref().and_then(parse_provider_ts),
        started_at: run.run_started_at.as_deref().and_then(parse_provider_ts),
    })
}

fn github_run_state(
    action: &str,
    status: Option<&str>,
    conclusion: Option<&str>,
) -> Option<RunState> {
    match action {
        "requested" | "queued" => Some(RunState::Queued),
        "in_progress" => Some(RunState::Running),
        "completed" => match conclusion {
            Some("success") => Some(RunState::Success),
            Some("cancelled") | Some("skipped") | Some("neutral") | Some("stale") => {
                Some(RunState::Cancelled)
            }
            // failure, timed_out, startup_failure, action_required all
            // count as failed terminals.
            Some(_) => Some(RunState::Failed),
            None => None,
        },
        _ => match status {
            Some("queued") | Some("waiting") | Some("pending") | Some("requested") => {
                Some(RunState::Queued)
            }
            Some("in_progress") => Some(RunState::Running),
            _ => None,
        },
    }
}

/// Second family: pipeline events. Field names differ, semantics map
/// one-to-one.
#[derive(Debug, Deserialize)]
pub struct GitLabPipelinePayload {
    pub object_kind: Option<String>,
    pub project: Option<GitLabProjectField>,
    pub object_attributes: Option<GitLabPipelineAttributes>,
    pub commit: Option<GitLabCommitField>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabProjectField {
    pub path_with_namespace: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabPipelineAttributes {
    pub id: u64,
    pub status: Option<String>,
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
    pub sha: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabCommitField {
    pub message: Option<String>,
    pub author: Option<GitLabAuthorField>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabAuthorField {
    pub name: Option<String>,
}

pub fn run_event_from_gitlab(payload: &GitLabPipelinePayload) -> Option<RunEvent> {
    let attrs = payload.object_attributes.as_ref()?;
    let state = gitlab_pipeline_state(attrs.status.as_deref()?)?;
    let branch = attrs.ref_name.clone()?;
    let commit_sha = attrs.sha.clone()?;

    let run_url = payload
        .project
        .as_ref()
        .and_then(|p| p.web_url.as_ref())
        .map(|base| format!("{}/-/pipelines/{}", base, attrs.id));

    Some(RunEvent {
        provider_run_id: attrs.id.to_string(),
        run_number: None,
        workflow_name: "pipeline".to_string(),
        workflow_id: attrs.id.to_string(),
        state,
        conclusion: attrs.status.clone(),
        branch,
        commit_sha,
        commit_message: payload.commit.as_ref().and_then(|c| c.message.clone()),
        author: payload
            .commit
            .as_ref()
            .and_then(|c| c.author.as_ref())
            .and_then(|a| a.name.clone()),
        event: Some("pipeline".to_string()),
        run_url,
        payload_updated_at: attrs
            .finished_at
            .as_deref()
            .or(attrs.created_at.as_deref())
            .and_then(parse_provider_ts),
        started_at: attrs.created_at.as_deref().and_then(parse_provider_ts),
    })
}

fn gitlab_pipeline_state(status: &str) -> Option<RunState> {
    match status {
        "pending" | "created" | "waiting_for_resource" | "preparing" | "scheduled" => {
            Some(RunState::Queued)
        }
        "running" => Some(RunState::Running),
        "success" => Some(RunState::Success),
        "failed" => Some(RunState::Failed),
        "canceled" | "skipped" => Some(RunState::Cancelled),
        other => {
            warn!("Unknown pipeline status {:?}, ignoring", other);
            None
        }
    }
}

fn parse_provider_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| {
            // GitLab also emits "2024-05-02 10:31:07 UTC".
            chrono::NaiveDateTime::parse_from_str(s.trim_end_matches(" UTC"), "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Provider};
    use serde_json::json;

    fn connection(auto_pr: bool) -> RepositoryConnection {
        let now = Utc::now();
        RepositoryConnection {
            id: "rc_test".to_string(),
            user_id: "u1".to_string(),
            provider: Provider::Github,
            oauth_connection_id: "oac_test".to_string(),
            repository_full_name: "acme/web".to_string(),
            default_branch: "main".to_string(),
            is_enabled: true,
            auto_pr_enabled: auto_pr,
            webhook_id: Some("9001".to_string()),
            webhook_secret: Some("v1.k.ct".to_string()),
            webhook_url: None,
            webhook_events: vec!["workflow_run".to_string()],
            webhook_status: Some(crate::store::WebhookStatus::Active),
            webhook_last_delivery_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn failed_event(run_id: &str, at: DateTime<Utc>) -> RunEvent {
        RunEvent {
            provider_run_id: run_id.to_string(),
            run_number: Some(12),
            workflow_name: "CI".to_string(),
            workflow_id: "101".to_string(),
            state: RunState::Failed,
            conclusion: Some("failure".to_string()),
            branch: "main".to_string(),
            commit_sha: "abc".to_string(),
            commit_message: Some("break the build".to_string()),
            author: Some("dev".to_string()),
            event: Some("push".to_string()),
            run_url: None,
            payload_updated_at: Some(at),
            started_at: None,
        }
    }

    #[tokio::test]
    async fn failed_run_opens_incident_and_requests_remediation_once() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = WorkflowTracker::new(store.clone());
        let conn = connection(true);
        let at = Utc::now();

        let first = tracker
            .process_run_event(&conn, failed_event("42", at))
            .await
            .unwrap();
        let incident_id = match first {
            TrackOutcome::RemediationRequested { incident_id } => incident_id,
            other => panic!("expected remediation request, got {:?}", other),
        };

        // Duplicate delivery: same run, same incident, no second dispatch.
        let second = tracker
            .process_run_event(&conn, failed_event("42", at))
            .await
            .unwrap();
        match second {
            TrackOutcome::IncidentRecorded { incident_id: id } => assert_eq!(id, incident_id),
            other => panic!("expected incident recorded, got {:?}", other),
        }

        let incident = store.get_incident(&incident_id).await.unwrap().unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.severity, Severity::High);
        assert!(incident.remediation_attempted_at.is_some());
    }

    #[tokio::test]
    async fn auto_pr_disabled_records_incident_without_dispatch() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = WorkflowTracker::new(store.clone());
        let conn = connection(false);

        let outcome = tracker
            .process_run_event(&conn, failed_event("42", Utc::now()))
            .await
            .unwrap();
        let incident_id = match outcome {
            TrackOutcome::IncidentRecorded { incident_id } => incident_id,
            other => panic!("expected incident recorded, got {:?}", other),
        };

        let incident = store.get_incident(&incident_id).await.unwrap().unwrap();
        assert!(incident.remediation_attempted_at.is_none());
    }

    #[tokio::test]
    async fn non_default_branch_failure_is_medium_severity() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = WorkflowTracker::new(store.clone());
        let conn = connection(true);

        let mut event = failed_event("43", Utc::now());
        event.branch = "feature/x".to_string();
        let outcome = tracker.process_run_event(&conn, event).await.unwrap();
        let incident_id = match outcome {
            TrackOutcome::RemediationRequested { incident_id } => incident_id,
            other => panic!("unexpected {:?}", other),
        };
        let incident = store.get_incident(&incident_id).await.unwrap().unwrap();
        assert_eq!(incident.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_claim_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = Arc::new(WorkflowTracker::new(store.clone()));
        let conn = connection(true);
        let at = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                tracker.process_run_event(&conn, failed_event("42", at)).await
            }));
        }

        let mut requested = 0;
        for handle in handles {
            if let TrackOutcome::RemediationRequested { .. } = handle.await.unwrap().unwrap() {
                requested += 1;
            }
        }
        assert_eq!(requested, 1);
    }

    #[tokio::test]
    async fn success_run_is_recorded_without_incident() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = WorkflowTracker::new(store.clone());
        let conn = connection(true);

        let mut event = failed_event("44", Utc::now());
        event.state = RunState::Success;
        event.conclusion = Some("success".to_string());

        let outcome = tracker.process_run_event(&conn, event).await.unwrap();
        let run_id = match outcome {
            TrackOutcome::Recorded { run_id } => run_id,
            other => panic!("unexpected {:?}", other),
        };
        assert!(store.find_incident_for_run(&run_id).await.unwrap().is_none());
    }

    #[test]
    fn github_state_machine_mapping() {
        assert_eq!(github_run_state("queued", None, None), Some(RunState::Queued));
        assert_eq!(
            github_run_state("in_progress", None, None),
            Some(RunState::Running)
        );
        assert_eq!(
            github_run_state("completed", Some("completed"), Some("success")),
            Some(RunState::Success)
        );
        assert_eq!(
            github_run_state("completed", Some("completed"), Some("failure")),
            Some(RunState::Failed)
        );
        assert_eq!(
            github_run_state("completed", Some("completed"), Some("timed_out")),
            Some(RunState::Failed)
        );
        assert_eq!(
            github_run_state("completed", Some("completed"), Some("cancelled")),
            Some(RunState::Cancelled)
        );
        assert_eq!(github_run_state("completed", Some("completed"), None), None);
    }

    #[test]
    fn github_payload_with_missing_fields_is_ignored() {
        let payload: GitHubWebhookPayload = serde_json::from_value(json!({
            "action": "completed",
            "repository": {"full_name": "acme/web"},
            "workflow_run": {"id": 42, "conclusion": "failure"}
        }))
        .unwrap();
        // No head_branch/head_sha: the tracker cannot act on it.
        assert!(run_event_from_github(&payload).is_none());
    }

    #[test]
    fn github_payload_maps_to_run_event() {
        let payload: GitHubWebhookPayload = serde_json::from_value(json!({
            "action": "completed",
            "repository": {"full_name": "acme/web"},
            "workflow_run": {
                "id": 42,
                "name": "CI",
                "head_branch": "main",
                "head_sha": "abc",
                "status": "completed",
                "conclusion": "failure",
                "html_url": "https://github.com/acme/web/actions/runs/42",
                "workflow_id": 7,
                "event": "push",
                "run_number": 12,
                "actor": {"login": "dev"},
                "head_commit": {"message": "break it", "author": {"name": "Dev A"}},
                "run_started_at": "2024-05-02T10:00:00Z",
                "updated_at": "2024-05-02T10:05:00Z"
            }
        }))
        .unwrap();

        let event = run_event_from_github(&payload).unwrap();
        assert_eq!(event.provider_run_id, "42");
        assert_eq!(event.state, RunState::Failed);
        assert_eq!(event.branch, "main");
        assert_eq!(event.author.as_deref(), Some("Dev A"));
        assert!(event.payload_updated_at.is_some());
    }

    #[test]
    fn gitlab_pipeline_maps_to_run_event() {
        let payload: GitLabPipelinePayload = serde_json::from_value(json!({
            "object_kind": "pipeline",
            "project": {"path_with_namespace": "acme/web", "web_url": "https://gitlab.com/acme/web"},
            "object_attributes": {
                "id": 99,
                "status": "failed",
                "ref": "main",
                "sha": "def",
                "created_at": "2024-05-02 10:00:00 UTC",
                "finished_at": "2024-05-02 10:05:00 UTC"
            },
            "commit": {"message": "oops", "author": {"name": "Dev B"}}
        }))
        .unwrap();

        let event = run_event_from_gitlab(&payload).unwrap();
        assert_eq!(event.provider_run_id, "99");
        assert_eq!(event.state, RunState::Failed);
        assert_eq!(event.branch, "main");
        assert!(event.payload_updated_at.is_some());
        assert_eq!(
            event.run_url.as_deref(),
            Some("https://gitlab.com/acme/web/-/pipelines/99")
        );
    }
}
