//! In-memory implementation of [`Store`] for tests.
//!
//! Mirrors the SQLite implementation's semantics, including the atomic
//! claim behavior: every method takes the single inner lock for its whole
//! duration, so claims are first-write-wins here too.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    Incident, IncidentStatus, OAuthConnection, Provider, PullRequestRecord, RepositoryConnection,
    Store, StoreError, WebhookStatus, WorkflowRun,
};

#[derive(Default)]
struct Inner {
    oauth: Vec<OAuthConnection>,
    repos: Vec<RepositoryConnection>,
    runs: Vec<WorkflowRun>,
    incidents: Vec<Incident>,
    prs: Vec<PullRequestRecord>,
    deliveries: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::storage("lock", "mutex poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_oauth_connection(
        &self,
        conn: OAuthConnection,
    ) -> Result<OAuthConnection, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .oauth
            .iter_mut()
            .find(|c| c.user_id == conn.user_id && c.provider == conn.provider)
        {
            let stored = OAuthConnection {
                id: existing.id.clone(),
                is_active: true,
                created_at: existing.created_at,
                ..conn
            };
            *existing = stored.clone();
            return Ok(stored);
        }
        inner.oauth.push(conn.clone());
        Ok(conn)
    }

    async fn get_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<OAuthConnection>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .oauth
            .iter()
            .find(|c| c.user_id == user_id && c.provider == provider && c.is_active)
            .cloned())
    }

    async fn deactivate_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner
            .oauth
            .iter_mut()
            .find(|c| c.user_id == user_id && c.provider == provider && c.is_active)
        {
            Some(conn) => {
                conn.is_active = false;
                conn.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_repository_connection(
        &self,
        conn: RepositoryConnection,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.repos.iter().any(|c| {
            c.user_id == conn.user_id && c.repository_full_name == conn.repository_full_name
        }) {
            return Err(StoreError::AlreadyExists);
        }
        inner.repos.push(conn);
        Ok(())
    }

    async fn get_repository_connection(
        &self,
        id: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.repos.iter().find(|c| c.id == id).cloned())
    }

    async fn get_repository_connection_by_name(
        &self,
        user_id: &str,
        full_name: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .repos
            .iter()
            .find(|c| c.user_id == user_id && c.repository_full_name == full_name)
            .cloned())
    }

    async fn find_connection_for_repository(
        &self,
        provider: Provider,
        full_name: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .repos
            .iter()
            .find(|c| c.provider == provider && c.repository_full_name == full_name)
            .cloned())
    }

    async fn list_repository_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<RepositoryConnection>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .repos
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_webhook_provisioned(
        &self,
        id: &str,
        webhook_id: &str,
        secret_ciphertext: &str,
        url: &str,
        events: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(conn) = inner.repos.iter_mut().find(|c| c.id == id) {
            conn.webhook_id = Some(webhook_id.to_string());
            conn.webhook_secret = Some(secret_ciphertext.to_string());
            conn.webhook_url = Some(url.to_string());
            conn.webhook_events = events.to_vec();
            conn.webhook_status = Some(WebhookStatus::Active);
            conn.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_webhook_failed(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(conn) = inner.repos.iter_mut().find(|c| c.id == id) {
            conn.webhook_id = None;
            conn.webhook_secret = None;
            conn.webhook_url = None;
            conn.webhook_status = Some(WebhookStatus::Failed);
            conn.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_webhook(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(conn) = inner.repos.iter_mut().find(|c| c.id == id) {
            conn.webhook_id = None;
            conn.webhook_secret = None;
            conn.webhook_url = None;
            conn.webhook_events = Vec::new();
            conn.webhook_status = Some(WebhookStatus::Inactive);
            conn.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_connection_settings(
        &self,
        id: &str,
        auto_pr_enabled: Option<bool>,
        is_enabled: Option<bool>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(conn) = inner.repos.iter_mut().find(|c| c.id == id) {
            if let Some(auto_pr) = auto_pr_enabled {
                conn.auto_pr_enabled = auto_pr;
            }
            if let Some(enabled) = is_enabled {
                conn.is_enabled = enabled;
            }
            conn.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_repository_connection(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.repos.len();
        inner.repos.retain(|c| c.id != id);
        Ok(inner.repos.len() < before)
    }

    async fn touch_webhook_delivery(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(conn) = inner.repos.iter_mut().find(|c| c.id == id) {
            conn.webhook_last_delivery_at = Some(at);
        }
        Ok(())
    }

    async fn upsert_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.runs.iter_mut().find(|r| {
            r.repository_connection_id == run.repository_connection_id
                && r.provider_run_id == run.provider_run_id
        }) {
            let newer = match (run.payload_updated_at, existing.payload_updated_at) {
                (Some(new), Some(old)) => new >= old,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => true,
            };
            if !newer {
                return Ok(existing.clone());
            }
            let stored = WorkflowRun {
                id: existing.id.clone(),
                created_at: existing.created_at,
                ..run
            };
            *existing = stored.clone();
            return Ok(stored);
        }
        inner.runs.push(run.clone());
        Ok(run)
    }

    async fn get_workflow_run(
        &self,
        repository_connection_id: &str,
        provider_run_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .runs
            .iter()
            .find(|r| {
                r.repository_connection_id == repository_connection_id
                    && r.provider_run_id == provider_run_id
            })
            .cloned())
    }

    async fn get_workflow_run_by_id(&self, id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn insert_incident(&self, incident: Incident) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.incidents.push(incident);
        Ok(())
    }

    async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .incidents
            .iter()
            .find(|i| i.incident_id == incident_id)
            .cloned())
    }

    async fn find_incident_for_run(
        &self,
        workflow_run_id: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .incidents
            .iter()
            .filter(|i| i.workflow_run_id.as_deref() == Some(workflow_run_id))
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn set_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(incident) = inner
            .incidents
            .iter_mut()
            .find(|i| i.incident_id == incident_id)
        {
            incident.status = status;
            incident.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_remediation_outcome(
        &self,
        incident_id: &str,
        outcome: &str,
        root_cause: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(incident) = inner
            .incidents
            .iter_mut()
            .find(|i| i.incident_id == incident_id)
        {
            incident.remediation_outcome = Some(outcome.to_string());
            if let Some(cause) = root_cause {
                incident.root_cause = Some(cause.to_string());
            }
            incident.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn try_claim_remediation(
        &self,
        incident_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner
            .incidents
            .iter_mut()
            .find(|i| i.incident_id == incident_id)
        {
            Some(incident) if incident.remediation_attempted_at.is_none() => {
                incident.remediation_attempted_at = Some(at);
                incident.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_pull_request_record(
        &self,
        record: PullRequestRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.prs.push(record);
        Ok(())
    }

    async fn get_pull_request_for_incident(
        &self,
        incident_id: &str,
    ) -> Result<Option<PullRequestRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .prs
            .iter()
            .filter(|p| p.incident_id == incident_id)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn claim_delivery(
        &self,
        delivery_id: &str,
        _at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.deliveries.insert(delivery_id.to_string()))
    }
}
