//! Persistence layer: entities and the narrow repository abstraction the
//! rest of the service talks to.
//!
//! The trait exposes only the upsert/guard operations the components
//! need, not free-form queries. Two implementations exist: SQLite for
//! the real service and an in-memory store for tests.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mendbot_core::Severity;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error during {op}: {message}")]
    Storage { op: &'static str, message: String },
    #[error("record already exists")]
    AlreadyExists,
    #[error("corrupt record: {0}")]
    Corruption(String),
}

impl StoreError {
    pub fn storage(op: &'static str, message: impl Into<String>) -> Self {
        StoreError::Storage {
            op,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Provider::Github),
            "gitlab" => Some(Provider::Gitlab),
            _ => None,
        }
    }
}

/// An OAuth connection to a code host. Token fields hold vault
/// ciphertexts, never plaintext.
#[derive(Debug, Clone)]
pub struct OAuthConnection {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub provider_user_id: String,
    pub provider_username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Active,
    Inactive,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Active => "active",
            WebhookStatus::Inactive => "inactive",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(WebhookStatus::Active),
            "inactive" => Some(WebhookStatus::Inactive),
            "failed" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }
}

/// A repository the user connected for tracking. Owns its webhook and the
/// encrypted webhook secret; `webhook_status == None` means no hook has
/// been provisioned yet.
#[derive(Debug, Clone)]
pub struct RepositoryConnection {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub oauth_connection_id: String,
    pub repository_full_name: String,
    pub default_branch: String,
    pub is_enabled: bool,
    pub auto_pr_enabled: bool,
    pub webhook_id: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_events: Vec<String>,
    pub webhook_status: Option<WebhookStatus>,
    pub webhook_last_delivery_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Success | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunState::Queued),
            "running" => Some(RunState::Running),
            "success" => Some(RunState::Success),
            "failed" => Some(RunState::Failed),
            "cancelled" => Some(RunState::Cancelled),
            _ => None,
        }
    }
}

/// One tracked workflow run, keyed by
/// `(repository_connection_id, provider_run_id)`.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: String,
    pub repository_connection_id: String,
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
    /// The provider's `updated_at` for this delivery; upserts are
    /// latest-wins on this field so out-of-order deliveries never regress
    /// a newer state.
    pub payload_updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IncidentStatus::Open),
            "investigating" => Some(IncidentStatus::Investigating),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

/// A single remediable failure. `remediation_attempted_at` is the
/// at-most-once guard: it is claimed atomically before the orchestrator
/// is dispatched, and duplicate deliveries observe the claim and exit.
#[derive(Debug, Clone)]
pub struct Incident {
    pub incident_id: String,
    pub user_id: String,
    pub repository_connection_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub source: String,
    pub failure_type: String,
    pub error_message: String,
    pub root_cause: Option<String>,
    pub confidence: Option<f64>,
    pub remediation_attempted_at: Option<DateTime<Utc>>,
    /// Typed outcome string (`failed_no_logs`, ...) once an attempt ran.
    pub remediation_outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PullRequestRecord {
    pub id: String,
    pub incident_id: String,
    pub pr_number: i64,
    pub pr_url: String,
    pub branch_name: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

/// Narrow persistence interface. All mutations that back a concurrency
/// guarantee (`try_claim_remediation`, `claim_delivery`, run upserts) are
/// atomic in every implementation.
#[async_trait]
pub trait Store: Send + Sync {
    // --- OAuth connections -------------------------------------------------

    /// Insert or update the one connection for `(user_id, provider)`.
    async fn upsert_oauth_connection(
        &self,
        conn: OAuthConnection,
    ) -> Result<OAuthConnection, StoreError>;

    /// Fetch the active connection for `(user_id, provider)`, if any.
    async fn get_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<OAuthConnection>, StoreError>;

    /// Mark the connection revoked. Returns whether a row changed.
    async fn deactivate_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<bool, StoreError>;

    // --- Repository connections --------------------------------------------

    /// Insert a new connection; `AlreadyExists` if `(user_id, full_name)`
    /// is taken.
    async fn insert_repository_connection(
        &self,
        conn: RepositoryConnection,
    ) -> Result<(), StoreError>;

    async fn get_repository_connection(
        &self,
        id: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError>;

    async fn get_repository_connection_by_name(
        &self,
        user_id: &str,
        full_name: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError>;

    /// Ingest-path lookup by `(provider, repository_full_name)`.
    async fn find_connection_for_repository(
        &self,
        provider: Provider,
        full_name: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError>;

    async fn list_repository_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<RepositoryConnection>, StoreError>;

    /// Record a successful hook installation (status becomes `active`).
    async fn update_webhook_provisioned(
        &self,
        id: &str,
        webhook_id: &str,
        secret_ciphertext: &str,
        url: &str,
        events: &[String],
    ) -> Result<(), StoreError>;

    /// Record a failed installation: status `failed`, no secret stored.
    async fn mark_webhook_failed(&self, id: &str) -> Result<(), StoreError>;

    /// Null out all webhook fields and set status `inactive`. Runs
    /// unconditionally, independent of any remote call's outcome.
    async fn clear_webhook(&self, id: &str) -> Result<(), StoreError>;

    async fn update_connection_settings(
        &self,
        id: &str,
        auto_pr_enabled: Option<bool>,
        is_enabled: Option<bool>,
    ) -> Result<(), StoreError>;

    async fn delete_repository_connection(&self, id: &str) -> Result<bool, StoreError>;

    async fn touch_webhook_delivery(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- Workflow runs ------------------------------------------------------

    /// Idempotent upsert on `(repository_connection_id, provider_run_id)`,
    /// latest-wins by `payload_updated_at`. Returns the stored row.
    async fn upsert_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError>;

    async fn get_workflow_run(
        &self,
        repository_connection_id: &str,
        provider_run_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    async fn get_workflow_run_by_id(&self, id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    // --- Incidents ----------------------------------------------------------

    async fn insert_incident(&self, incident: Incident) -> Result<(), StoreError>;

    async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, StoreError>;

    /// The incident minted for this run, in any status.
    async fn find_incident_for_run(
        &self,
        workflow_run_id: &str,
    ) -> Result<Option<Incident>, StoreError>;

    async fn set_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<(), StoreError>;

    async fn record_remediation_outcome(
        &self,
        incident_id: &str,
        outcome: &str,
        root_cause: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Atomically claim the remediation guard. Returns true exactly once
    /// per incident; concurrent callers observe false.
    async fn try_claim_remediation(
        &self,
        incident_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // --- Pull request records ----------------------------------------------

    async fn insert_pull_request_record(
        &self,
        record: PullRequestRecord,
    ) -> Result<(), StoreError>;

    async fn get_pull_request_for_incident(
        &self,
        incident_id: &str,
    ) -> Result<Option<PullRequestRecord>, StoreError>;

    // --- Delivery idempotency ----------------------------------------------

    /// Claim a provider delivery id. Returns true for the first claim,
    /// false for duplicates.
    async fn claim_delivery(&self, delivery_id: &str, at: DateTime<Utc>)
        -> Result<bool, StoreError>;
}

/// Opaque-id constructors, shared by both store implementations' callers.
pub mod ids {
    use uuid::Uuid;

    pub fn oauth_connection() -> String {
        format!("oac_{}", Uuid::new_v4().simple())
    }

    pub fn repository_connection() -> String {
        format!("rc_{}", Uuid::new_v4().simple())
    }

    pub fn workflow_run() -> String {
        format!("wfr_{}", Uuid::new_v4().simple())
    }

    pub fn incident() -> String {
        format!("inc_{}", Uuid::new_v4().simple())
    }

    pub fn pull_request() -> String {
        format!("prr_{}", Uuid::new_v4().simple())
    }
}
