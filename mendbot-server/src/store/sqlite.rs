//! SQLite implementation of [`Store`].
//!
//! # Schema versioning
//!
//! The database has a `schema_version` table tracking the schema version.
//! When the schema changes, increment `CURRENT_SCHEMA_VERSION` and add a
//! migration in `run_migrations()`; migrations run sequentially from the
//! stored version to the target.
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind a
//! `Mutex` and every operation runs on the blocking thread pool via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mendbot_core::Severity;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    Incident, IncidentStatus, OAuthConnection, Provider, PullRequestRecord, RepositoryConnection,
    RunState, Store, StoreError, WebhookStatus, WorkflowRun,
};

const CURRENT_SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. Configured with WAL journaling and a busy timeout so
    /// concurrent handlers degrade to waiting instead of failing.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode returns the resulting mode as a row. In-memory
        // databases report "memory", which is fine for tests.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;
        if !journal_mode.eq_ignore_ascii_case("wal") && !journal_mode.eq_ignore_ascii_case("memory")
        {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!("could not enable WAL mode, got {:?}", journal_mode),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| StoreError::storage("read schema version", e.to_string()))?
            .unwrap_or(0);

        if current > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "check schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    current, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        Self::run_migrations(&conn, current)?;

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("write schema version", e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE oauth_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_user_id TEXT NOT NULL,
                provider_username TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                scopes TEXT NOT NULL,
                expires_at TEXT,
                is_active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, provider)
            );

            CREATE TABLE repository_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                oauth_connection_id TEXT NOT NULL,
                repository_full_name TEXT NOT NULL,
                default_branch TEXT NOT NULL,
                is_enabled INTEGER NOT NULL,
                auto_pr_enabled INTEGER NOT NULL,
                webhook_id TEXT,
                webhook_secret TEXT,
                webhook_url TEXT,
                webhook_events TEXT NOT NULL,
                webhook_status TEXT,
                webhook_last_delivery_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, repository_full_name)
            );
            CREATE INDEX idx_repository_connections_full_name
                ON repository_connections (repository_full_name);

            CREATE TABLE workflow_runs (
                id TEXT PRIMARY KEY,
                repository_connection_id TEXT NOT NULL,
                provider_run_id TEXT NOT NULL,
                run_number INTEGER,
                workflow_name TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                state TEXT NOT NULL,
                conclusion TEXT,
                branch TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                commit_message TEXT,
                author TEXT,
                event TEXT,
                run_url TEXT,
                payload_updated_at TEXT,
                started_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (repository_connection_id, provider_run_id)
            );

            CREATE TABLE incidents (
                incident_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                repository_connection_id TEXT,
                workflow_run_id TEXT,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                failure_type TEXT NOT NULL,
                error_message TEXT NOT NULL,
                root_cause TEXT,
                confidence REAL,
                remediation_attempted_at TEXT,
                remediation_outcome TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_incidents_workflow_run ON incidents (workflow_run_id);

            CREATE TABLE pull_request_records (
                id TEXT PRIMARY KEY,
                incident_id TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                pr_url TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_pull_request_records_incident
                ON pull_request_records (incident_id);

            CREATE TABLE seen_deliveries (
                delivery_id TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("migrate v0 -> v1", e.to_string()))
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::storage(op, "mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::storage(op, e.to_string()))?
    }
}

// --- SQL <-> model helpers ---------------------------------------------------

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn ts_opt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corruption(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

fn events_json(events: &[String]) -> String {
    serde_json::to_string(events).unwrap_or_else(|_| "[]".to_string())
}

fn parse_events(s: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Corruption(format!("bad events list: {}", e)))
}

fn sql(op: &'static str, e: rusqlite::Error) -> StoreError {
    StoreError::storage(op, e.to_string())
}

/// Raw column tuples fetched before enum/timestamp parsing. Keeping the
/// parse step outside the rusqlite row closure lets corruption surface as
/// `StoreError::Corruption` instead of a storage error.
type OAuthRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    bool,
    String,
    String,
);

const OAUTH_COLS: &str = "id, user_id, provider, provider_user_id, provider_username, \
     access_token, refresh_token, scopes, expires_at, is_active, created_at, updated_at";

fn oauth_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OAuthRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn oauth_from_raw(raw: OAuthRow) -> Result<OAuthConnection, StoreError> {
    let provider = Provider::parse(&raw.2)
        .ok_or_else(|| StoreError::Corruption(format!("unknown provider {:?}", raw.2)))?;
    Ok(OAuthConnection {
        id: raw.0,
        user_id: raw.1,
        provider,
        provider_user_id: raw.3,
        provider_username: raw.4,
        access_token: raw.5,
        refresh_token: raw.6,
        scopes: parse_events(&raw.7)?,
        expires_at: parse_ts_opt(raw.8)?,
        is_active: raw.9,
        created_at: parse_ts(&raw.10)?,
        updated_at: parse_ts(&raw.11)?,
    })
}

type RepoConnRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    bool,
    bool,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

const REPO_CONN_COLS: &str = "id, user_id, provider, oauth_connection_id, repository_full_name, \
     default_branch, is_enabled, auto_pr_enabled, webhook_id, webhook_secret, webhook_url, \
     webhook_events, webhook_status, webhook_last_delivery_at, created_at, updated_at";

fn repo_conn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoConnRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
    ))
}

fn repo_conn_from_raw(raw: RepoConnRow) -> Result<RepositoryConnection, StoreError> {
    let provider = Provider::parse(&raw.2)
        .ok_or_else(|| StoreError::Corruption(format!("unknown provider {:?}", raw.2)))?;
    let webhook_status = raw
        .12
        .as_deref()
        .map(|s| {
            WebhookStatus::parse(s)
                .ok_or_else(|| StoreError::Corruption(format!("unknown webhook status {:?}", s)))
        })
        .transpose()?;
    Ok(RepositoryConnection {
        id: raw.0,
        user_id: raw.1,
        provider,
        oauth_connection_id: raw.3,
        repository_full_name: raw.4,
        default_branch: raw.5,
        is_enabled: raw.6,
        auto_pr_enabled: raw.7,
        webhook_id: raw.8,
        webhook_secret: raw.9,
        webhook_url: raw.10,
        webhook_events: parse_events(&raw.11)?,
        webhook_status,
        webhook_last_delivery_at: parse_ts_opt(raw.13)?,
        created_at: parse_ts(&raw.14)?,
        updated_at: parse_ts(&raw.15)?,
    })
}

type RunRow = (
    String,
    String,
    String,
    Option<i64>,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

const RUN_COLS: &str = "id, repository_connection_id, provider_run_id, run_number, workflow_name, \
     workflow_id, state, conclusion, branch, commit_sha, commit_message, author, event, run_url, \
     payload_updated_at, started_at, created_at, updated_at";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
    ))
}

fn run_from_raw(raw: RunRow) -> Result<WorkflowRun, StoreError> {
    let state = RunState::parse(&raw.6)
        .ok_or_else(|| StoreError::Corruption(format!("unknown run state {:?}", raw.6)))?;
    Ok(WorkflowRun {
        id: raw.0,
        repository_connection_id: raw.1,
        provider_run_id: raw.2,
        run_number: raw.3,
        workflow_name: raw.4,
        workflow_id: raw.5,
        state,
        conclusion: raw.7,
        branch: raw.8,
        commit_sha: raw.9,
        commit_message: raw.10,
        author: raw.11,
        event: raw.12,
        run_url: raw.13,
        payload_updated_at: parse_ts_opt(raw.14)?,
        started_at: parse_ts_opt(raw.15)?,
        created_at: parse_ts(&raw.16)?,
        updated_at: parse_ts(&raw.17)?,
    })
}

type IncidentRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
    String,
    String,
);

const INCIDENT_COLS: &str = "incident_id, user_id, repository_connection_id, workflow_run_id, \
     severity, status, source, failure_type, error_message, root_cause, confidence, \
     remediation_attempted_at, remediation_outcome, created_at, updated_at";

fn incident_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn incident_from_raw(raw: IncidentRow) -> Result<Incident, StoreError> {
    let severity = Severity::parse(&raw.4)
        .ok_or_else(|| StoreError::Corruption(format!("unknown severity {:?}", raw.4)))?;
    let status = IncidentStatus::parse(&raw.5)
        .ok_or_else(|| StoreError::Corruption(format!("unknown incident status {:?}", raw.5)))?;
    Ok(Incident {
        incident_id: raw.0,
        user_id: raw.1,
        repository_connection_id: raw.2,
        workflow_run_id: raw.3,
        severity,
        status,
        source: raw.6,
        failure_type: raw.7,
        error_message: raw.8,
        root_cause: raw.9,
        confidence: raw.10,
        remediation_attempted_at: parse_ts_opt(raw.11)?,
        remediation_outcome: raw.12,
        created_at: parse_ts(&raw.13)?,
        updated_at: parse_ts(&raw.14)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_oauth_connection(
        &self,
        conn: OAuthConnection,
    ) -> Result<OAuthConnection, StoreError> {
        self.with_conn("upsert_oauth_connection", move |db| {
            let existing: Option<(String, String)> = db
                .query_row(
                    "SELECT id, created_at FROM oauth_connections \
                     WHERE user_id = ?1 AND provider = ?2",
                    params![conn.user_id, conn.provider.as_str()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(|e| sql("upsert_oauth_connection", e))?;

            let stored = match existing {
                Some((id, created_at)) => {
                    db.execute(
                        "UPDATE oauth_connections SET provider_user_id = ?1, \
                         provider_username = ?2, access_token = ?3, refresh_token = ?4, \
                         scopes = ?5, expires_at = ?6, is_active = 1, updated_at = ?7 \
                         WHERE id = ?8",
                        params![
                            conn.provider_user_id,
                            conn.provider_username,
                            conn.access_token,
                            conn.refresh_token,
                            events_json(&conn.scopes),
                            ts_opt(&conn.expires_at),
                            ts(&conn.updated_at),
                            id,
                        ],
                    )
                    .map_err(|e| sql("upsert_oauth_connection", e))?;
                    OAuthConnection {
                        id,
                        is_active: true,
                        created_at: parse_ts(&created_at)?,
                        ..conn
                    }
                }
                None => {
                    db.execute(
                        "INSERT INTO oauth_connections (id, user_id, provider, provider_user_id, \
                         provider_username, access_token, refresh_token, scopes, expires_at, \
                         is_active, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            conn.id,
                            conn.user_id,
                            conn.provider.as_str(),
                            conn.provider_user_id,
                            conn.provider_username,
                            conn.access_token,
                            conn.refresh_token,
                            events_json(&conn.scopes),
                            ts_opt(&conn.expires_at),
                            conn.is_active,
                            ts(&conn.created_at),
                            ts(&conn.updated_at),
                        ],
                    )
                    .map_err(|e| sql("upsert_oauth_connection", e))?;
                    conn
                }
            };
            Ok(stored)
        })
        .await
    }

    async fn get_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<OAuthConnection>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn("get_oauth_connection", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM oauth_connections \
                         WHERE user_id = ?1 AND provider = ?2 AND is_active = 1",
                        OAUTH_COLS
                    ),
                    params![user_id, provider.as_str()],
                    oauth_from_row,
                )
                .optional()
                .map_err(|e| sql("get_oauth_connection", e))?;
            raw.map(oauth_from_raw).transpose()
        })
        .await
    }

    async fn deactivate_oauth_connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        let now = ts(&Utc::now());
        self.with_conn("deactivate_oauth_connection", move |db| {
            let changed = db
                .execute(
                    "UPDATE oauth_connections SET is_active = 0, updated_at = ?1 \
                     WHERE user_id = ?2 AND provider = ?3 AND is_active = 1",
                    params![now, user_id, provider.as_str()],
                )
                .map_err(|e| sql("deactivate_oauth_connection", e))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_repository_connection(
        &self,
        conn: RepositoryConnection,
    ) -> Result<(), StoreError> {
        self.with_conn("insert_repository_connection", move |db| {
            db.execute(
                "INSERT INTO repository_connections (id, user_id, provider, oauth_connection_id, \
                 repository_full_name, default_branch, is_enabled, auto_pr_enabled, webhook_id, \
                 webhook_secret, webhook_url, webhook_events, webhook_status, \
                 webhook_last_delivery_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    conn.id,
                    conn.user_id,
                    conn.provider.as_str(),
                    conn.oauth_connection_id,
                    conn.repository_full_name,
                    conn.default_branch,
                    conn.is_enabled,
                    conn.auto_pr_enabled,
                    conn.webhook_id,
                    conn.webhook_secret,
                    conn.webhook_url,
                    events_json(&conn.webhook_events),
                    conn.webhook_status.map(|s| s.as_str()),
                    ts_opt(&conn.webhook_last_delivery_at),
                    ts(&conn.created_at),
                    ts(&conn.updated_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists
                } else {
                    sql("insert_repository_connection", e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn get_repository_connection(
        &self,
        id: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError> {
        let id = id.to_string();
        self.with_conn("get_repository_connection", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM repository_connections WHERE id = ?1",
                        REPO_CONN_COLS
                    ),
                    params![id],
                    repo_conn_from_row,
                )
                .optional()
                .map_err(|e| sql("get_repository_connection", e))?;
            raw.map(repo_conn_from_raw).transpose()
        })
        .await
    }

    async fn get_repository_connection_by_name(
        &self,
        user_id: &str,
        full_name: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError> {
        let user_id = user_id.to_string();
        let full_name = full_name.to_string();
        self.with_conn("get_repository_connection_by_name", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM repository_connections \
                         WHERE user_id = ?1 AND repository_full_name = ?2",
                        REPO_CONN_COLS
                    ),
                    params![user_id, full_name],
                    repo_conn_from_row,
                )
                .optional()
                .map_err(|e| sql("get_repository_connection_by_name", e))?;
            raw.map(repo_conn_from_raw).transpose()
        })
        .await
    }

    async fn find_connection_for_repository(
        &self,
        provider: Provider,
        full_name: &str,
    ) -> Result<Option<RepositoryConnection>, StoreError> {
        let full_name = full_name.to_string();
        self.with_conn("find_connection_for_repository", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM repository_connections \
                         WHERE repository_full_name = ?1 AND provider = ?2",
                        REPO_CONN_COLS
                    ),
                    params![full_name, provider.as_str()],
                    repo_conn_from_row,
                )
                .optional()
                .map_err(|e| sql("find_connection_for_repository", e))?;
            raw.map(repo_conn_from_raw).transpose()
        })
        .await
    }

    async fn list_repository_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<RepositoryConnection>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn("list_repository_connections", move |db| {
            let mut stmt = db
                .prepare(&format!(
                    "SELECT {} FROM repository_connections \
                     WHERE user_id = ?1 ORDER BY created_at",
                    REPO_CONN_COLS
                ))
                .map_err(|e| sql("list_repository_connections", e))?;
            let rows = stmt
                .query_map(params![user_id], repo_conn_from_row)
                .map_err(|e| sql("list_repository_connections", e))?;

            let mut out = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| sql("list_repository_connections", e))?;
                out.push(repo_conn_from_raw(raw)?);
            }
            Ok(out)
        })
        .await
    }

    async fn update_webhook_provisioned(
        &self,
        id: &str,
        webhook_id: &str,
        secret_ciphertext: &str,
        url: &str,
        events: &[String],
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let webhook_id = webhook_id.to_string();
        let secret = secret_ciphertext.to_string();
        let url = url.to_string();
        let events = events_json(events);
        let now = ts(&Utc::now());
        self.with_conn("update_webhook_provisioned", move |db| {
            db.execute(
                "UPDATE repository_connections SET webhook_id = ?1, webhook_secret = ?2, \
                 webhook_url = ?3, webhook_events = ?4, webhook_status = 'active', \
                 updated_at = ?5 WHERE id = ?6",
                params![webhook_id, secret, url, events, now, id],
            )
            .map_err(|e| sql("update_webhook_provisioned", e))?;
            Ok(())
        })
        .await
    }

    async fn mark_webhook_failed(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let now = ts(&Utc::now());
        self.with_conn("mark_webhook_failed", move |db| {
            db.execute(
                "UPDATE repository_connections SET webhook_id = NULL, webhook_secret = NULL, \
                 webhook_url = NULL, webhook_status = 'failed', updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(|e| sql("mark_webhook_failed", e))?;
            Ok(())
        })
        .await
    }

    async fn clear_webhook(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let now = ts(&Utc::now());
        self.with_conn("clear_webhook", move |db| {
            db.execute(
                "UPDATE repository_connections SET webhook_id = NULL, webhook_secret = NULL, \
                 webhook_url = NULL, webhook_events = '[]', webhook_status = 'inactive', \
                 updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(|e| sql("clear_webhook", e))?;
            Ok(())
        })
        .await
    }

    async fn update_connection_settings(
        &self,
        id: &str,
        auto_pr_enabled: Option<bool>,
        is_enabled: Option<bool>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let now = ts(&Utc::now());
        self.with_conn("update_connection_settings", move |db| {
            if let Some(auto_pr) = auto_pr_enabled {
                db.execute(
                    "UPDATE repository_connections SET auto_pr_enabled = ?1, updated_at = ?2 \
                     WHERE id = ?3",
                    params![auto_pr, now, id],
                )
                .map_err(|e| sql("update_connection_settings", e))?;
            }
            if let Some(enabled) = is_enabled {
                db.execute(
                    "UPDATE repository_connections SET is_enabled = ?1, updated_at = ?2 \
                     WHERE id = ?3",
                    params![enabled, now, id],
                )
                .map_err(|e| sql("update_connection_settings", e))?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_repository_connection(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn("delete_repository_connection", move |db| {
            let changed = db
                .execute(
                    "DELETE FROM repository_connections WHERE id = ?1",
                    params![id],
                )
                .map_err(|e| sql("delete_repository_connection", e))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn touch_webhook_delivery(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let at = ts(&at);
        self.with_conn("touch_webhook_delivery", move |db| {
            db.execute(
                "UPDATE repository_connections SET webhook_last_delivery_at = ?1 WHERE id = ?2",
                params![at, id],
            )
            .map_err(|e| sql("touch_webhook_delivery", e))?;
            Ok(())
        })
        .await
    }

    async fn upsert_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        self.with_conn("upsert_workflow_run", move |db| {
            let existing = db
                .query_row(
                    &format!(
                        "SELECT {} FROM workflow_runs \
                         WHERE repository_connection_id = ?1 AND provider_run_id = ?2",
                        RUN_COLS
                    ),
                    params![run.repository_connection_id, run.provider_run_id],
                    run_from_row,
                )
                .optional()
                .map_err(|e| sql("upsert_workflow_run", e))?
                .map(run_from_raw)
                .transpose()?;

            match existing {
                None => {
                    db.execute(
                        "INSERT INTO workflow_runs (id, repository_connection_id, \
                         provider_run_id, run_number, workflow_name, workflow_id, state, \
                         conclusion, branch, commit_sha, commit_message, author, event, run_url, \
                         payload_updated_at, started_at, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                                 ?15, ?16, ?17, ?18)",
                        params![
                            run.id,
                            run.repository_connection_id,
                            run.provider_run_id,
                            run.run_number,
                            run.workflow_name,
                            run.workflow_id,
                            run.state.as_str(),
                            run.conclusion,
                            run.branch,
                            run.commit_sha,
                            run.commit_message,
                            run.author,
                            run.event,
                            run.run_url,
                            ts_opt(&run.payload_updated_at),
                            ts_opt(&run.started_at),
                            ts(&run.created_at),
                            ts(&run.updated_at),
                        ],
                    )
                    .map_err(|e| sql("upsert_workflow_run", e))?;
                    Ok(run)
                }
                Some(existing) => {
                    let newer = match (run.payload_updated_at, existing.payload_updated_at) {
                        (Some(new), Some(old)) => new >= old,
                        (Some(_), None) => true,
                        (None, Some(_)) => false,
                        (None, None) => true,
                    };
                    if !newer {
                        return Ok(existing);
                    }

                    db.execute(
                        "UPDATE workflow_runs SET state = ?1, conclusion = ?2, branch = ?3, \
                         commit_sha = ?4, commit_message = ?5, author = ?6, event = ?7, \
                         run_url = ?8, payload_updated_at = ?9, started_at = ?10, \
                         updated_at = ?11 WHERE id = ?12",
                        params![
                            run.state.as_str(),
                            run.conclusion,
                            run.branch,
                            run.commit_sha,
                            run.commit_message,
                            run.author,
                            run.event,
                            run.run_url,
                            ts_opt(&run.payload_updated_at),
                            ts_opt(&run.started_at),
                            ts(&run.updated_at),
                            existing.id,
                        ],
                    )
                    .map_err(|e| sql("upsert_workflow_run", e))?;

                    Ok(WorkflowRun {
                        id: existing.id,
                        created_at: existing.created_at,
                        ..run
                    })
                }
            }
        })
        .await
    }

    async fn get_workflow_run(
        &self,
        repository_connection_id: &str,
        provider_run_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let repo_conn_id = repository_connection_id.to_string();
        let run_id = provider_run_id.to_string();
        self.with_conn("get_workflow_run", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM workflow_runs \
                         WHERE repository_connection_id = ?1 AND provider_run_id = ?2",
                        RUN_COLS
                    ),
                    params![repo_conn_id, run_id],
                    run_from_row,
                )
                .optional()
                .map_err(|e| sql("get_workflow_run", e))?;
            raw.map(run_from_raw).transpose()
        })
        .await
    }

    async fn get_workflow_run_by_id(&self, id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let id = id.to_string();
        self.with_conn("get_workflow_run_by_id", move |db| {
            let raw = db
                .query_row(
                    &format!("SELECT {} FROM workflow_runs WHERE id = ?1", RUN_COLS),
                    params![id],
                    run_from_row,
                )
                .optional()
                .map_err(|e| sql("get_workflow_run_by_id", e))?;
            raw.map(run_from_raw).transpose()
        })
        .await
    }

    async fn insert_incident(&self, incident: Incident) -> Result<(), StoreError> {
        self.with_conn("insert_incident", move |db| {
            db.execute(
                "INSERT INTO incidents (incident_id, user_id, repository_connection_id, \
                 workflow_run_id, severity, status, source, failure_type, error_message, \
                 root_cause, confidence, remediation_attempted_at, remediation_outcome, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    incident.incident_id,
                    incident.user_id,
                    incident.repository_connection_id,
                    incident.workflow_run_id,
                    incident.severity.as_str(),
                    incident.status.as_str(),
                    incident.source,
                    incident.failure_type,
                    incident.error_message,
                    incident.root_cause,
                    incident.confidence,
                    ts_opt(&incident.remediation_attempted_at),
                    incident.remediation_outcome,
                    ts(&incident.created_at),
                    ts(&incident.updated_at),
                ],
            )
            .map_err(|e| sql("insert_incident", e))?;
            Ok(())
        })
        .await
    }

    async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, StoreError> {
        let incident_id = incident_id.to_string();
        self.with_conn("get_incident", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM incidents WHERE incident_id = ?1",
                        INCIDENT_COLS
                    ),
                    params![incident_id],
                    incident_from_row,
                )
                .optional()
                .map_err(|e| sql("get_incident", e))?;
            raw.map(incident_from_raw).transpose()
        })
        .await
    }

    async fn find_incident_for_run(
        &self,
        workflow_run_id: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let run_id = workflow_run_id.to_string();
        self.with_conn("find_incident_for_run", move |db| {
            let raw = db
                .query_row(
                    &format!(
                        "SELECT {} FROM incidents WHERE workflow_run_id = ?1 \
                         ORDER BY created_at DESC LIMIT 1",
                        INCIDENT_COLS
                    ),
                    params![run_id],
                    incident_from_row,
                )
                .optional()
                .map_err(|e| sql("find_incident_for_run", e))?;
            raw.map(incident_from_raw).transpose()
        })
        .await
    }

    async fn set_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<(), StoreError> {
        let incident_id = incident_id.to_string();
        let now = ts(&Utc::now());
        self.with_conn("set_incident_status", move |db| {
            db.execute(
                "UPDATE incidents SET status = ?1, updated_at = ?2 WHERE incident_id = ?3",
                params![status.as_str(), now, incident_id],
            )
            .map_err(|e| sql("set_incident_status", e))?;
            Ok(())
        })
        .await
    }

    async fn record_remediation_outcome(
        &self,
        incident_id: &str,
        outcome: &str,
        root_cause: Option<&str>,
    ) -> Result<(), StoreError> {
        let incident_id = incident_id.to_string();
        let outcome = outcome.to_string();
        let root_cause = root_cause.map(|s| s.to_string());
        let now = ts(&Utc::now());
        self.with_conn("record_remediation_outcome", move |db| {
            db.execute(
                "UPDATE incidents SET remediation_outcome = ?1, \
                 root_cause = COALESCE(?2, root_cause), updated_at = ?3 WHERE incident_id = ?4",
                params![outcome, root_cause, now, incident_id],
            )
            .map_err(|e| sql("record_remediation_outcome", e))?;
            Ok(())
        })
        .await
    }

    async fn try_claim_remediation(
        &self,
        incident_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let incident_id = incident_id.to_string();
        let at = ts(&at);
        self.with_conn("try_claim_remediation", move |db| {
            // Conditional update plus changes() gives an atomic
            // first-write-wins claim; duplicate deliveries observe 0
            // changed rows and exit.
            let changed = db
                .execute(
                    "UPDATE incidents SET remediation_attempted_at = ?1, updated_at = ?1 \
                     WHERE incident_id = ?2 AND remediation_attempted_at IS NULL",
                    params![at, incident_id],
                )
                .map_err(|e| sql("try_claim_remediation", e))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_pull_request_record(
        &self,
        record: PullRequestRecord,
    ) -> Result<(), StoreError> {
        self.with_conn("insert_pull_request_record", move |db| {
            db.execute(
                "INSERT INTO pull_request_records (id, incident_id, pr_number, pr_url, \
                 branch_name, state, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.incident_id,
                    record.pr_number,
                    record.pr_url,
                    record.branch_name,
                    record.state,
                    ts(&record.created_at),
                ],
            )
            .map_err(|e| sql("insert_pull_request_record", e))?;
            Ok(())
        })
        .await
    }

    async fn get_pull_request_for_incident(
        &self,
        incident_id: &str,
    ) -> Result<Option<PullRequestRecord>, StoreError> {
        let incident_id = incident_id.to_string();
        self.with_conn("get_pull_request_for_incident", move |db| {
            let rec = db
                .query_row(
                    "SELECT id, incident_id, pr_number, pr_url, branch_name, state, created_at \
                     FROM pull_request_records WHERE incident_id = ?1 \
                     ORDER BY created_at DESC LIMIT 1",
                    params![incident_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| sql("get_pull_request_for_incident", e))?;

            rec.map(|raw| {
                Ok(PullRequestRecord {
                    id: raw.0,
                    incident_id: raw.1,
                    pr_number: raw.2,
                    pr_url: raw.3,
                    branch_name: raw.4,
                    state: raw.5,
                    created_at: parse_ts(&raw.6)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn claim_delivery(
        &self,
        delivery_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let delivery_id = delivery_id.to_string();
        let at = ts(&at);
        self.with_conn("claim_delivery", move |db| {
            // INSERT OR IGNORE avoids the read-then-insert race: the
            // losing writer's insert is silently ignored and detected via
            // changes() == 0.
            db.execute(
                "INSERT OR IGNORE INTO seen_deliveries (delivery_id, recorded_at) \
                 VALUES (?1, ?2)",
                params![delivery_id, at],
            )
            .map_err(|e| sql("claim_delivery", e))?;
            Ok(db.changes() > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ids;

    fn sample_repo_conn(user: &str, name: &str) -> RepositoryConnection {
        let now = Utc::now();
        RepositoryConnection {
            id: ids::repository_connection(),
            user_id: user.to_string(),
            provider: Provider::Github,
            oauth_connection_id: "oac_test".to_string(),
            repository_full_name: name.to_string(),
            default_branch: "main".to_string(),
            is_enabled: true,
            auto_pr_enabled: true,
            webhook_id: None,
            webhook_secret: None,
            webhook_url: None,
            webhook_events: vec![],
            webhook_status: None,
            webhook_last_delivery_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_run(repo_conn_id: &str, provider_run_id: &str, state: RunState) -> WorkflowRun {
        let now = Utc::now();
        WorkflowRun {
            id: ids::workflow_run(),
            repository_connection_id: repo_conn_id.to_string(),
            provider_run_id: provider_run_id.to_string(),
            run_number: Some(7),
            workflow_name: "CI".to_string(),
            workflow_id: "101".to_string(),
            state,
            conclusion: None,
            branch: "main".to_string(),
            commit_sha: "abc123".to_string(),
            commit_message: None,
            author: None,
            event: Some("push".to_string()),
            run_url: None,
            payload_updated_at: Some(now),
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_incident(run_id: &str) -> Incident {
        let now = Utc::now();
        Incident {
            incident_id: ids::incident(),
            user_id: "u1".to_string(),
            repository_connection_id: None,
            workflow_run_id: Some(run_id.to_string()),
            severity: Severity::High,
            status: IncidentStatus::Open,
            source: "webhook".to_string(),
            failure_type: "workflow_failure".to_string(),
            error_message: "CI failed".to_string(),
            root_cause: None,
            confidence: None,
            remediation_attempted_at: None,
            remediation_outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn repository_connection_unique_per_user_and_name() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_repository_connection(sample_repo_conn("u1", "acme/web"))
            .await
            .unwrap();
        let err = store
            .insert_repository_connection(sample_repo_conn("u1", "acme/web"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));

        // A different user may connect the same repository.
        store
            .insert_repository_connection(sample_repo_conn("u2", "acme/web"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn workflow_run_upsert_is_idempotent_and_latest_wins() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = sample_repo_conn("u1", "acme/web");
        store.insert_repository_connection(conn.clone()).await.unwrap();

        let t0 = Utc::now();
        let mut queued = sample_run(&conn.id, "42", RunState::Queued);
        queued.payload_updated_at = Some(t0);
        let stored = store.upsert_workflow_run(queued).await.unwrap();

        let mut failed = sample_run(&conn.id, "42", RunState::Failed);
        failed.conclusion = Some("failure".to_string());
        failed.payload_updated_at = Some(t0 + chrono::Duration::seconds(60));
        let after_failure = store.upsert_workflow_run(failed.clone()).await.unwrap();
        assert_eq!(after_failure.id, stored.id);
        assert_eq!(after_failure.state, RunState::Failed);

        // An out-of-order stale delivery must not regress the state.
        let mut stale = sample_run(&conn.id, "42", RunState::Running);
        stale.payload_updated_at = Some(t0 + chrono::Duration::seconds(30));
        let after_stale = store.upsert_workflow_run(stale).await.unwrap();
        assert_eq!(after_stale.state, RunState::Failed);

        // Replaying the same terminal delivery keeps a single row.
        store.upsert_workflow_run(failed).await.unwrap();
        let fetched = store.get_workflow_run(&conn.id, "42").await.unwrap().unwrap();
        assert_eq!(fetched.id, stored.id);
        assert_eq!(fetched.state, RunState::Failed);
    }

    #[tokio::test]
    async fn remediation_claim_is_first_write_wins() {
        let store = SqliteStore::in_memory().unwrap();
        let incident = sample_incident("wfr_1");
        store.insert_incident(incident.clone()).await.unwrap();

        let now = Utc::now();
        assert!(store
            .try_claim_remediation(&incident.incident_id, now)
            .await
            .unwrap());
        assert!(!store
            .try_claim_remediation(&incident.incident_id, now)
            .await
            .unwrap());

        let stored = store
            .get_incident(&incident.incident_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.remediation_attempted_at.is_some());
    }

    #[tokio::test]
    async fn delivery_claim_rejects_duplicates() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        assert!(store.claim_delivery("delivery-1", now).await.unwrap());
        assert!(!store.claim_delivery("delivery-1", now).await.unwrap());
        assert!(store.claim_delivery("delivery-2", now).await.unwrap());
    }

    #[tokio::test]
    async fn clear_webhook_nulls_fields_and_sets_inactive() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = sample_repo_conn("u1", "acme/web");
        store.insert_repository_connection(conn.clone()).await.unwrap();

        store
            .update_webhook_provisioned(
                &conn.id,
                "9001",
                "v1.deadbeef.AAAA",
                "https://mendbot.test/api/v2/webhooks/github",
                &["workflow_run".to_string()],
            )
            .await
            .unwrap();
        let active = store.get_repository_connection(&conn.id).await.unwrap().unwrap();
        assert_eq!(active.webhook_status, Some(WebhookStatus::Active));
        assert!(active.webhook_id.is_some() && active.webhook_secret.is_some());

        store.clear_webhook(&conn.id).await.unwrap();
        let cleared = store.get_repository_connection(&conn.id).await.unwrap().unwrap();
        assert_eq!(cleared.webhook_status, Some(WebhookStatus::Inactive));
        assert!(cleared.webhook_id.is_none());
        assert!(cleared.webhook_secret.is_none());
        assert!(cleared.webhook_url.is_none());
    }

    #[tokio::test]
    async fn oauth_upsert_keeps_one_connection_per_user_and_provider() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let base = OAuthConnection {
            id: ids::oauth_connection(),
            user_id: "u1".to_string(),
            provider: Provider::Github,
            provider_user_id: "1000".to_string(),
            provider_username: "octocat".to_string(),
            access_token: "v1.k.ct-one".to_string(),
            refresh_token: None,
            scopes: vec!["repo".to_string()],
            expires_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let first = store.upsert_oauth_connection(base.clone()).await.unwrap();
        let second = store
            .upsert_oauth_connection(OAuthConnection {
                id: ids::oauth_connection(),
                access_token: "v1.k.ct-two".to_string(),
                ..base.clone()
            })
            .await
            .unwrap();

        // Second upsert reuses the original row.
        assert_eq!(first.id, second.id);
        let fetched = store
            .get_oauth_connection("u1", Provider::Github)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.access_token, "v1.k.ct-two");

        assert!(store
            .deactivate_oauth_connection("u1", Provider::Github)
            .await
            .unwrap());
        assert!(store
            .get_oauth_connection("u1", Provider::Github)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mendbot-state.db");

        {
            let store = SqliteStore::new(&path).unwrap();
            store
                .insert_repository_connection(sample_repo_conn("u1", "acme/web"))
                .await
                .unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        let listed = store.list_repository_connections("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].repository_full_name, "acme/web");
    }
}
