//! Remediation orchestrator: drives log fetch, error extraction, patch
//! synthesis, and branch/commit/PR creation for a single incident.
//!
//! The whole attempt runs under a wall-clock deadline. Every stop
//! condition is a typed outcome recorded on the incident; partial
//! success during PR construction is allowed (files that fail to write
//! are omitted and noted), but a pull request with no real change is
//! never opened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use mendbot_core::{parse_log, ErrorBlock, ErrorType, LineChange, Severity};

use crate::error::{ProviderError, RemediationFailure};
use crate::github::{FileContent, FileWrite, GitHubClient, NewPullRequest};
use crate::llm::{ModelError, SolutionModel, SolutionRequest};
use crate::oauth::OAuthCoordinator;
use crate::store::{
    ids, Incident, IncidentStatus, Provider, PullRequestRecord, RepositoryConnection, Store,
    WorkflowRun,
};
use crate::webhooks::split_full_name;

/// Subject line limit for generated commits.
const COMMIT_SUBJECT_MAX: usize = 72;

#[derive(Debug, Clone)]
pub struct Budgets {
    pub max_files_per_pr: usize,
    pub max_errors_per_file: usize,
    pub log_context_max_chars: usize,
    pub deadline: Duration,
}

#[derive(Debug)]
struct Failure {
    kind: RemediationFailure,
    detail: String,
}

impl Failure {
    fn new(kind: RemediationFailure, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// A validated, applied fix waiting to be committed.
#[derive(Debug)]
struct PreparedFix {
    path: String,
    new_content: String,
    original_sha: String,
    summary: String,
    rationale: Option<String>,
    /// Dominant error class of the blocks that drove this fix; shows up
    /// in the commit subject.
    error_type: ErrorType,
    /// The line substitutions that were actually applied (first-wins per
    /// line, ascending). Empty for a full-file replacement.
    applied: Vec<LineChange>,
}

/// Why a candidate file produced no fix. Token-budget breaches are kept
/// distinct so the incident can end up `failed_budget` rather than
/// `failed_no_signal`.
#[derive(Debug)]
enum SkipReason {
    TokenBudget,
    Unusable(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TokenBudget => f.write_str("model hit the token budget"),
            SkipReason::Unusable(msg) => f.write_str(msg),
        }
    }
}

pub struct RemediationOrchestrator {
    store: Arc<dyn Store>,
    github: Arc<GitHubClient>,
    model: Arc<dyn SolutionModel>,
    oauth: Arc<OAuthCoordinator>,
    budgets: Budgets,
}

impl RemediationOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        github: Arc<GitHubClient>,
        model: Arc<dyn SolutionModel>,
        oauth: Arc<OAuthCoordinator>,
        budgets: Budgets,
    ) -> Self {
        Self {
            store,
            github,
            model,
            oauth,
            budgets,
        }
    }

    /// Run the full pipeline for one incident and record the outcome.
    /// Never panics or propagates; this is the top of a spawned task.
    pub async fn remediate(&self, incident_id: &str) {
        info!("Starting remediation for incident {}", incident_id);

        let outcome = tokio::time::timeout(self.budgets.deadline, self.run(incident_id)).await;
        match outcome {
            Err(_) => {
                self.record_failure(
                    incident_id,
                    Failure::new(
                        RemediationFailure::Timeout,
                        format!("deadline of {:?} exceeded", self.budgets.deadline),
                    ),
                )
                .await;
            }
            Ok(Err(failure)) => self.record_failure(incident_id, failure).await,
            Ok(Ok(record)) => {
                info!(
                    "Opened pull request #{} for incident {} ({})",
                    record.pr_number, incident_id, record.pr_url
                );
            }
        }
    }

    async fn record_failure(&self, incident_id: &str, failure: Failure) {
        warn!(
            "Remediation for incident {} stopped: {} ({})",
            incident_id, failure.kind, failure.detail
        );
        if let Err(e) = self
            .store
            .record_remediation_outcome(incident_id, failure.kind.as_str(), Some(&failure.detail))
            .await
        {
            error!(
                "Could not record remediation outcome for {}: {}",
                incident_id, e
            );
        }
    }

    async fn run(&self, incident_id: &str) -> Result<PullRequestRecord, Failure> {
        let (incident, connection, run) = self.load_context(incident_id).await?;
        let (owner, repo) = split_full_name(&connection.repository_full_name)
            .map_err(|e| Failure::new(RemediationFailure::Other, e.to_string()))?;

        // 1. Credentials.
        let token = self
            .oauth
            .access_token(&incident.user_id, connection.provider)
            .await
            .map_err(|e| Failure::new(RemediationFailure::NoCredentials, e.to_string()))?;

        if connection.provider != Provider::Github {
            return Err(Failure::new(
                RemediationFailure::Provider,
                "automated fixes are only supported for the github provider",
            ));
        }

        let provider_run_id: u64 = run.provider_run_id.parse().map_err(|_| {
            Failure::new(
                RemediationFailure::Other,
                format!("non-numeric provider run id {:?}", run.provider_run_id),
            )
        })?;

        // 2. Logs.
        let log_bytes = self
            .github
            .download_run_logs(&token, owner, repo, provider_run_id)
            .await
            .map_err(|e| Failure::new(RemediationFailure::NoLogs, e.to_string()))?;
        let log_text = String::from_utf8_lossy(&log_bytes);

        // 3. Structured errors.
        let blocks = parse_log(&log_text);
        if blocks.is_empty() {
            return Err(Failure::new(
                RemediationFailure::NoSignal,
                "no error records extracted from run logs",
            ));
        }
        info!(
            "Incident {}: extracted {} error blocks from {} bytes of logs",
            incident_id,
            blocks.len(),
            log_bytes.len()
        );

        // 4. Candidate files.
        let candidates = select_candidates(
            &blocks,
            self.budgets.max_files_per_pr,
            self.budgets.max_errors_per_file,
        );
        if candidates.is_empty() {
            return Err(Failure::new(
                RemediationFailure::NoSignal,
                "no extracted error names a source file",
            ));
        }

        // 5. Fetch + synthesize + apply, per file.
        let mut fixes: Vec<PreparedFix> = Vec::new();
        let mut skipped: Vec<(String, String)> = Vec::new();
        let mut provider_errors = 0usize;
        let mut budget_breaches = 0usize;

        for (path, file_blocks) in &candidates {
            let fetched = self
                .fetch_file(&token, owner, repo, path, &run.branch, &connection.default_branch)
                .await;
            let file = match fetched {
                Ok(file) => file,
                Err(ProviderError::Unauthorized) => {
                    return Err(Failure::new(
                        RemediationFailure::NoCredentials,
                        "provider rejected the stored token",
                    ));
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path, e);
                    provider_errors += 1;
                    skipped.push((path.clone(), e.to_string()));
                    continue;
                }
            };

            let request = SolutionRequest {
                repository: connection.repository_full_name.clone(),
                workflow: run.workflow_name.clone(),
                branch: run.branch.clone(),
                file_path: path.clone(),
                file_content: file.content.clone(),
                error_blocks: file_blocks
                    .iter()
                    .map(|b| truncate_block(b, self.budgets.log_context_max_chars))
                    .collect(),
            };

            match prepare_fix(self.model.as_ref(), &request, &file).await {
                Ok(fix) => fixes.push(fix),
                Err(reason) => {
                    if matches!(reason, SkipReason::TokenBudget) {
                        budget_breaches += 1;
                    }
                    info!("No usable fix for {}: {}", path, reason);
                    skipped.push((path.clone(), reason.to_string()));
                }
            }
        }

        if fixes.is_empty() {
            if provider_errors == candidates.len() {
                return Err(Failure::new(
                    RemediationFailure::Provider,
                    "every candidate file fetch failed",
                ));
            }
            if budget_breaches > 0 {
                return Err(Failure::new(
                    RemediationFailure::Budget,
                    "model token budget exhausted before a usable fix was produced",
                ));
            }
            return Err(Failure::new(
                RemediationFailure::NoSignal,
                "model produced no valid change for any candidate file",
            ));
        }

        // 6. Branch from the failing branch's head (default branch as
        // fallback when the failing branch is already gone).
        let (base_branch, base_sha) = self
            .resolve_base(&token, owner, repo, &run.branch, &connection.default_branch)
            .await?;

        let branch_name = format!("remediation/{}", incident.incident_id);
        match self
            .github
            .create_branch(&token, owner, repo, &base_sha, &branch_name)
            .await
        {
            Ok(()) => {}
            Err(ProviderError::Conflict(detail)) => {
                return Err(Failure::new(RemediationFailure::Conflict, detail));
            }
            Err(e) => return Err(Failure::new(RemediationFailure::Provider, e.to_string())),
        }

        // 7. Commits. A stale blob sha fails fast on concurrent
        // modification; that file is dropped and the rest proceed.
        let mut written: Vec<&PreparedFix> = Vec::new();
        let mut conflicts = 0usize;
        for fix in &fixes {
            let message = commit_message(fix);
            let result = self
                .github
                .create_or_update_file(
                    &token,
                    owner,
                    repo,
                    &fix.path,
                    FileWrite {
                        content: &fix.new_content,
                        sha: Some(&fix.original_sha),
                        branch: &branch_name,
                        message: &message,
                    },
                )
                .await;
            match result {
                Ok(_) => written.push(fix),
                Err(ProviderError::Conflict(detail)) => {
                    warn!("Concurrent modification of {}: {}", fix.path, detail);
                    conflicts += 1;
                    skipped.push((fix.path.clone(), "file changed underneath us".to_string()));
                }
                Err(e) => {
                    warn!("Could not write {}: {}", fix.path, e);
                    skipped.push((fix.path.clone(), e.to_string()));
                }
            }
        }

        if written.is_empty() {
            let kind = if conflicts > 0 {
                RemediationFailure::Conflict
            } else {
                RemediationFailure::Provider
            };
            return Err(Failure::new(kind, "no file could be written to the fix branch"));
        }

        // 8. Pull request.
        let title = format!(
            "Fix: {} failure in {}",
            run.workflow_name, connection.repository_full_name
        );
        let body = build_pr_body(&incident, &run, &written, &skipped);
        let pr = self
            .github
            .create_pull_request(
                &token,
                owner,
                repo,
                NewPullRequest {
                    head: &branch_name,
                    base: &base_branch,
                    title: &title,
                    body: &body,
                    draft: false,
                },
            )
            .await
            .map_err(|e| Failure::new(RemediationFailure::Provider, e.to_string()))?;

        // 9. Record the outcome.
        let record = PullRequestRecord {
            id: ids::pull_request(),
            incident_id: incident.incident_id.clone(),
            pr_number: pr.number as i64,
            pr_url: pr.html_url.clone(),
            branch_name: branch_name.clone(),
            state: pr.state.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert_pull_request_record(record.clone())
            .await
            .map_err(|e| Failure::new(RemediationFailure::Other, e.to_string()))?;

        let root_cause = written.iter().find_map(|f| f.rationale.clone());
        if let Err(e) = self
            .store
            .record_remediation_outcome(
                &incident.incident_id,
                "pr_created",
                root_cause.as_deref(),
            )
            .await
        {
            error!("Could not record outcome for {}: {}", incident.incident_id, e);
        }
        if let Err(e) = self
            .store
            .set_incident_status(&incident.incident_id, IncidentStatus::Investigating)
            .await
        {
            error!("Could not transition incident {}: {}", incident.incident_id, e);
        }

        Ok(record)
    }

    async fn load_context(
        &self,
        incident_id: &str,
    ) -> Result<(Incident, RepositoryConnection, WorkflowRun), Failure> {
        let incident = self
            .store
            .get_incident(incident_id)
            .await
            .map_err(|e| Failure::new(RemediationFailure::Other, e.to_string()))?
            .ok_or_else(|| {
                Failure::new(RemediationFailure::Other, "incident no longer exists")
            })?;

        let connection_id = incident.repository_connection_id.clone().ok_or_else(|| {
            Failure::new(RemediationFailure::Other, "incident has no repository connection")
        })?;
        let connection = self
            .store
            .get_repository_connection(&connection_id)
            .await
            .map_err(|e| Failure::new(RemediationFailure::Other, e.to_string()))?
            .ok_or_else(|| {
                Failure::new(
                    RemediationFailure::Other,
                    "repository connection was removed",
                )
            })?;

        let run_id = incident.workflow_run_id.clone().ok_or_else(|| {
            Failure::new(RemediationFailure::Other, "incident has no workflow run")
        })?;
        let run = self
            .store
            .get_workflow_run_by_id(&run_id)
            .await
            .map_err(|e| Failure::new(RemediationFailure::Other, e.to_string()))?
            .ok_or_else(|| Failure::new(RemediationFailure::Other, "workflow run was removed"))?;

        Ok((incident, connection, run))
    }

    async fn fetch_file(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        default_branch: &str,
    ) -> Result<FileContent, ProviderError> {
        match self
            .github
            .get_file(token, owner, repo, path, Some(branch))
            .await
        {
            Ok(file) => Ok(file),
            Err(ProviderError::NotFound) if branch != default_branch => {
                self.github
                    .get_file(token, owner, repo, path, Some(default_branch))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_base(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        default_branch: &str,
    ) -> Result<(String, String), Failure> {
        match self.github.get_branch_head(token, owner, repo, branch).await {
            Ok(sha) => Ok((branch.to_string(), sha)),
            Err(ProviderError::NotFound) if branch != default_branch => {
                let sha = self
                    .github
                    .get_branch_head(token, owner, repo, default_branch)
                    .await
                    .map_err(|e| Failure::new(RemediationFailure::Provider, e.to_string()))?;
                Ok((default_branch.to_string(), sha))
            }
            Err(e) => Err(Failure::new(RemediationFailure::Provider, e.to_string())),
        }
    }
}

/// Ask the model for a fix and validate/apply it against the fetched
/// file. Does not touch the code host.
async fn prepare_fix(
    model: &dyn SolutionModel,
    request: &SolutionRequest,
    file: &FileContent,
) -> Result<PreparedFix, SkipReason> {
    let solution = match model.generate_solution(request).await {
        Ok(solution) => solution,
        Err(ModelError::NoChanges) => {
            return Err(SkipReason::Unusable("model proposed no changes".to_string()))
        }
        Err(ModelError::BudgetExceeded) => return Err(SkipReason::TokenBudget),
        Err(e) => return Err(SkipReason::Unusable(e.to_string())),
    };

    let line_count = mendbot_core::patch::line_count(&file.content);
    solution
        .patch
        .validate(line_count)
        .map_err(|e| SkipReason::Unusable(format!("invalid patch: {}", e)))?;

    let new_content = solution
        .patch
        .apply(&file.content)
        .map_err(|e| SkipReason::Unusable(format!("patch application failed: {}", e)))?;

    if new_content == file.content {
        return Err(SkipReason::Unusable("patch is a no-op".to_string()));
    }

    // The effective substitutions: first change per line wins during
    // application, so the commit body lists exactly those.
    let applied = if solution.patch.replacement.is_some() {
        Vec::new()
    } else {
        let mut seen = std::collections::HashSet::new();
        let mut applied: Vec<LineChange> = solution
            .patch
            .changes
            .iter()
            .filter(|c| seen.insert(c.line_number))
            .cloned()
            .collect();
        applied.sort_by_key(|c| c.line_number);
        applied
    };

    Ok(PreparedFix {
        path: request.file_path.clone(),
        new_content,
        original_sha: file.sha.clone(),
        summary: solution.summary,
        rationale: solution.root_cause,
        error_type: request
            .error_blocks
            .first()
            .map(|b| b.error_type)
            .unwrap_or(ErrorType::Unknown),
        applied,
    })
}

/// Rank error blocks into at most `max_files` candidate files, keeping
/// at most `max_per_file` blocks each.
///
/// Files are ranked by: has a line number, highest severity, block
/// count. Ties keep first-appearance order (the sort is stable), which
/// makes the processing order deterministic for identical logs.
fn select_candidates(
    blocks: &[ErrorBlock],
    max_files: usize,
    max_per_file: usize,
) -> Vec<(String, Vec<ErrorBlock>)> {
    let mut order: Vec<String> = Vec::new();
    let mut by_file: HashMap<String, Vec<ErrorBlock>> = HashMap::new();

    for block in blocks {
        let Some(file) = &block.file else { continue };
        if !by_file.contains_key(file) {
            order.push(file.clone());
        }
        by_file.entry(file.clone()).or_default().push(block.clone());
    }

    let mut groups: Vec<(String, Vec<ErrorBlock>)> = order
        .into_iter()
        .map(|file| {
            let group = by_file.remove(&file).unwrap_or_default();
            (file, group)
        })
        .collect();

    groups.sort_by(|a, b| {
        let key = |g: &(String, Vec<ErrorBlock>)| {
            (
                g.1.iter().any(|b| b.line.is_some()),
                g.1.iter().map(|b| b.severity).max().unwrap_or(Severity::Low),
                g.1.len(),
            )
        };
        key(b).cmp(&key(a))
    });
    groups.truncate(max_files);

    for (_, group) in &mut groups {
        group.sort_by(|a, b| (b.line.is_some(), b.severity).cmp(&(a.line.is_some(), a.severity)));
        group.truncate(max_per_file);
    }

    groups
}

/// Cap the log context per block, truncating from the tail and keeping
/// the head.
fn truncate_block(block: &ErrorBlock, max_chars: usize) -> ErrorBlock {
    if block.message.chars().count() <= max_chars {
        return block.clone();
    }
    let truncated: String = block.message.chars().take(max_chars).collect();
    ErrorBlock {
        message: truncated,
        ..block.clone()
    }
}

/// Subject `Fix <file> (<error_type>)` capped at 72 chars; the body
/// enumerates the applied line changes.
fn commit_message(fix: &PreparedFix) -> String {
    let subject = truncate_subject(
        &format!("Fix {} ({})", fix.path, fix.error_type.as_str()),
        COMMIT_SUBJECT_MAX,
    );

    let mut body = String::new();
    if fix.applied.is_empty() {
        body.push_str("Replaced the full file contents.");
    } else {
        for change in &fix.applied {
            body.push_str(&format!("line {}: {}\n", change.line_number, change.fixed_line));
        }
    }

    format!("{}\n\n{}", subject, body.trim_end())
}

fn truncate_subject(subject: &str, max: usize) -> String {
    if subject.chars().count() <= max {
        return subject.to_string();
    }
    let kept: String = subject.chars().take(max - 3).collect();
    format!("{}...", kept)
}

fn build_pr_body(
    incident: &Incident,
    run: &WorkflowRun,
    written: &[&PreparedFix],
    skipped: &[(String, String)],
) -> String {
    let mut body = String::new();
    body.push_str("## Automated fix\n\n");
    body.push_str(&format!("- **Incident:** `{}`\n", incident.incident_id));
    body.push_str(&format!("- **Workflow:** {}\n", run.workflow_name));
    body.push_str(&format!("- **Branch:** `{}`\n", run.branch));
    body.push_str(&format!("- **Commit:** `{}`\n", short_sha(&run.commit_sha)));

    body.push_str("\n### Changes\n\n");
    for fix in written {
        body.push_str(&format!("- `{}` — {}\n", fix.path, fix.summary));
        if let Some(rationale) = &fix.rationale {
            body.push_str(&format!("  - {}\n", rationale));
        }
    }

    if !skipped.is_empty() {
        body.push_str("\n### Not included\n\n");
        for (path, reason) in skipped {
            body.push_str(&format!("- `{}` — {}\n", path, reason));
        }
    }

    body.push_str(
        "\n---\n\nThis pull request is machine-generated. Review before merge.\n",
    );
    body
}

fn short_sha(sha: &str) -> &str {
    if sha.len() >= 7 {
        &sha[..7]
    } else {
        sha
    }
}

/// Bounded worker pool for remediation tasks: ingest handlers dispatch
/// and return immediately, and at most `workers` orchestrations run
/// concurrently so one slow model call cannot exhaust ingest capacity.
#[derive(Clone)]
pub struct RemediationDispatcher {
    orchestrator: Arc<RemediationOrchestrator>,
    permits: Arc<Semaphore>,
}

impl RemediationDispatcher {
    pub fn new(orchestrator: Arc<RemediationOrchestrator>, workers: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn dispatch(&self, incident_id: String) {
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            orchestrator.remediate(&incident_id).await;
        });
    }
}
