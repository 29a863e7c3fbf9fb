//! Error taxonomies shared across the service.

use std::time::Duration;

/// Typed outcome of a code-host API call.
///
/// `RateLimited` and `TransientNetwork` are retried inside the provider
/// client with bounded backoff; every other variant surfaces to the
/// caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected the credentials")]
    Unauthorized,
    #[error("token lacks the required scope")]
    Forbidden,
    #[error("resource not found")]
    NotFound,
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("provider unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },
}

impl ProviderError {
    /// Whether the internal retry loop may try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::TransientNetwork(_)
        )
    }
}

/// Why a remediation attempt stopped without opening a pull request.
/// Recorded verbatim on the incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationFailure {
    NoCredentials,
    NoLogs,
    NoSignal,
    Budget,
    Provider,
    Conflict,
    Timeout,
    Other,
}

impl RemediationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationFailure::NoCredentials => "failed_no_credentials",
            RemediationFailure::NoLogs => "failed_no_logs",
            RemediationFailure::NoSignal => "failed_no_signal",
            RemediationFailure::Budget => "failed_budget",
            RemediationFailure::Provider => "failed_provider",
            RemediationFailure::Conflict => "failed_conflict",
            RemediationFailure::Timeout => "failed_timeout",
            RemediationFailure::Other => "failed_remediation",
        }
    }
}

impl std::fmt::Display for RemediationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(ProviderError::TransientNetwork("reset".into()).is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(!ProviderError::Unauthorized.is_retryable());
        assert!(!ProviderError::Conflict("sha mismatch".into()).is_retryable());
        assert!(!ProviderError::Provider { status: 500, body: String::new() }.is_retryable());
    }
}
