//! Shared HTTP plumbing for the provider clients: status-to-error mapping
//! and bounded retry with exponential backoff.
//!
//! Retries happen here and only here; every layer above the provider
//! clients sees typed outcomes, never a raw transport error.

use std::time::Duration;

use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use crate::error::ProviderError;

/// First retry delay; doubles per attempt up to [`MAX_BACKOFF`].
const BASE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Upper bound honored for a provider-advertised `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Send a request, retrying `RateLimited` and `TransientNetwork` failures
/// with backoff. `build` is called once per attempt because a
/// `RequestBuilder` is consumed by `send`.
pub async fn execute_with_retry<F>(
    policy: RetryPolicy,
    op: &'static str,
    build: F,
) -> Result<Response, ProviderError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let outcome = match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => error_for_response(response).await,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_body() => {
                ProviderError::TransientNetwork(e.to_string())
            }
            Err(e) => {
                return Err(ProviderError::Provider {
                    status: 0,
                    body: e.to_string(),
                })
            }
        };

        if !outcome.is_retryable() {
            return Err(outcome);
        }
        if attempt >= policy.max_attempts {
            warn!(
                "{}: giving up after {} attempts ({})",
                op, attempt, outcome
            );
            return Err(ProviderError::Unavailable { attempts: attempt });
        }

        let delay = backoff_delay(attempt, &outcome);
        warn!("{}: attempt {} failed ({}), retrying in {:?}", op, attempt, outcome, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Map a non-2xx response to the provider error taxonomy. Consumes the
/// response to capture the body for diagnostics.
pub async fn error_for_response(response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = parse_retry_after(&response);
    let rate_limit_exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "0")
        .unwrap_or(false);
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized,
        StatusCode::FORBIDDEN if rate_limit_exhausted => ProviderError::RateLimited { retry_after },
        StatusCode::FORBIDDEN => ProviderError::Forbidden,
        StatusCode::NOT_FOUND => ProviderError::NotFound,
        StatusCode::CONFLICT => ProviderError::Conflict(truncate(&body, 512)),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        // A 422 on a contents update means the supplied blob sha no longer
        // matches; everything else under 422 is a plain provider error.
        StatusCode::UNPROCESSABLE_ENTITY if body.contains("sha") => {
            ProviderError::Conflict(truncate(&body, 512))
        }
        s if s.is_server_error() => {
            ProviderError::TransientNetwork(format!("status {}: {}", s, truncate(&body, 256)))
        }
        s => ProviderError::Provider {
            status: s.as_u16(),
            body: truncate(&body, 1024),
        },
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Delay before the next attempt: the provider's `Retry-After` when it
/// gave one (capped), otherwise exponential backoff with jitter.
fn backoff_delay(attempt: u32, error: &ProviderError) -> Duration {
    if let ProviderError::RateLimited {
        retry_after: Some(after),
    } = error
    {
        return (*after).min(MAX_RETRY_AFTER);
    }

    let exp = BASE_BACKOFF.saturating_mul(1 << (attempt - 1).min(4));
    let capped = exp.min(MAX_BACKOFF);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
    capped + jitter
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let err = ProviderError::TransientNetwork("reset".into());
        let d1 = backoff_delay(1, &err);
        let d3 = backoff_delay(3, &err);
        assert!(d1 >= Duration::from_millis(250) && d1 < Duration::from_millis(400));
        assert!(d3 >= Duration::from_secs(1) && d3 <= Duration::from_millis(2100));

        // Deep attempts stay at the cap (plus jitter).
        let d10 = backoff_delay(10, &err);
        assert!(d10 <= Duration::from_millis(2100));
    }

    #[test]
    fn rate_limit_hint_wins_but_is_capped() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(backoff_delay(1, &err), Duration::from_secs(7));

        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(backoff_delay(1, &err), MAX_RETRY_AFTER);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 512), "short");
        let long = "é".repeat(300);
        let out = truncate(&long, 5);
        assert!(out.ends_with("..."));
    }
}
