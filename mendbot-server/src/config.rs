use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mendbot_core::Vault;

#[derive(Clone)]
pub struct Config {
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_redirect_uri: String,
    pub oauth_scopes: Vec<String>,
    /// Public base URL the code host delivers webhooks to.
    pub ingest_base_url: String,
    /// Vault built from TOKEN_ENCRYPTION_KEY. A missing or invalid key
    /// fails `from_env`, which is fatal at startup.
    pub vault: Vault,
    pub max_files_per_pr: usize,
    pub max_errors_per_file: usize,
    pub remediation_deadline: Duration,
    pub provider_retry_max_attempts: u32,
    pub llm_endpoint: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub llm_max_tokens: u32,
    /// Per-error-block cap on log context sent to the model.
    pub log_context_max_chars: usize,
    /// Size of the remediation worker pool.
    pub remediation_workers: usize,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
}

/// Read a required config value.
///
/// For a key like "OAUTH_CLIENT_SECRET":
/// 1. Check if OAUTH_CLIENT_SECRET_FILE is set - if so, read from that file path
/// 2. Otherwise, check OAUTH_CLIENT_SECRET env var directly
fn read_secret(key: &str) -> Result<String> {
    let file_key = format!("{}_FILE", key);

    if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        // Trim trailing whitespace (files often have trailing newlines)
        Ok(contents.trim_end().to_string())
    } else {
        env::var(key)
            .with_context(|| format!("{} or {} environment variable is required", key, file_key))
    }
}

/// Read an optional config value with the same `_FILE` fallback. An
/// explicitly-set but unreadable file is an error, not a silent None.
fn read_secret_optional(key: &str) -> Result<Option<String>> {
    let file_key = format!("{}_FILE", key);

    let value = if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        Some(contents)
    } else {
        env::var(key).ok()
    };

    Ok(value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }))
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let oauth_client_id = read_secret("OAUTH_CLIENT_ID")?;
        let oauth_client_secret = read_secret("OAUTH_CLIENT_SECRET")?;
        let oauth_redirect_uri = read_secret("OAUTH_REDIRECT_URI")?;

        let oauth_scopes = env::var("OAUTH_SCOPES")
            .unwrap_or_else(|_| "repo,workflow,read:user".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ingest_base_url = read_secret("INGEST_BASE_URL")?
            .trim_end_matches('/')
            .to_string();

        let encryption_key = read_secret("TOKEN_ENCRYPTION_KEY")?;
        let vault = Vault::from_base64(&encryption_key)
            .context("TOKEN_ENCRYPTION_KEY must be a base64-encoded 32-byte key")?;

        let llm_endpoint = read_secret("LLM_ENDPOINT")?;
        let llm_api_key = read_secret_optional("LLM_API_KEY")?;
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Ok(Config {
            oauth_client_id,
            oauth_client_secret,
            oauth_redirect_uri,
            oauth_scopes,
            ingest_base_url,
            vault,
            max_files_per_pr: env_or("MAX_FILES_PER_PR", 3usize)?,
            max_errors_per_file: env_or("MAX_ERRORS_PER_FILE", 5usize)?,
            remediation_deadline: Duration::from_secs(env_or("REMEDIATION_DEADLINE_S", 300u64)?),
            provider_retry_max_attempts: env_or("PROVIDER_RETRY_MAX_ATTEMPTS", 3u32)?,
            llm_endpoint,
            llm_api_key,
            llm_model,
            llm_timeout: Duration::from_secs(env_or("LLM_TIMEOUT_S", 60u64)?),
            llm_max_tokens: env_or("LLM_MAX_TOKENS", 4096u32)?,
            log_context_max_chars: env_or("LOG_CONTEXT_MAX_CHARS", 4000usize)?,
            remediation_workers: env_or("REMEDIATION_WORKERS", 4usize)?,
            port: env_or("PORT", 3000u16)?,
            state_dir: env::var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_secret_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "secret-value").unwrap();

        env::set_var("MB_TEST_SECRET_FILE", file.path());
        env::remove_var("MB_TEST_SECRET");

        let result = read_secret("MB_TEST_SECRET").unwrap();
        assert_eq!(result, "secret-value");

        env::remove_var("MB_TEST_SECRET_FILE");
    }

    #[test]
    fn test_read_secret_from_env() {
        env::remove_var("MB_TEST_SECRET2_FILE");
        env::set_var("MB_TEST_SECRET2", "env-value");

        let result = read_secret("MB_TEST_SECRET2").unwrap();
        assert_eq!(result, "env-value");

        env::remove_var("MB_TEST_SECRET2");
    }

    #[test]
    fn test_read_secret_file_takes_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-value").unwrap();

        env::set_var("MB_TEST_SECRET3_FILE", file.path());
        env::set_var("MB_TEST_SECRET3", "env-value");

        let result = read_secret("MB_TEST_SECRET3").unwrap();
        assert_eq!(result, "file-value");

        env::remove_var("MB_TEST_SECRET3_FILE");
        env::remove_var("MB_TEST_SECRET3");
    }

    #[test]
    fn test_read_secret_optional_none_when_missing() {
        env::remove_var("MB_TEST_OPT_FILE");
        env::remove_var("MB_TEST_OPT");

        let result = read_secret_optional("MB_TEST_OPT").unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_read_secret_optional_errors_when_file_unreadable() {
        env::set_var("MB_TEST_OPT2_FILE", "/nonexistent/path/to/secret");
        env::remove_var("MB_TEST_OPT2");

        let result = read_secret_optional("MB_TEST_OPT2");
        assert!(result.is_err());

        env::remove_var("MB_TEST_OPT2_FILE");
    }

    #[test]
    fn test_env_or_uses_default_and_parses() {
        env::remove_var("MB_TEST_NUM");
        assert_eq!(env_or("MB_TEST_NUM", 42u32).unwrap(), 42);

        env::set_var("MB_TEST_NUM", "7");
        assert_eq!(env_or("MB_TEST_NUM", 42u32).unwrap(), 7);

        env::set_var("MB_TEST_NUM", "not-a-number");
        assert!(env_or("MB_TEST_NUM", 42u32).is_err());

        env::remove_var("MB_TEST_NUM");
    }
}
