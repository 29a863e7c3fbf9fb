//! The patch-synthesis capability.
//!
//! The orchestrator consumes an abstract [`SolutionModel`]; the real
//! implementation speaks an OpenAI-compatible chat-completions API. The
//! model is instructed to answer with strict JSON matching the
//! structured-patch contract, and anything that does not parse is a
//! typed failure, never a best-effort guess.

use std::time::Duration;

use async_trait::async_trait;
use mendbot_core::{ErrorBlock, FilePatch};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model endpoint failed: {0}")]
    Http(String),
    #[error("model call timed out")]
    Timeout,
    #[error("model returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("model returned no usable changes")]
    NoChanges,
    /// The completion was cut off by the token budget before the model
    /// finished answering. The truncated text is never parsed.
    #[error("model hit the token budget before completing")]
    BudgetExceeded,
}

/// Everything the model needs to propose a fix for one file.
#[derive(Debug, Clone)]
pub struct SolutionRequest {
    pub repository: String,
    pub workflow: String,
    pub branch: String,
    pub file_path: String,
    pub file_content: String,
    pub error_blocks: Vec<ErrorBlock>,
}

/// A parsed, structurally-sound model answer. Range validation against
/// the real file happens at the point of use.
#[derive(Debug, Clone)]
pub struct Solution {
    pub patch: FilePatch,
    pub summary: String,
    pub root_cause: Option<String>,
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait SolutionModel: Send + Sync {
    async fn generate_solution(&self, request: &SolutionRequest) -> Result<Solution, ModelError>;
}

#[derive(Clone)]
pub struct HttpSolutionModel {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// The JSON document the model is asked to produce.
#[derive(Debug, Deserialize)]
struct ModelSolution {
    summary: String,
    #[serde(default)]
    root_cause: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    changes: Vec<ModelChange>,
    #[serde(default)]
    replacement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelChange {
    line_number: usize,
    fixed_line: String,
    #[serde(default)]
    explanation: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a CI repair assistant. You are given a failing \
workflow's extracted error records and the full content of one source file. Propose the \
minimal fix. Respond with a single JSON object and nothing else, with fields: \
\"summary\" (string), \"root_cause\" (string or null), \"confidence\" (number 0-1 or null), \
\"changes\" (array of {\"line_number\": 1-indexed int, \"fixed_line\": string, \
\"explanation\": string}), and \"replacement\" (string or null; only when the whole file \
must be rewritten). Prefer line changes over replacement. Never invent line numbers \
outside the file.";

impl HttpSolutionModel {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
        max_tokens: u32,
    ) -> Self {
        let client = Client::builder()
            .user_agent(concat!("mendbot/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_tokens,
        }
    }

    fn build_user_prompt(request: &SolutionRequest) -> String {
        let mut prompt = format!(
            "Repository: {}\nWorkflow: {}\nBranch: {}\nFile: {}\n\nExtracted errors:\n",
            request.repository, request.workflow, request.branch, request.file_path
        );
        for block in &request.error_blocks {
            match block.line {
                Some(line) => {
                    prompt.push_str(&format!(
                        "- [{}] line {}: {}\n",
                        block.error_type.as_str(),
                        line,
                        block.message
                    ));
                }
                None => {
                    prompt.push_str(&format!(
                        "- [{}] {}\n",
                        block.error_type.as_str(),
                        block.message
                    ));
                }
            }
        }
        prompt.push_str("\nFile content (1-indexed):\n");
        for (i, line) in request.file_content.lines().enumerate() {
            prompt.push_str(&format!("{:>5} | {}\n", i + 1, line));
        }
        prompt
    }
}

#[async_trait]
impl SolutionModel for HttpSolutionModel {
    async fn generate_solution(&self, request: &SolutionRequest) -> Result<Solution, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::build_user_prompt(request),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.1,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Http(format!("status {}: {}", status, text)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        let content = extract_content(&chat)?;

        info!(
            "Model produced {} chars of output for {}",
            content.len(),
            request.file_path
        );
        parse_solution(&request.file_path, content)
    }
}

/// Pull the completion text out of the response, rejecting completions
/// that ran out of tokens mid-answer.
fn extract_content(chat: &ChatResponse) -> Result<&str, ModelError> {
    let choice = chat
        .choices
        .first()
        .ok_or_else(|| ModelError::InvalidResponse("empty completion".to_string()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        return Err(ModelError::BudgetExceeded);
    }

    choice
        .message
        .content
        .as_deref()
        .ok_or_else(|| ModelError::InvalidResponse("empty completion".to_string()))
}

/// Parse the model's JSON answer into a [`Solution`]. Tolerates the one
/// systematic deviation models actually produce (a fenced code block
/// around the JSON); everything else is a hard reject.
fn parse_solution(file_path: &str, content: &str) -> Result<Solution, ModelError> {
    let json = strip_code_fences(content);
    let parsed: ModelSolution =
        serde_json::from_str(json).map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

    if parsed.changes.is_empty() && parsed.replacement.is_none() {
        return Err(ModelError::NoChanges);
    }

    let patch = FilePatch {
        path: file_path.to_string(),
        changes: parsed
            .changes
            .into_iter()
            .map(|c| mendbot_core::LineChange {
                line_number: c.line_number,
                fixed_line: c.fixed_line,
                explanation: c.explanation,
            })
            .collect(),
        replacement: parsed.replacement,
        rationale: parsed.root_cause.clone(),
    };

    Ok(Solution {
        patch,
        summary: parsed.summary,
        root_cause: parsed.root_cause,
        confidence: parsed.confidence,
    })
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_end_matches('`').trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mendbot_core::{ErrorType, Severity};

    fn sample_request() -> SolutionRequest {
        SolutionRequest {
            repository: "acme/web".to_string(),
            workflow: "CI".to_string(),
            branch: "main".to_string(),
            file_path: "src/app.ts".to_string(),
            file_content: "const a = 1;\nconst b = 2;\n".to_string(),
            error_blocks: vec![ErrorBlock {
                step: "lint".to_string(),
                file: Some("src/app.ts".to_string()),
                line: Some(1),
                error_type: ErrorType::LintError,
                message: "src/app.ts:1:7 error 'a' is never used".to_string(),
                severity: Severity::Low,
            }],
        }
    }

    #[test]
    fn prompt_contains_errors_and_numbered_content() {
        let prompt = HttpSolutionModel::build_user_prompt(&sample_request());
        assert!(prompt.contains("Repository: acme/web"));
        assert!(prompt.contains("[lint_error] line 1"));
        assert!(prompt.contains("    1 | const a = 1;"));
        assert!(prompt.contains("    2 | const b = 2;"));
    }

    fn chat_response(content: Option<&str>, finish_reason: Option<&str>) -> ChatResponse {
        ChatResponse {
            choices: vec![ChatChoice {
                message: ChatChoiceMessage {
                    content: content.map(String::from),
                },
                finish_reason: finish_reason.map(String::from),
            }],
        }
    }

    #[test]
    fn truncated_completion_is_a_budget_breach() {
        let chat = chat_response(Some("{\"summary\":\"cut off mid"), Some("length"));
        assert!(matches!(
            extract_content(&chat),
            Err(ModelError::BudgetExceeded)
        ));
    }

    #[test]
    fn finished_completion_passes_through() {
        let chat = chat_response(Some("{}"), Some("stop"));
        assert_eq!(extract_content(&chat).unwrap(), "{}");

        // Providers that omit finish_reason are taken at face value.
        let chat = chat_response(Some("{}"), None);
        assert_eq!(extract_content(&chat).unwrap(), "{}");
    }

    #[test]
    fn missing_content_is_invalid() {
        let chat = chat_response(None, Some("stop"));
        assert!(matches!(
            extract_content(&chat),
            Err(ModelError::InvalidResponse(_))
        ));

        let empty = ChatResponse { choices: vec![] };
        assert!(matches!(
            extract_content(&empty),
            Err(ModelError::InvalidResponse(_))
        ));
    }

    #[test]
    fn parses_plain_json_solution() {
        let json = r#"{"summary":"remove unused var","root_cause":"dead code",
            "confidence":0.9,
            "changes":[{"line_number":1,"fixed_line":"","explanation":"drop it"}],
            "replacement":null}"#;
        let solution = parse_solution("src/app.ts", json).unwrap();
        assert_eq!(solution.patch.changes.len(), 1);
        assert_eq!(solution.patch.path, "src/app.ts");
        assert_eq!(solution.confidence, Some(0.9));
    }

    #[test]
    fn parses_fenced_json_solution() {
        let fenced = "```json\n{\"summary\":\"s\",\"changes\":[{\"line_number\":2,\"fixed_line\":\"x\"}]}\n```";
        let solution = parse_solution("a.rs", fenced).unwrap();
        assert_eq!(solution.patch.changes[0].line_number, 2);
    }

    #[test]
    fn rejects_empty_change_set() {
        let json = r#"{"summary":"nothing to do","changes":[],"replacement":null}"#;
        assert!(matches!(
            parse_solution("a.rs", json),
            Err(ModelError::NoChanges)
        ));
    }

    #[test]
    fn rejects_non_json_output() {
        assert!(matches!(
            parse_solution("a.rs", "I think you should fix line 3."),
            Err(ModelError::InvalidResponse(_))
        ));
    }
}
