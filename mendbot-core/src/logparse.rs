//! Extraction of structured error records from raw workflow-run logs.
//!
//! The parser is pure and stateless: given the same input it always
//! produces the same ordered sequence of [`ErrorBlock`]s. It tolerates
//! ANSI color codes, per-line timestamp prefixes, interleaved
//! stdout/stderr and mixed CRLF/LF line endings.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    LintError,
    TypeError,
    BuildFailure,
    TestFailure,
    DependencyError,
    ConfigError,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::LintError => "lint_error",
            ErrorType::TypeError => "type_error",
            ErrorType::BuildFailure => "build_failure",
            ErrorType::TestFailure => "test_failure",
            ErrorType::DependencyError => "dependency_error",
            ErrorType::ConfigError => "config_error",
            ErrorType::Unknown => "unknown",
        }
    }
}

/// One extracted failure record. `file`/`line` are absent when the log
/// line carried no source location (e.g. a bare `npm ERR!`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBlock {
    pub step: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub error_type: ErrorType,
    pub message: String,
    pub severity: Severity,
}

static ANSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
static TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T[0-9:.]+Z ?").unwrap());
static GROUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^##\[group\](.+)$").unwrap());

/// `path/to/file.ext:LINE[:COL]` anywhere in the line (tsc, gcc, clippy
/// `-->` spans, eslint compact output).
static PATH_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<file>[A-Za-z0-9_][A-Za-z0-9_./\-]*\.[A-Za-z0-9]{1,8}):(?P<line>\d+)(?::\d+)?")
        .unwrap()
});

/// Python traceback frame.
static PY_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"File "(?P<file>[^"]+)", line (?P<line>\d+)"#).unwrap());

/// Python exception terminator, e.g. `ValueError: bad input`.
static PY_EXC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*(Error|Exception): ").unwrap());

/// rustc diagnostic header; the location arrives on a following `-->` line.
static RUSTC_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(error(\[E\d+\])?|warning): ").unwrap());
static RUSTC_ARROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--> (?P<file>[A-Za-z0-9_./\-]+):(?P<line>\d+)").unwrap());

/// Lines that are failures even without a source location.
static BARE_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(module not found|cannot find module|modulenotfounderror|npm ERR!|assertionerror|is not assignable|invalid workflow file)",
    )
    .unwrap()
});

/// Keywords that make a located line worth extracting at all.
static INTERESTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(error|warning|fail|exception|assert|not found|is not defined|is not assignable|panicked)")
        .unwrap()
});

/// Parse a raw log blob into an ordered sequence of error blocks.
pub fn parse_log(input: &str) -> Vec<ErrorBlock> {
    let mut blocks: Vec<ErrorBlock> = Vec::new();
    let mut step = String::from("log");
    // rustc-style header waiting for its `-->` location line.
    let mut pending_header: Option<String> = None;
    // Innermost traceback frame waiting for its exception line.
    let mut pending_frame: Option<(String, u32)> = None;

    for raw in input.lines() {
        let line = clean(raw);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = GROUP.captures(line) {
            step = caps[1].trim().to_string();
            pending_header = None;
            pending_frame = None;
            continue;
        }

        let line = line.strip_prefix("##[error]").unwrap_or(line);
        let line = line.trim();

        // A pending rustc header binds to the next `--> path:line` span.
        if let Some(message) = pending_header.take() {
            if let Some(caps) = RUSTC_ARROW.captures(line) {
                push_block(
                    &mut blocks,
                    ErrorBlock {
                        step: step.clone(),
                        file: Some(caps["file"].to_string()),
                        line: caps["line"].parse().ok(),
                        error_type: classify(&message),
                        severity: severity_of(&message),
                        message,
                    },
                );
                continue;
            }
            // Header without a span: keep it as an unlocated block.
            push_block(
                &mut blocks,
                ErrorBlock {
                    step: step.clone(),
                    file: None,
                    line: None,
                    error_type: classify(&message),
                    severity: severity_of(&message),
                    message,
                },
            );
        }

        if RUSTC_HEADER.is_match(line) && !PATH_LINE.is_match(line) {
            pending_header = Some(line.to_string());
            continue;
        }

        if let Some(caps) = PY_FRAME.captures(line) {
            pending_frame = Some((caps["file"].to_string(), caps["line"].parse().unwrap_or(0)));
            continue;
        }

        if let Some((file, line_no)) = pending_frame.take() {
            if PY_EXC.is_match(line) {
                push_block(
                    &mut blocks,
                    ErrorBlock {
                        step: step.clone(),
                        file: Some(file),
                        line: Some(line_no),
                        error_type: classify(line),
                        severity: severity_of(line),
                        message: line.to_string(),
                    },
                );
                continue;
            }
            // Still inside the traceback body; keep waiting on this frame.
            pending_frame = Some((file, line_no));
        }

        if let Some(caps) = PATH_LINE.captures(line) {
            if INTERESTING.is_match(line) {
                push_block(
                    &mut blocks,
                    ErrorBlock {
                        step: step.clone(),
                        file: Some(caps["file"].to_string()),
                        line: caps["line"].parse().ok(),
                        error_type: classify(line),
                        severity: severity_of(line),
                        message: line.to_string(),
                    },
                );
            }
            continue;
        }

        if BARE_FAILURE.is_match(line) {
            push_block(
                &mut blocks,
                ErrorBlock {
                    step: step.clone(),
                    file: None,
                    line: None,
                    error_type: classify(line),
                    severity: severity_of(line),
                    message: line.to_string(),
                },
            );
        }
    }

    // A trailing rustc header with no span still counts.
    if let Some(message) = pending_header {
        push_block(
            &mut blocks,
            ErrorBlock {
                step,
                file: None,
                line: None,
                error_type: classify(&message),
                severity: severity_of(&message),
                message,
            },
        );
    }

    blocks
}

/// Contiguous lines for the same `(file, line)` collapse into one block;
/// the first full message wins.
fn push_block(blocks: &mut Vec<ErrorBlock>, block: ErrorBlock) {
    if let Some(last) = blocks.last() {
        if last.file.is_some() && last.file == block.file && last.line == block.line {
            return;
        }
    }
    blocks.push(block);
}

fn clean(raw: &str) -> String {
    let no_ansi = ANSI.replace_all(raw, "");
    TIMESTAMP.replace(&no_ansi, "").into_owned()
}

fn classify(message: &str) -> ErrorType {
    let lower = message.to_ascii_lowercase();

    if lower.contains("cannot find module")
        || lower.contains("module not found")
        || lower.contains("modulenotfounderror")
        || lower.contains("npm err!")
        || lower.contains("could not resolve")
        || lower.contains("no matching version")
    {
        return ErrorType::DependencyError;
    }
    if lower.contains("is not assignable")
        || lower.contains("error ts")
        || lower.contains("typeerror")
        || lower.contains("mismatched types")
        || lower.contains("incompatible type")
    {
        return ErrorType::TypeError;
    }
    if lower.contains("assertionerror")
        || lower.contains("assertion")
        || lower.contains("test failed")
        || lower.contains("expected") && lower.contains("received")
        || lower.starts_with("fail")
    {
        return ErrorType::TestFailure;
    }
    if lower.contains("invalid workflow") || lower.contains("yaml") || lower.contains("config") {
        return ErrorType::ConfigError;
    }
    if lower.contains("eslint") || lower.contains("is not defined") || lower.contains("unused") {
        return ErrorType::LintError;
    }
    if lower.contains("warning") {
        return ErrorType::LintError;
    }
    if lower.contains("error") || lower.contains("panicked") || lower.contains("undefined reference")
    {
        return ErrorType::BuildFailure;
    }

    ErrorType::Unknown
}

fn severity_of(message: &str) -> Severity {
    let lower = message.to_ascii_lowercase();

    if lower.contains("panicked") || lower.contains("fatal") {
        return Severity::Critical;
    }
    if lower.contains("assertionerror") || lower.contains("test failed") || lower.starts_with("fail")
    {
        return Severity::High;
    }
    if lower.contains("warning") {
        return Severity::Low;
    }
    if lower.contains("error") || lower.contains("exception") {
        return Severity::High;
    }

    Severity::Medium
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_log_yields_empty_sequence() {
        assert!(parse_log("").is_empty());
        assert!(parse_log("\n\n\n").is_empty());
    }

    #[test]
    fn extracts_tsc_style_error() {
        let blocks = parse_log("src/app.ts:42:5 error 'React' is not defined\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file.as_deref(), Some("src/app.ts"));
        assert_eq!(blocks[0].line, Some(42));
        assert_eq!(blocks[0].error_type, ErrorType::LintError);
        assert_eq!(blocks[0].severity, Severity::High);
    }

    #[test]
    fn rustc_header_binds_to_arrow_span() {
        let log = "error[E0308]: mismatched types\n  --> src/main.rs:17:9\n   |\n";
        let blocks = parse_log(log);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file.as_deref(), Some("src/main.rs"));
        assert_eq!(blocks[0].line, Some(17));
        assert_eq!(blocks[0].error_type, ErrorType::TypeError);
    }

    #[test]
    fn python_traceback_binds_frame_to_exception() {
        let log = concat!(
            "Traceback (most recent call last):\n",
            "  File \"app/main.py\", line 12, in <module>\n",
            "    run()\n",
            "ValueError: bad input\n",
        );
        let blocks = parse_log(log);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file.as_deref(), Some("app/main.py"));
        assert_eq!(blocks[0].line, Some(12));
        assert_eq!(blocks[0].message, "ValueError: bad input");
    }

    #[test]
    fn contiguous_duplicate_locations_collapse() {
        let log = concat!(
            "src/lib.rs:5:1 error first message\n",
            "src/lib.rs:5:9 error second message\n",
            "src/lib.rs:9:1 error third message\n",
        );
        let blocks = parse_log(log);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].message.contains("first message"));
        assert_eq!(blocks[1].line, Some(9));
    }

    #[test]
    fn strips_ansi_and_timestamps() {
        let log = "2024-05-02T10:31:07.1234567Z \x1b[31msrc/app.ts:3:1 error broken\x1b[0m\n";
        let blocks = parse_log(log);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file.as_deref(), Some("src/app.ts"));
        assert_eq!(blocks[0].message, "src/app.ts:3:1 error broken");
    }

    #[test]
    fn tolerates_crlf() {
        let log = "src/a.ts:1:1 error x\r\nsrc/b.ts:2:2 error y\r\n";
        let blocks = parse_log(log);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].file.as_deref(), Some("src/b.ts"));
    }

    #[test]
    fn step_comes_from_group_markers() {
        let log = "##[group]Run tests\nsrc/a.ts:1:1 error x\n";
        let blocks = parse_log(log);
        assert_eq!(blocks[0].step, "Run tests");
    }

    #[test]
    fn bare_dependency_failure_has_no_location() {
        let blocks = parse_log("Module not found: Error: Can't resolve './missing'\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file, None);
        assert_eq!(blocks[0].error_type, ErrorType::DependencyError);
    }

    #[test]
    fn warnings_map_to_low_severity() {
        let blocks = parse_log("src/a.ts:1:1 warning unused variable\n");
        assert_eq!(blocks[0].severity, Severity::Low);
        assert_eq!(blocks[0].error_type, ErrorType::LintError);
    }

    #[test]
    fn error_prefix_marker_is_stripped() {
        let blocks = parse_log("##[error]src/a.ts:4:1 error boom\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].file.as_deref(), Some("src/a.ts"));
    }

    #[test]
    fn uninteresting_located_lines_are_skipped() {
        // A path:line with no failure keyword is plain output, not an error.
        let blocks = parse_log("cached artifact at target/debug/build.rs:10\n");
        assert!(blocks.is_empty());
    }

    proptest! {
        // Determinism: parsing the same input twice gives the same output.
        #[test]
        fn prop_parse_is_deterministic(input in "[ -~\n\r\t]{0,2000}") {
            prop_assert_eq!(parse_log(&input), parse_log(&input));
        }

        // The parser never panics on arbitrary (including non-ASCII) input.
        #[test]
        fn prop_parse_total(input in ".{0,2000}") {
            let _ = parse_log(&input);
        }
    }
}
