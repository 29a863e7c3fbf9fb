//! The structured-patch contract between the model and the pull-request
//! builder.
//!
//! A patch is either a set of single-line substitutions or a full
//! replacement buffer. Model output is validated before anything is
//! written back to the code host: every referenced line must exist, the
//! text must be UTF-8 clean with no NUL bytes, and an empty change set is
//! rejected outright.

use serde::{Deserialize, Serialize};

/// A single-line substitution. `line_number` is 1-indexed into the file
/// as fetched from the code host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineChange {
    pub line_number: usize,
    pub fixed_line: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// A validated patch for one file: line-wise changes, or a whole-buffer
/// replacement when the model rewrote the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    #[serde(default)]
    pub changes: Vec<LineChange>,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("patch contains no changes")]
    Empty,
    #[error("line {line} is out of range for a {len}-line file")]
    LineOutOfRange { line: usize, len: usize },
    #[error("replacement text contains a NUL byte")]
    NulByte,
    #[error("fixed line for line {0} contains a line break")]
    EmbeddedNewline(usize),
}

impl FilePatch {
    /// Validate this patch against the target file's line count.
    pub fn validate(&self, file_line_count: usize) -> Result<(), PatchError> {
        if let Some(replacement) = &self.replacement {
            if replacement.is_empty() {
                return Err(PatchError::Empty);
            }
            if replacement.contains('\0') {
                return Err(PatchError::NulByte);
            }
            return Ok(());
        }

        if self.changes.is_empty() {
            return Err(PatchError::Empty);
        }
        for change in &self.changes {
            if change.line_number == 0 || change.line_number > file_line_count {
                return Err(PatchError::LineOutOfRange {
                    line: change.line_number,
                    len: file_line_count,
                });
            }
            if change.fixed_line.contains('\0') {
                return Err(PatchError::NulByte);
            }
            if change.fixed_line.contains('\n') || change.fixed_line.contains('\r') {
                return Err(PatchError::EmbeddedNewline(change.line_number));
            }
        }
        Ok(())
    }

    /// Produce the new file content. Replacement patches return the
    /// buffer as-is; line patches go through [`apply_changes`].
    pub fn apply(&self, content: &str) -> Result<String, PatchError> {
        if let Some(replacement) = &self.replacement {
            return Ok(replacement.clone());
        }
        apply_changes(content, &self.changes)
    }
}

/// Apply line-wise substitutions to `content`, preserving each line's
/// original terminator (LF or CRLF) and the presence or absence of a
/// trailing newline.
///
/// Changes are applied from the highest line number down so earlier
/// substitutions cannot shift later indices. When several changes target
/// the same line, the first one wins; the rest are treated as context.
pub fn apply_changes(content: &str, changes: &[LineChange]) -> Result<String, PatchError> {
    if changes.is_empty() {
        return Err(PatchError::Empty);
    }

    let mut lines = split_keeping_terminators(content);

    let mut ordered: Vec<&LineChange> = changes.iter().collect();
    // Stable sort: for equal line numbers the original order survives,
    // and the first occurrence is the one retained below.
    ordered.sort_by(|a, b| b.line_number.cmp(&a.line_number));

    let mut last_applied: Option<usize> = None;
    for change in ordered {
        if change.line_number == 0 || change.line_number > lines.len() {
            return Err(PatchError::LineOutOfRange {
                line: change.line_number,
                len: lines.len(),
            });
        }
        if last_applied == Some(change.line_number) {
            continue;
        }
        lines[change.line_number - 1].0 = change.fixed_line.clone();
        last_applied = Some(change.line_number);
    }

    let mut out = String::with_capacity(content.len());
    for (body, terminator) in &lines {
        out.push_str(body);
        out.push_str(terminator);
    }
    Ok(out)
}

/// Split into `(body, terminator)` pairs where terminator is `"\n"`,
/// `"\r\n"`, or `""` for a final unterminated line.
fn split_keeping_terminators(content: &str) -> Vec<(String, String)> {
    let mut lines = Vec::new();
    for segment in content.split_inclusive('\n') {
        if let Some(body) = segment.strip_suffix("\r\n") {
            lines.push((body.to_string(), "\r\n".to_string()));
        } else if let Some(body) = segment.strip_suffix('\n') {
            lines.push((body.to_string(), "\n".to_string()));
        } else {
            lines.push((segment.to_string(), String::new()));
        }
    }
    lines
}

/// Line count as seen by patch validation (a trailing newline does not
/// create a phantom empty line).
pub fn line_count(content: &str) -> usize {
    split_keeping_terminators(content).len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn change(line: usize, text: &str) -> LineChange {
        LineChange {
            line_number: line,
            fixed_line: text.to_string(),
            explanation: None,
        }
    }

    #[test]
    fn replaces_single_line() {
        let content = "a\nb\nc\n";
        let out = apply_changes(content, &[change(2, "B")]).unwrap();
        assert_eq!(out, "a\nB\nc\n");
    }

    #[test]
    fn preserves_crlf_and_missing_trailing_newline() {
        let content = "a\r\nb\r\nc";
        let out = apply_changes(content, &[change(1, "A"), change(3, "C")]).unwrap();
        assert_eq!(out, "A\r\nb\r\nC");
    }

    #[test]
    fn file_of_length_one() {
        let out = apply_changes("only", &[change(1, "fixed")]).unwrap();
        assert_eq!(out, "fixed");
    }

    #[test]
    fn line_number_equal_to_file_length() {
        let content = "a\nb\nc\n";
        let out = apply_changes(content, &[change(3, "C")]).unwrap();
        assert_eq!(out, "a\nb\nC\n");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let err = apply_changes("a\nb\n", &[change(3, "x")]).unwrap_err();
        assert_eq!(err, PatchError::LineOutOfRange { line: 3, len: 2 });
        let err = apply_changes("a\nb\n", &[change(0, "x")]).unwrap_err();
        assert_eq!(err, PatchError::LineOutOfRange { line: 0, len: 2 });
    }

    #[test]
    fn duplicate_line_changes_first_wins() {
        let content = "a\nb\n";
        let out =
            apply_changes(content, &[change(2, "first"), change(2, "second")]).unwrap();
        assert_eq!(out, "a\nfirst\n");
    }

    #[test]
    fn high_to_low_keeps_indices_valid() {
        let content = "1\n2\n3\n4\n";
        let out = apply_changes(
            content,
            &[change(1, "one"), change(4, "four"), change(2, "two")],
        )
        .unwrap();
        assert_eq!(out, "one\ntwo\n3\nfour\n");
    }

    #[test]
    fn empty_change_set_is_rejected() {
        assert_eq!(apply_changes("a\n", &[]).unwrap_err(), PatchError::Empty);
    }

    #[test]
    fn validate_rejects_nul_and_newlines() {
        let patch = FilePatch {
            path: "a.rs".into(),
            changes: vec![change(1, "bad\0line")],
            replacement: None,
            rationale: None,
        };
        assert_eq!(patch.validate(5).unwrap_err(), PatchError::NulByte);

        let patch = FilePatch {
            path: "a.rs".into(),
            changes: vec![change(1, "two\nlines")],
            replacement: None,
            rationale: None,
        };
        assert_eq!(patch.validate(5).unwrap_err(), PatchError::EmbeddedNewline(1));
    }

    #[test]
    fn validate_accepts_full_replacement() {
        let patch = FilePatch {
            path: "a.rs".into(),
            changes: vec![],
            replacement: Some("fn main() {}\n".into()),
            rationale: Some("rewrote the file".into()),
        };
        patch.validate(1).unwrap();
        assert_eq!(patch.apply("old\n").unwrap(), "fn main() {}\n");
    }

    #[test]
    fn line_count_ignores_trailing_newline() {
        assert_eq!(line_count("a\nb\n"), 2);
        assert_eq!(line_count("a\nb"), 2);
        assert_eq!(line_count(""), 0);
    }

    #[test]
    fn deserializes_the_model_contract() {
        let json = r#"{
            "path": "src/app.ts",
            "changes": [{"line_number": 3, "fixed_line": "import React from 'react';"}],
            "rationale": "missing import"
        }"#;
        let patch: FilePatch = serde_json::from_str(json).unwrap();
        assert_eq!(patch.path, "src/app.ts");
        assert_eq!(patch.changes.len(), 1);
        assert_eq!(patch.changes[0].explanation, None);
        assert_eq!(patch.replacement, None);
        patch.validate(10).unwrap();
    }

    proptest! {
        // Soundness: after applying in-range changes, extracting the
        // modified lines yields exactly the specified fixed lines, and
        // the line count never changes.
        #[test]
        fn prop_patch_application_soundness(
            bodies in proptest::collection::vec("[a-z0-9 ]{0,20}", 1..40),
            picks in proptest::collection::vec((0usize..40, "[A-Z]{1,10}"), 1..8),
        ) {
            let content: String = bodies.iter().map(|b| format!("{}\n", b)).collect();
            let len = bodies.len();

            let mut changes = Vec::new();
            for (idx, text) in &picks {
                changes.push(change(idx % len + 1, text));
            }

            let out = apply_changes(&content, &changes).unwrap();
            let out_lines: Vec<&str> = out.lines().collect();
            prop_assert_eq!(out_lines.len(), len);

            // First change for a given line wins.
            let mut expected: Vec<String> = bodies.clone();
            let mut seen = std::collections::HashSet::new();
            for c in &changes {
                if seen.insert(c.line_number) {
                    expected[c.line_number - 1] = c.fixed_line.clone();
                }
            }
            for (i, body) in expected.iter().enumerate() {
                prop_assert_eq!(out_lines[i], body.as_str());
            }
        }

        // Applying an empty-diff change (same text) is the identity.
        #[test]
        fn prop_identity_change(bodies in proptest::collection::vec("[a-z]{0,10}", 1..20)) {
            let content: String = bodies.iter().map(|b| format!("{}\n", b)).collect();
            let changes: Vec<LineChange> = bodies
                .iter()
                .enumerate()
                .map(|(i, b)| change(i + 1, b))
                .collect();
            prop_assert_eq!(apply_changes(&content, &changes).unwrap(), content);
        }
    }
}
