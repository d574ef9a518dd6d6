//! Exact-string edit tool.
//!
//! The match must be unique unless `replace_all` is set; the dispatcher
//! layers an auto-retry (re-read + augmented error) on top of the failure
//! messages produced here, so their wording is part of the contract.

use super::helpers::compact_diff;
use crate::tools::{Tool, ToolContext, ToolKind, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

pub struct EditFileTool;

impl EditFileTool {
    /// Pure replacement logic, shared with tests.
    pub fn replace(
        content: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<(String, usize), String> {
        if old_string.is_empty() {
            return Err("old_string cannot be empty".to_string());
        }
        if old_string == new_string {
            return Err("old_string and new_string must be different".to_string());
        }
        let count = content.matches(old_string).count();
        if count == 0 {
            let mut message = "old_string not found. Ensure it matches exactly, including \
                 whitespace and indentation. Re-read the file to see current content — it \
                 may have changed."
                .to_string();
            if let Some(close) = Self::closest_line(content, old_string) {
                message.push_str(&format!("\nClosest matching line: {:?}", close));
            }
            return Err(message);
        }
        if count > 1 && !replace_all {
            return Err(format!(
                "Found {} occurrences of old_string. Add more surrounding context to make \
                 it unique, or set replace_all=true to replace all {} occurrences.",
                count, count
            ));
        }
        if replace_all {
            Ok((content.replace(old_string, new_string), count))
        } else {
            Ok((content.replacen(old_string, new_string, 1), 1))
        }
    }

    /// Closest single line to the (first line of the) missed search string,
    /// when it is similar enough to be the likely intended target.
    fn closest_line(content: &str, old_string: &str) -> Option<String> {
        let needle = old_string.lines().next()?.trim();
        if needle.is_empty() {
            return None;
        }
        let mut best: Option<(usize, &str)> = None;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let distance = strsim::levenshtein(trimmed, needle);
            if best.map(|(d, _)| distance < d).unwrap_or(true) {
                best = Some((distance, line));
            }
        }
        let (distance, line) = best?;
        let max_len = needle.len().max(line.trim().len());
        // Only suggest when at least ~70% of the characters line up.
        if max_len > 0 && (distance as f64 / max_len as f64) <= 0.3 {
            Some(line.to_string())
        } else {
            None
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Replace an exact string in a file. Fails unless old_string occurs \
             exactly once; set replace_all=true to replace every occurrence \
             (useful for renames). Preserve the exact indentation as it appears \
             after the line-number prefix in read_file output.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                    "replace_all": {"type": "boolean", "default": false}
                },
                "required": ["path", "old_string", "new_string"]
            }),
        )
    }

    fn kind(&self) -> ToolKind {
        ToolKind::FileMutating
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let path = match require_str(&input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let old_string = match input.get("old_string").and_then(Value::as_str) {
            Some(s) => s,
            None => return ToolResult::err("old_string is required"),
        };
        let new_string = match input.get("new_string").and_then(Value::as_str) {
            Some(s) => s,
            None => return ToolResult::err("new_string is required"),
        };
        let replace_all = input
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !ctx.backend.file_exists(path).await {
            return ToolResult::err(format!("File not found: {}", path));
        }
        let content = match ctx.backend.read_file(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("Failed to read {}: {}", path, e)),
        };

        let (new_content, replaced) =
            match Self::replace(&content, old_string, new_string, replace_all) {
                Ok(r) => r,
                Err(msg) => return ToolResult::err(format!("{} (in {})", msg, path)),
            };

        if let Err(e) = ctx.backend.write_file(path, &new_content).await {
            return ToolResult::err(format!("Failed to write {}: {}", path, e));
        }

        let mut summary = format!("Applied edit to {}", path);
        if replaced > 1 {
            summary.push_str(&format!(" ({} replacements)", replaced));
        }
        let diff_text = compact_diff(&content, &new_content, path, 60);
        if diff_text.is_empty() {
            ToolResult::ok(summary)
        } else {
            ToolResult::ok(format!("{}\n{}", summary, diff_text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn zero_matches_is_error() {
        let err = EditFileTool::replace("hello", "absent", "x", false).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn near_miss_suggests_closest_line() {
        let content = "let debug_mode = false;\nother line\n";
        let err =
            EditFileTool::replace(content, "let debug_mode = true;", "x", false).unwrap_err();
        assert!(err.contains("Closest matching line"));
        assert!(err.contains("debug_mode"));

        // Nothing remotely similar: no suggestion.
        let err = EditFileTool::replace(content, "zzzzqqqq", "x", false).unwrap_err();
        assert!(!err.contains("Closest matching line"));
    }

    #[test]
    fn single_match_replaces() {
        let (out, n) = EditFileTool::replace("a b c", "b", "B", false).unwrap();
        assert_eq!(out, "a B c");
        assert_eq!(n, 1);
    }

    #[test]
    fn multiple_matches_require_replace_all() {
        let err = EditFileTool::replace("x x x", "x", "y", false).unwrap_err();
        assert!(err.contains("3 occurrences"));
        let (out, n) = EditFileTool::replace("x x x", "x", "y", true).unwrap();
        assert_eq!(out, "y y y");
        assert_eq!(n, 3);
    }

    #[test]
    fn identical_strings_rejected() {
        let err = EditFileTool::replace("abc", "b", "b", false).unwrap_err();
        assert!(err.contains("must be different"));
        let err = EditFileTool::replace("abc", "", "x", false).unwrap_err();
        assert!(err.contains("cannot be empty"));
    }

    #[tokio::test]
    async fn edit_applies_and_reports_count() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend
            .write_file("f.py", "DEBUG=False\nother\n")
            .await
            .unwrap();
        let ctx = ToolContext::new(backend.clone());
        let result = EditFileTool
            .execute(
                json!({"path": "f.py", "old_string": "DEBUG=False", "new_string": "DEBUG=True"}),
                &ctx,
            )
            .await;
        assert!(result.success, "{:?}", result);
        assert!(result.output.contains("Applied edit to f.py"));
        assert_eq!(
            backend.read_file("f.py").await.unwrap(),
            "DEBUG=True\nother\n"
        );
    }

    #[tokio::test]
    async fn replace_all_reports_replacements() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("f.txt", "foo bar foo\n").await.unwrap();
        let ctx = ToolContext::new(backend);
        let result = EditFileTool
            .execute(
                json!({"path": "f.txt", "old_string": "foo", "new_string": "qux", "replace_all": true}),
                &ctx,
            )
            .await;
        assert!(result.success);
        assert!(result.output.contains("(2 replacements)"));
    }
}
