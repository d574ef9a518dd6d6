//! File read tool: line-numbered output with large-file overviews.

use super::helpers::extract_structure;
use crate::tools::{Tool, ToolContext, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

const MAX_FULL_READ_LINES: usize = 500;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Read a file with line numbers. Files over 500 lines return a \
             structural overview plus head and tail; use offset/limit to read \
             specific sections.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the working directory"},
                    "offset": {"type": "integer", "description": "1-based first line to read"},
                    "limit": {"type": "integer", "description": "Number of lines to read"}
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let path = match require_str(&input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let offset = input.get("offset").and_then(Value::as_u64).map(|v| v as usize);
        let limit = input.get("limit").and_then(Value::as_u64).map(|v| v as usize);

        let content = match ctx.backend.read_file(path).await {
            Ok(content) => content,
            Err(e) => return ToolResult::err(format!("File not found: {} ({})", path, e)),
        };
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        if offset.is_some() || limit.is_some() {
            let start = offset.unwrap_or(1).saturating_sub(1);
            let count = limit.unwrap_or(total_lines);
            let end = (start + count).min(total_lines);
            if start >= total_lines {
                return ToolResult::err(format!(
                    "offset {} is past the end of the file ({} lines)",
                    start + 1,
                    total_lines
                ));
            }
            let numbered: Vec<String> = lines[start..end]
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:6}|{}", start + i + 1, line))
                .collect();
            let header = format!(
                "[{} lines total] (showing lines {}-{})",
                total_lines,
                start + 1,
                end
            );
            return ToolResult::ok(format!("{}\n{}", header, numbered.join("\n")));
        }

        if total_lines <= MAX_FULL_READ_LINES {
            let numbered: Vec<String> = lines
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:6}|{}", i + 1, line))
                .collect();
            return ToolResult::ok(format!(
                "[{} lines total]\n{}",
                total_lines,
                numbered.join("\n")
            ));
        }

        // Large file: structural overview + head + tail window.
        let structure = extract_structure(&lines);
        let head_n = 80.min(total_lines);
        let tail_n = 40.min(total_lines - head_n);
        let omitted = total_lines - head_n - tail_n;
        let head: Vec<String> = lines[..head_n]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:6}|{}", i + 1, line))
            .collect();
        let tail: Vec<String> = lines[total_lines - tail_n..]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:6}|{}", total_lines - tail_n + i + 1, line))
            .collect();
        let parts = [
            format!(
                "[{} lines total — file is large, showing overview + head + tail]",
                total_lines
            ),
            "[Use offset/limit to read specific sections]".to_string(),
            String::new(),
            "── structure (classes, functions, imports) ──".to_string(),
            structure,
            String::new(),
            format!("── first {} lines ──", head_n),
            head.join("\n"),
            format!(
                "\n  ... ({} lines omitted — use offset={} limit=N to read more) ...\n",
                omitted,
                head_n + 1
            ),
            format!("── last {} lines ──", tail_n),
            tail.join("\n"),
        ];
        ToolResult::ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn ctx_with_file(content: &str) -> (TempDir, ToolContext) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("f.py", content).await.unwrap();
        (dir, ToolContext::new(backend))
    }

    #[tokio::test]
    async fn small_file_is_fully_numbered() {
        let (_dir, ctx) = ctx_with_file("a\nb\nc\n").await;
        let result = ReadFileTool
            .execute(json!({"path": "f.py"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.starts_with("[3 lines total]"));
        assert!(result.output.contains("     1|a"));
        assert!(result.output.contains("     3|c"));
    }

    #[tokio::test]
    async fn offset_limit_window() {
        let content: String = (1..=20).map(|i| format!("line{}\n", i)).collect();
        let (_dir, ctx) = ctx_with_file(&content).await;
        let result = ReadFileTool
            .execute(json!({"path": "f.py", "offset": 5, "limit": 3}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("showing lines 5-7"));
        assert!(result.output.contains("     5|line5"));
        assert!(!result.output.contains("line8"));
    }

    #[tokio::test]
    async fn large_file_gets_overview() {
        let mut content = String::from("import os\n\ndef first():\n    pass\n");
        for i in 0..600 {
            content.push_str(&format!("x = {}\n", i));
        }
        content.push_str("def last():\n    pass\n");
        let (_dir, ctx) = ctx_with_file(&content).await;
        let result = ReadFileTool
            .execute(json!({"path": "f.py"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("lines total — file is large"));
        assert!(result.output.contains("structure"));
        assert!(result.output.contains("def first()"));
        assert!(result.output.contains("def last()"));
        assert!(result.output.contains("lines omitted"));
    }

    #[tokio::test]
    async fn missing_file_errors() {
        let (_dir, ctx) = ctx_with_file("x").await;
        let result = ReadFileTool
            .execute(json!({"path": "missing.py"}), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.text().contains("File not found"));
    }
}
