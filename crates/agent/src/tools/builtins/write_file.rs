//! File write tool: full overwrite with a compact diff report.

use super::helpers::compact_diff;
use crate::tools::{Tool, ToolContext, ToolKind, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Create a new file or completely overwrite an existing one. \
             Prefer edit_file for targeted changes to existing files.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
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
        let content = match input.get("content").and_then(Value::as_str) {
            Some(c) => c,
            None => return ToolResult::err("content is required"),
        };

        let old_content = if ctx.backend.file_exists(path).await {
            ctx.backend.read_file(path).await.ok()
        } else {
            None
        };
        let is_new = old_content.is_none();

        if let Err(e) = ctx.backend.write_file(path, content).await {
            return ToolResult::err(format!("Failed to write {}: {}", path, e));
        }

        let line_count = content.lines().count();
        let summary = format!(
            "{} {} lines to {}",
            if is_new { "Created" } else { "Wrote" },
            line_count,
            path
        );

        if is_new {
            let preview: Vec<&str> = content.lines().take(30).collect();
            let mut diff_text = format!(
                "--- /dev/null\n+++ {}\n@@ -0,0 +1,{} @@\n",
                path,
                preview.len()
            );
            diff_text.push_str(
                &preview
                    .iter()
                    .map(|l| format!("+{}", l))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
            if line_count > 30 {
                diff_text.push_str(&format!("\n+... ({} more lines)", line_count - 30));
            }
            return ToolResult::ok(format!("{}\n{}", summary, diff_text));
        }

        let diff_text = compact_diff(old_content.as_deref().unwrap_or(""), content, path, 60);
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

    #[tokio::test]
    async fn create_reports_preview() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        let ctx = ToolContext::new(backend.clone());
        let result = WriteFileTool
            .execute(json!({"path": "new.txt", "content": "one\ntwo"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("Created 2 lines"));
        assert!(result.output.contains("+one"));
        assert_eq!(backend.read_file("new.txt").await.unwrap(), "one\ntwo");
    }

    #[tokio::test]
    async fn overwrite_reports_diff() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("f.txt", "old line\n").await.unwrap();
        let ctx = ToolContext::new(backend);
        let result = WriteFileTool
            .execute(json!({"path": "f.txt", "content": "new line\n"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("Wrote 1 lines"));
        assert!(result.output.contains("-old line"));
        assert!(result.output.contains("+new line"));
    }
}
