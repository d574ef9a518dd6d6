//! Per-file lint tool.
//!
//! Picks a cheap syntax-level checker by extension. Files with no configured
//! checker pass with an explicit note, so the auto-lint hook after writes
//! never fails a build for an unknown language.

use crate::tools::{Tool, ToolContext, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

pub struct LintTool;

impl LintTool {
    fn shell_quote(path: &str) -> String {
        format!("'{}'", path.replace('\'', "'\\''"))
    }

    /// The checker command for a file, if one applies.
    fn command_for(path: &str) -> Option<String> {
        let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
        let quoted = Self::shell_quote(path);
        match ext.as_str() {
            "py" | "pyi" => Some(format!("python -m py_compile {}", quoted)),
            "js" | "mjs" | "cjs" => Some(format!("node --check {}", quoted)),
            "json" => Some(format!("python -m json.tool {} > /dev/null", quoted)),
            "sh" | "bash" => Some(format!("sh -n {}", quoted)),
            "yaml" | "yml" => Some(format!(
                "python -c \"import yaml,sys; yaml.safe_load(open(sys.argv[1]))\" {}",
                quoted
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl Tool for LintTool {
    fn name(&self) -> &str {
        "lint_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Run a fast syntax check on one file. Run this after every edit \
             and fix reported errors before moving on.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
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
        if !ctx.backend.file_exists(path).await {
            return ToolResult::err(format!("File not found: {}", path));
        }
        let Some(command) = Self::command_for(path) else {
            return ToolResult::ok(format!(
                "No issues found (no linter configured for {})",
                path
            ));
        };
        match ctx
            .backend
            .run_command(&command, ".", ctx.default_timeout)
            .await
        {
            Ok(result) if result.success() => {
                ToolResult::ok(format!("No issues found in {}", path))
            }
            Ok(result) => {
                let detail = if result.stderr.trim().is_empty() {
                    result.stdout
                } else {
                    result.stderr
                };
                ToolResult {
                    success: false,
                    output: String::new(),
                    error: Some(format!("Lint errors in {}:\n{}", path, detail.trim())),
                }
            }
            Err(e) => ToolResult::err(format!("Lint command failed: {}", e)),
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
    fn commands_by_extension() {
        assert!(LintTool::command_for("a.py").unwrap().contains("py_compile"));
        assert!(LintTool::command_for("a.sh").unwrap().starts_with("sh -n"));
        assert!(LintTool::command_for("a.rs").is_none());
    }

    #[tokio::test]
    async fn unknown_language_passes() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("x.rs", "fn main() {}\n").await.unwrap();
        let ctx = ToolContext::new(backend);
        let result = LintTool.execute(json!({"path": "x.rs"}), &ctx).await;
        assert!(result.success);
        assert!(result.output.contains("No issues found"));
    }

    #[tokio::test]
    async fn bad_shell_script_fails() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("x.sh", "if then fi\n").await.unwrap();
        let ctx = ToolContext::new(backend);
        let result = LintTool.execute(json!({"path": "x.sh"}), &ctx).await;
        assert!(!result.success);
        assert!(result.text().contains("Lint errors in x.sh"));
    }
}
