//! Shell command tool.

use super::helpers::shape_command_output;
use crate::tools::{Tool, ToolContext, ToolKind, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

const OUTPUT_CAP: usize = 20_000;

pub struct ShellTool;

impl ShellTool {
    /// Format captured command output the way the model sees it: stderr
    /// labelled, non-zero exits prefixed, and the whole thing capped.
    pub fn format_output(stdout: &str, stderr: &str, exit_code: i32) -> String {
        let mut parts = Vec::new();
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        if !stderr.is_empty() {
            parts.push(format!("[stderr]\n{}", stderr));
        }
        let mut output = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };
        if exit_code != 0 {
            output = format!("[exit code: {}]\n{}", exit_code, output);
        }
        shape_command_output(&output, OUTPUT_CAP)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Run a shell command in the working directory. Output is captured \
             and truncated around 20K characters; long-running commands are \
             killed at the timeout.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout": {
                        "type": "integer",
                        "description": "Seconds before the command is killed (default 30, max 300)"
                    }
                },
                "required": ["command"]
            }),
        )
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Command
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let command = match require_str(&input, "command") {
            Ok(c) => c,
            Err(e) => return e,
        };
        let timeout = ctx.clamp_timeout(input.get("timeout").and_then(Value::as_u64));

        match ctx.backend.run_command(command, ".", timeout).await {
            Ok(result) => {
                let output =
                    Self::format_output(&result.stdout, &result.stderr, result.exit_code);
                if result.exit_code == 0 {
                    ToolResult::ok(output)
                } else {
                    ToolResult {
                        success: false,
                        output: output.clone(),
                        error: Some(output),
                    }
                }
            }
            Err(e) => ToolResult::err(format!("Command failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn output_formatting() {
        assert_eq!(ShellTool::format_output("", "", 0), "(no output)");
        assert_eq!(ShellTool::format_output("hi\n", "", 0), "hi\n");
        let failed = ShellTool::format_output("out", "oops", 2);
        assert!(failed.starts_with("[exit code: 2]"));
        assert!(failed.contains("[stderr]\noops"));
    }

    #[tokio::test]
    async fn runs_and_reports_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::new(Arc::new(LocalBackend::new(dir.path())));
        let ok = ShellTool
            .execute(json!({"command": "echo hello"}), &ctx)
            .await;
        assert!(ok.success);
        assert!(ok.output.contains("hello"));

        let fail = ShellTool
            .execute(json!({"command": "exit 7"}), &ctx)
            .await;
        assert!(!fail.success);
        assert!(fail.text().contains("[exit code: 7]"));
    }
}
