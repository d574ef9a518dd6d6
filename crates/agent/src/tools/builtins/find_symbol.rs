//! Symbol definition lookup (read-only).

use crate::tools::{Tool, ToolContext, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

pub struct FindSymbolTool;

impl FindSymbolTool {
    /// Definition-anchored search pattern across the languages we meet.
    fn definition_pattern(symbol: &str) -> String {
        let sym = regex::escape(symbol);
        format!(
            r"(def|class|fn|struct|enum|trait|impl|function|interface|type|const|let|var)\s+{}\b",
            sym
        )
    }
}

#[async_trait]
impl Tool for FindSymbolTool {
    fn name(&self) -> &str {
        "find_symbol"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Find where a function, class, or type is defined. Returns \
             path:line matches for definition sites.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "path": {"type": "string", "description": "Directory to search under (default: project root)"}
                },
                "required": ["symbol"]
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let symbol = match require_str(&input, "symbol") {
            Ok(s) => s.trim(),
            Err(e) => return e,
        };
        let path = input.get("path").and_then(Value::as_str).unwrap_or(".");
        let pattern = Self::definition_pattern(symbol);

        match ctx.backend.search(&pattern, path, None).await {
            Ok(output) if output.trim().is_empty() => {
                ToolResult::ok(format!("No definition found for: {}", symbol))
            }
            Ok(output) => {
                let lines: Vec<&str> = output.lines().take(50).collect();
                ToolResult::ok(lines.join("\n"))
            }
            Err(e) => ToolResult::err(format!("Symbol search failed: {}", e)),
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
    async fn finds_definition_site() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend
            .write_file("m.py", "def handler():\n    handler_count = 1\n")
            .await
            .unwrap();
        let ctx = ToolContext::new(backend);
        let result = FindSymbolTool
            .execute(json!({"symbol": "handler"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("m.py:1"));
        // The usage line must not count as a definition.
        assert!(!result.output.contains("m.py:2"));
    }
}
