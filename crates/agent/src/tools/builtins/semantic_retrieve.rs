//! Semantic retrieval tool over the external index capability.

use crate::tools::{Tool, ToolContext, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

pub struct SemanticRetrieveTool;

#[async_trait]
impl Tool for SemanticRetrieveTool {
    fn name(&self) -> &str {
        "semantic_retrieve"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Semantic search over the codebase: returns the most relevant \
             code snippets for a natural-language query.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "k": {"type": "integer", "default": 8}
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let query = match require_str(&input, "query") {
            Ok(q) => q,
            Err(e) => return e,
        };
        let k = input
            .get("k")
            .and_then(Value::as_u64)
            .map(|v| v.clamp(1, 20) as usize)
            .unwrap_or(8);

        let Some(index) = ctx.semantic_index.as_ref() else {
            return ToolResult::ok(
                "Semantic index not available — use search/glob/project_tree instead.",
            );
        };
        match index.retrieve(query, k).await {
            Ok(hits) if hits.is_empty() => {
                ToolResult::ok(format!("No semantic matches for: {}", query))
            }
            Ok(hits) => {
                let rendered: Vec<String> = hits
                    .iter()
                    .map(|h| format!("── {} (score {:.2}) ──\n{}", h.path, h.score, h.snippet))
                    .collect();
                ToolResult::ok(rendered.join("\n\n"))
            }
            Err(e) => ToolResult::err(format!("Semantic retrieval failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::error::AgentError;
    use crate::semantic::{SemanticHit, SemanticIndex};
    use std::sync::Arc;

    struct FixedIndex;

    #[async_trait]
    impl SemanticIndex for FixedIndex {
        async fn retrieve(&self, _query: &str, _k: usize) -> Result<Vec<SemanticHit>, AgentError> {
            Ok(vec![SemanticHit {
                path: "src/auth.rs".into(),
                score: 0.91,
                snippet: "fn login() {}".into(),
            }])
        }
    }

    #[tokio::test]
    async fn renders_hits() {
        let ctx = ToolContext::new(Arc::new(LocalBackend::new(".")))
            .with_semantic_index(Some(Arc::new(FixedIndex)));
        let result = SemanticRetrieveTool
            .execute(json!({"query": "login flow"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("src/auth.rs"));
        assert!(result.output.contains("0.91"));
    }

    #[tokio::test]
    async fn degrades_without_index() {
        let ctx = ToolContext::new(Arc::new(LocalBackend::new(".")));
        let result = SemanticRetrieveTool
            .execute(json!({"query": "anything"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("not available"));
    }
}
