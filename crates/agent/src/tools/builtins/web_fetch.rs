//! Web fetch tool.
//!
//! Provider-side web search is surfaced through `server_tool_use` stream
//! events instead; this tool covers direct URL fetches.

use crate::tools::{Tool, ToolContext, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};
use std::time::Duration;

const MAX_BODY_CHARS: usize = 30_000;

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("codex-agent/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Fetch a URL and return its body as text (truncated at 30K characters).",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"}
                },
                "required": ["url"]
            }),
        )
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
        let url = match require_str(&input, "url") {
            Ok(u) => u,
            Err(e) => return e,
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::err("url must be http(s)");
        }
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) => {
                        let truncated = if body.len() > MAX_BODY_CHARS {
                            let end = body
                                .char_indices()
                                .nth(MAX_BODY_CHARS)
                                .map(|(i, _)| i)
                                .unwrap_or(body.len());
                            format!("{}\n... (truncated)", &body[..end])
                        } else {
                            body
                        };
                        if status.is_success() {
                            ToolResult::ok(truncated)
                        } else {
                            ToolResult::err(format!("HTTP {}: {}", status, truncated))
                        }
                    }
                    Err(e) => ToolResult::err(format!("Failed to read body: {}", e)),
                }
            }
            Err(e) => ToolResult::err(format!("Fetch failed: {}", e)),
        }
    }
}
