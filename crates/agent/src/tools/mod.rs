//! Tool trait, execution context, and result types.

pub mod builtins;
pub mod registry;
pub mod special;

pub use registry::ToolRegistry;

use crate::backend::Backend;
use crate::semantic::SemanticIndex;
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Result of a tool execution, as fed back to the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// The text to place into the tool_result block.
    pub fn text(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            self.error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string())
        }
    }
}

/// Dispatch class of a tool. Policy may only tighten this, never loosen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Read-only: parallelizable, never needs approval.
    Safe,
    /// Mutates files: parallel across distinct files, serial per file.
    FileMutating,
    /// Runs commands: always serial, always subject to policy.
    Command,
}

/// Context handed to tools at execution time.
#[derive(Clone)]
pub struct ToolContext {
    pub backend: Arc<dyn Backend>,
    pub working_directory: String,
    pub default_timeout: Duration,
    pub timeout_cap: Duration,
    pub semantic_index: Option<Arc<dyn SemanticIndex>>,
}

impl ToolContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let working_directory = backend.working_directory().to_string();
        Self {
            backend,
            working_directory,
            default_timeout: Duration::from_secs(30),
            timeout_cap: Duration::from_secs(300),
            semantic_index: None,
        }
    }

    pub fn with_semantic_index(mut self, index: Option<Arc<dyn SemanticIndex>>) -> Self {
        self.semantic_index = index;
        self
    }

    /// Clamp a caller-supplied timeout (seconds) into the allowed range.
    pub fn clamp_timeout(&self, requested: Option<u64>) -> Duration {
        match requested {
            Some(secs) if secs > 0 => self.timeout_cap.min(Duration::from_secs(secs)),
            _ => self.default_timeout,
        }
    }
}

/// A named, typed capability the model invokes via structured output.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    fn kind(&self) -> ToolKind {
        ToolKind::Safe
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// Required-string input helper shared by the builtins.
pub(crate) fn require_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolResult> {
    match input.get(key).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ToolResult::err(format!("{} is required", key))),
    }
}
