//! Tool registry: typed catalog and dispatch.

use super::{Tool, ToolContext, ToolKind, ToolResult, special};
use codex::ToolDefinition;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Catalog of tools keyed by name, with classification used by the dispatcher.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with the full built-in tool set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for tool in super::builtins::all() {
            registry.add(tool);
        }
        registry
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions for every registered tool plus the state-backed specials
    /// (todo/memory) that the executor handles inline.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition()).collect();
        defs.extend(special::state_tool_definitions());
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions restricted to safe tools, for the scout and plan sub-loops.
    pub fn safe_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| t.kind() == ToolKind::Safe)
            .map(|t| t.definition())
            .collect();
        defs.extend(special::state_tool_definitions());
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Classification for a named tool. Unknown names are treated as
    /// commands, the most restrictive class.
    pub fn kind_of(&self, name: &str) -> ToolKind {
        if special::is_state_tool(name) || name == special::ASK_USER_QUESTION {
            return ToolKind::Safe;
        }
        self.tools
            .get(name)
            .map(|t| t.kind())
            .unwrap_or(ToolKind::Command)
    }

    pub async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) => tool.execute(input, ctx).await,
            None => ToolResult::err(format!("Unknown tool: {}", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_classifies() {
        let registry = ToolRegistry::builtin();
        assert_eq!(registry.kind_of("read_file"), ToolKind::Safe);
        assert_eq!(registry.kind_of("edit_file"), ToolKind::FileMutating);
        assert_eq!(registry.kind_of("write_file"), ToolKind::FileMutating);
        assert_eq!(registry.kind_of("shell"), ToolKind::Command);
        assert_eq!(registry.kind_of("TodoWrite"), ToolKind::Safe);
        assert_eq!(registry.kind_of("nonexistent"), ToolKind::Command);
    }

    #[test]
    fn definitions_include_state_tools() {
        let registry = ToolRegistry::builtin();
        let names: Vec<String> = registry.definitions().iter().map(|d| d.name.clone()).collect();
        assert!(names.contains(&"read_file".to_string()));
        assert!(names.contains(&"TodoWrite".to_string()));
        assert!(names.contains(&"MemoryRead".to_string()));
        // Mutating tools must not leak into the safe set.
        let safe: Vec<String> = registry
            .safe_definitions()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert!(!safe.contains(&"edit_file".to_string()));
        assert!(!safe.contains(&"shell".to_string()));
        assert!(safe.contains(&"search".to_string()));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let backend = Arc::new(crate::backend::LocalBackend::new("."));
        let ctx = ToolContext::new(backend);
        let result = registry
            .execute("nope", serde_json::json!({}), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.text().contains("Unknown tool"));
    }
}
