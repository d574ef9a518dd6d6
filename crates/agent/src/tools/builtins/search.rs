//! Safe discovery tools: regex search, glob, directory listing, and the
//! project tree.

use crate::tools::{Tool, ToolContext, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use serde_json::{Value, json};

pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Regex search across the project. Returns path:line:text matches.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "Directory to search under (default: project root)"},
                    "include": {"type": "string", "description": "Filename glob filter, e.g. *.rs"}
                },
                "required": ["pattern"]
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let pattern = match require_str(&input, "pattern") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = input.get("path").and_then(Value::as_str).unwrap_or(".");
        let include = input.get("include").and_then(Value::as_str);

        match ctx.backend.search(pattern, path, include).await {
            Ok(output) if output.trim().is_empty() => {
                ToolResult::ok(format!("No matches for pattern: {}", pattern))
            }
            Ok(output) => {
                let lines: Vec<&str> = output.lines().collect();
                if lines.len() > 200 {
                    let kept = lines[..200].join("\n");
                    ToolResult::ok(format!(
                        "{}\n  ... ({} more matches) ...",
                        kept,
                        lines.len() - 200
                    ))
                } else {
                    ToolResult::ok(output)
                }
            }
            Err(e) => ToolResult::err(format!("Search failed: {}", e)),
        }
    }
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Find files by glob pattern, e.g. src/**/*.rs.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"}
                },
                "required": ["pattern"]
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let pattern = match require_str(&input, "pattern") {
            Ok(p) => p,
            Err(e) => return e,
        };
        match ctx.backend.glob_find(pattern).await {
            Ok(files) if files.is_empty() => {
                ToolResult::ok(format!("No files match: {}", pattern))
            }
            Ok(files) => {
                let total = files.len();
                let mut shown: Vec<String> = files.into_iter().take(500).collect();
                if total > 500 {
                    shown.push(format!("  ... ({} more files) ...", total - 500));
                }
                ToolResult::ok(shown.join("\n"))
            }
            Err(e) => ToolResult::err(format!("Glob failed: {}", e)),
        }
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "List the entries of one directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "default": "."}
                }
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let path = input.get("path").and_then(Value::as_str).unwrap_or(".");
        match ctx.backend.list_dir(path).await {
            Ok(entries) if entries.is_empty() => ToolResult::ok("(empty directory)"),
            Ok(entries) => {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| {
                        if e.entry_type == "dir" {
                            format!("{}/", e.name)
                        } else {
                            match e.size {
                                Some(size) => format!("{} ({} bytes)", e.name, size),
                                None => e.name.clone(),
                            }
                        }
                    })
                    .collect();
                ToolResult::ok(lines.join("\n"))
            }
            Err(e) => ToolResult::err(format!("Failed to list {}: {}", path, e)),
        }
    }
}

pub struct ProjectTreeTool;

impl ProjectTreeTool {
    const SKIP_DIRS: &'static [&'static str] = &[
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "__pycache__",
        ".venv",
        "venv",
        ".idea",
        ".vscode",
    ];

    async fn render(
        ctx: &ToolContext,
        path: &str,
        prefix: &str,
        depth: usize,
        out: &mut String,
        budget: &mut usize,
    ) {
        if depth == 0 || *budget == 0 {
            return;
        }
        let Ok(entries) = ctx.backend.list_dir(path).await else {
            return;
        };
        for entry in entries {
            if *budget == 0 {
                out.push_str(&format!("{}...\n", prefix));
                return;
            }
            if entry.name.starts_with('.') && entry.entry_type == "dir" {
                continue;
            }
            if Self::SKIP_DIRS.contains(&entry.name.as_str()) {
                continue;
            }
            *budget -= 1;
            let child = if path == "." {
                entry.name.clone()
            } else {
                format!("{}/{}", path, entry.name)
            };
            if entry.entry_type == "dir" {
                out.push_str(&format!("{}{}/\n", prefix, entry.name));
                Box::pin(Self::render(
                    ctx,
                    &child,
                    &format!("{}  ", prefix),
                    depth - 1,
                    out,
                    budget,
                ))
                .await;
            } else {
                out.push_str(&format!("{}{}\n", prefix, entry.name));
            }
        }
    }
}

#[async_trait]
impl Tool for ProjectTreeTool {
    fn name(&self) -> &str {
        "project_tree"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Render the project directory tree (build artifacts and VCS \
             internals are skipped).",
            json!({
                "type": "object",
                "properties": {
                    "max_depth": {"type": "integer", "default": 4}
                }
            }),
        )
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let depth = input
            .get("max_depth")
            .and_then(Value::as_u64)
            .map(|d| d.clamp(1, 8) as usize)
            .unwrap_or(4);
        let mut out = String::from(".\n");
        let mut budget = 400usize;
        Self::render(ctx, ".", "  ", depth, &mut out, &mut budget).await;
        ToolResult::ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn project() -> (TempDir, ToolContext) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("src/main.rs", "fn main() {}\n").await.unwrap();
        backend.write_file("src/lib.rs", "pub fn x() {}\n").await.unwrap();
        backend
            .write_file("node_modules/junk.js", "ignored")
            .await
            .unwrap();
        (dir, ToolContext::new(backend))
    }

    #[tokio::test]
    async fn search_reports_matches_and_empties() {
        let (_dir, ctx) = project().await;
        let hit = SearchTool
            .execute(json!({"pattern": "fn main", "include": "*.rs"}), &ctx)
            .await;
        assert!(hit.success);
        assert!(hit.output.contains("src/main.rs:1"));

        let miss = SearchTool
            .execute(json!({"pattern": "zzz_absent"}), &ctx)
            .await;
        assert!(miss.success);
        assert!(miss.output.contains("No matches"));
    }

    #[tokio::test]
    async fn glob_lists_files() {
        let (_dir, ctx) = project().await;
        let result = GlobTool
            .execute(json!({"pattern": "src/*.rs"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.output.contains("src/lib.rs"));
        assert!(result.output.contains("src/main.rs"));
    }

    #[tokio::test]
    async fn tree_skips_node_modules() {
        let (_dir, ctx) = project().await;
        let result = ProjectTreeTool.execute(json!({}), &ctx).await;
        assert!(result.success);
        assert!(result.output.contains("src/"));
        assert!(result.output.contains("main.rs"));
        assert!(!result.output.contains("node_modules"));
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let (_dir, ctx) = project().await;
        let result = ListDirTool.execute(json!({"path": "."}), &ctx).await;
        assert!(result.success);
        assert!(result.output.contains("src/"));
    }
}
