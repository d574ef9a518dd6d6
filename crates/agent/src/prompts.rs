//! System prompt composition and project context loading.

use crate::backend::Backend;
use log::debug;
use std::sync::Arc;

const PROJECT_RULES_MAX_CHARS: usize = 8_000;
const PROJECT_DOCS_MAX_CHARS: usize = 50_000;

/// Detect the project's primary language from repo markers.
pub async fn detect_project_language(backend: &Arc<dyn Backend>) -> String {
    if backend.file_exists("Cargo.toml").await {
        return "rust".to_string();
    }
    if backend.file_exists("go.mod").await {
        return "go".to_string();
    }
    if backend.file_exists("tsconfig.json").await {
        return "typescript".to_string();
    }
    if backend.file_exists("package.json").await {
        return "javascript".to_string();
    }
    if backend.file_exists("pyproject.toml").await
        || backend.file_exists("setup.py").await
        || backend.file_exists("requirements.txt").await
    {
        return "python".to_string();
    }
    "unknown".to_string()
}

/// Phase of operation a system prompt is composed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPhase {
    Direct,
    Scout,
    Plan,
    Build,
}

/// Compose the base system prompt for a phase.
pub fn compose_system_prompt(
    phase: PromptPhase,
    working_directory: &str,
    tool_names: &[String],
    language: &str,
    complexity: Option<&str>,
) -> String {
    let tools = tool_names.join(", ");
    let header = format!(
        "You are a coding agent working in {} (primary language: {}).\n\
         Available tools: {}.",
        working_directory, language, tools
    );
    let body = match phase {
        PromptPhase::Direct => {
            "Complete the user's task by reading, editing, and verifying code. \
             Batch independent tool calls in one response. Make surgical edits, \
             run lint_file after every change, and verify before finishing."
        }
        PromptPhase::Scout => {
            "You are a fast scout. Gather just enough codebase context for the \
             task: project structure, the most relevant files, key conventions. \
             Batch tool calls, keep reads targeted, and finish quickly with a \
             concise context summary."
        }
        PromptPhase::Plan => {
            "Produce an implementation plan as a markdown document: an H1 title, \
             a short Why/Approach, a '## Steps' section of numbered steps each \
             naming exact file paths in backticks, and a verification section. \
             Read only what you need; do not modify anything."
        }
        PromptPhase::Build => {
            "Execute the approved plan step by step. State which step you are on, \
             keep edits surgical, lint after each change, track progress with \
             TodoWrite, and verify everything before finishing."
        }
    };
    let mut prompt = format!("{}\n\n{}", header, body);
    if let Some(complexity) = complexity {
        if complexity == "high" && phase == PromptPhase::Plan {
            prompt.push_str(
                "\n\nThis is a high-complexity task: the plan needs multiple \
                 steps with exact file paths and explicit verification steps.",
            );
        }
    }
    prompt
}

async fn append_capped(
    backend: &Arc<dyn Backend>,
    path: &str,
    label: &str,
    parts: &mut Vec<String>,
    total: &mut usize,
    cap: usize,
) {
    if *total >= cap {
        return;
    }
    if !backend.file_exists(path).await {
        return;
    }
    match backend.read_file(path).await {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return;
            }
            let chunk = format!("=== {} ===\n{}", label, trimmed);
            let take = chunk.len().min(cap - *total);
            parts.push(chunk[..take].to_string());
            *total += take;
        }
        Err(e) => debug!("could not load {}: {}", path, e),
    }
}

/// Load project rule files (`.cursorrules`, `CLAUDE.md`, ...) for the system
/// prompt, capped at 8K characters.
pub async fn load_project_rules(backend: &Arc<dyn Backend>) -> String {
    let mut parts = Vec::new();
    let mut total = 0;
    let cap = PROJECT_RULES_MAX_CHARS;

    for path in [
        ".cursorrules",
        "RULE.md",
        "CLAUDE.md",
        ".claude/CLAUDE.md",
        ".cursor/RULE.md",
    ] {
        append_capped(backend, path, path, &mut parts, &mut total, cap).await;
    }

    if backend.is_dir(".cursor/rules").await {
        if let Ok(entries) = backend.list_dir(".cursor/rules").await {
            for entry in entries {
                if total >= cap {
                    break;
                }
                if entry.entry_type == "file"
                    && (entry.name.ends_with(".md") || entry.name.ends_with(".mdc"))
                {
                    let path = format!(".cursor/rules/{}", entry.name);
                    append_capped(backend, &path, &path, &mut parts, &mut total, cap).await;
                }
            }
        }
    }

    parts.join("\n\n")
}

/// Load `project-docs/` plus key root docs for first-message context, capped
/// at 50K characters.
pub async fn load_project_docs(backend: &Arc<dyn Backend>) -> String {
    let mut parts = Vec::new();
    let mut total = 0;
    let cap = PROJECT_DOCS_MAX_CHARS;

    let doc_names = [
        "overview.md",
        "tech-specs.md",
        "requirements.md",
        "index.md",
        "README.md",
    ];
    for name in doc_names {
        let path = format!("project-docs/{}", name);
        append_capped(backend, &path, &path, &mut parts, &mut total, cap).await;
    }
    append_capped(backend, "README.md", "README.md", &mut parts, &mut total, cap).await;
    append_capped(
        backend,
        "CONTRIBUTING.md",
        "CONTRIBUTING.md",
        &mut parts,
        &mut total,
        cap,
    )
    .await;

    if backend.is_dir("project-docs").await {
        if let Ok(entries) = backend.list_dir("project-docs").await {
            let mut names: Vec<String> = entries
                .iter()
                .filter(|e| e.entry_type == "file")
                .map(|e| e.name.clone())
                .collect();
            names.sort();
            for name in names {
                let lower = name.to_lowercase();
                if !(lower.ends_with(".md") || lower.ends_with(".mdx") || lower.ends_with(".txt")) {
                    continue;
                }
                if doc_names.contains(&name.as_str()) {
                    continue;
                }
                let path = format!("project-docs/{}", name);
                append_capped(backend, &path, &path, &mut parts, &mut total, cap).await;
            }
        }
    }

    parts.join("\n\n")
}
