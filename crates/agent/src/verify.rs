//! Deterministic post-build verification: per-file lint, impacted-test
//! selection, and language-profile commands.

use crate::backend::Backend;
use crate::config::AgentConfig;
use crate::events::{AgentEvent, EventSink};
use crate::history::take_chars;
use crate::tools::{ToolContext, ToolRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// Language flags detected from the modified-file extensions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerificationProfile {
    pub python: bool,
    pub javascript: bool,
    pub typescript: bool,
    pub go: bool,
    pub rust: bool,
    pub rel_files: Vec<String>,
}

fn to_relative(path: &str, working_directory: &str) -> String {
    path.strip_prefix(working_directory)
        .map(|p| p.trim_start_matches('/').to_string())
        .unwrap_or_else(|| path.to_string())
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

/// Detect language profiles from modified files.
pub fn verification_profile(modified_abs: &[String], working_directory: &str) -> VerificationProfile {
    let mut profile = VerificationProfile::default();
    for path in modified_abs {
        let rel = to_relative(path, working_directory);
        let ext = rel.rsplit('.').next().unwrap_or("").to_lowercase();
        match ext.as_str() {
            "py" | "pyi" => profile.python = true,
            "js" | "jsx" | "mjs" => profile.javascript = true,
            "ts" | "tsx" => profile.typescript = true,
            "go" => profile.go = true,
            "rs" => profile.rust = true,
            _ => {}
        }
        profile.rel_files.push(rel);
    }
    profile
}

/// Language/framework-aware verification commands, deduplicated and capped.
pub async fn orchestrator_commands(
    backend: &Arc<dyn Backend>,
    modified_abs: &[String],
) -> Vec<String> {
    let profile = verification_profile(modified_abs, backend.working_directory());
    let rel_files: Vec<&String> = profile.rel_files.iter().take(50).collect();
    let mut commands: Vec<String> = Vec::new();

    if profile.python {
        let py_files: Vec<String> = rel_files
            .iter()
            .filter(|f| f.ends_with(".py") || f.ends_with(".pyi"))
            .take(40)
            .map(|f| shell_quote(f))
            .collect();
        if !py_files.is_empty() {
            commands.push(format!("python -m py_compile {}", py_files.join(" ")));
        }
        if backend.file_exists("pyproject.toml").await
            || backend.file_exists("ruff.toml").await
            || backend.file_exists(".ruff.toml").await
        {
            let target = if py_files.is_empty() {
                ".".to_string()
            } else {
                py_files.join(" ")
            };
            commands.push(format!("ruff check {}", target));
        } else if backend.file_exists(".flake8").await || backend.file_exists("setup.cfg").await {
            let target = if py_files.is_empty() {
                ".".to_string()
            } else {
                py_files.join(" ")
            };
            commands.push(format!("flake8 {}", target));
        }
    }

    if profile.typescript && backend.file_exists("tsconfig.json").await {
        commands.push("npx tsc --noEmit".to_string());
    }
    if (profile.javascript || profile.typescript)
        && (backend.file_exists(".eslintrc.js").await
            || backend.file_exists(".eslintrc.json").await
            || backend.file_exists("eslint.config.js").await)
    {
        let js_files: Vec<String> = rel_files
            .iter()
            .filter(|f| {
                f.ends_with(".js")
                    || f.ends_with(".jsx")
                    || f.ends_with(".mjs")
                    || f.ends_with(".ts")
                    || f.ends_with(".tsx")
            })
            .take(80)
            .map(|f| shell_quote(f))
            .collect();
        if !js_files.is_empty() {
            commands.push(format!("npx eslint {}", js_files.join(" ")));
        }
    }

    if profile.go {
        commands.push("go test ./...".to_string());
    }
    if profile.rust && backend.file_exists("Cargo.toml").await {
        commands.push("cargo test -q".to_string());
    }

    let mut seen = HashSet::new();
    commands.retain(|c| seen.insert(c.clone()));
    commands.truncate(8);
    commands
}

/// Test files discovered by naming convention next to the modified sources.
pub async fn discover_test_files(
    backend: &Arc<dyn Backend>,
    modified_abs: &[String],
) -> Vec<String> {
    let working_directory = backend.working_directory().to_string();
    let mut found = Vec::new();
    let mut seen = HashSet::new();

    for abs_path in modified_abs {
        let rel = to_relative(abs_path, &working_directory);
        let (dir, base) = match rel.rsplit_once('/') {
            Some((dir, base)) => (dir.to_string(), base.to_string()),
            None => (String::new(), rel.clone()),
        };
        let (name, ext) = match base.rsplit_once('.') {
            Some((name, ext)) => (name.to_string(), format!(".{}", ext)),
            None => (base.clone(), String::new()),
        };
        let parent = dir.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default();

        let join = |dir: &str, file: String| -> String {
            if dir.is_empty() {
                file
            } else {
                format!("{}/{}", dir, file)
            }
        };
        let mut candidates = vec![
            join(&dir, format!("test_{}{}", name, ext)),
            join(&dir, format!("{}_test{}", name, ext)),
            join(&dir, format!("{}.test{}", name, ext)),
            join(&dir, format!("{}.spec{}", name, ext)),
            join(&dir, format!("tests/test_{}{}", name, ext)),
            join(&dir, format!("test/test_{}{}", name, ext)),
            join(&dir, format!("__tests__/{}.test{}", name, ext)),
            join(&dir, format!("__tests__/{}.spec{}", name, ext)),
            join(&parent, format!("tests/test_{}{}", name, ext)),
            join(&parent, format!("test/test_{}{}", name, ext)),
        ];
        if matches!(ext.as_str(), ".ts" | ".tsx" | ".js" | ".jsx") {
            candidates.push(join(&dir, format!("__tests__/{}{}", name, ext)));
        }

        for candidate in candidates {
            if seen.contains(&candidate) {
                continue;
            }
            if backend.file_exists(&candidate).await {
                seen.insert(candidate.clone());
                found.push(candidate);
            }
        }
    }
    found
}

/// Likely impacted tests: convention-discovered files plus a grep-based
/// impact search over test roots for symbols from the modified files.
pub async fn select_impacted_tests(
    backend: &Arc<dyn Backend>,
    config: &AgentConfig,
    modified_abs: &[String],
) -> Vec<String> {
    static LINE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^:]+):").unwrap());

    let mut impacted = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for test_file in discover_test_files(backend, modified_abs).await {
        if seen.insert(test_file.clone()) {
            impacted.push(test_file);
        }
    }

    if !config.test_impact_selection_enabled {
        return impacted;
    }

    let working_directory = backend.working_directory().to_string();
    for abs_path in modified_abs.iter().take(30) {
        let rel = to_relative(abs_path, &working_directory);
        let base = rel.rsplit('/').next().unwrap_or(&rel);
        let name = base.rsplit_once('.').map(|(n, _)| n).unwrap_or(base);
        if name.is_empty() {
            continue;
        }
        let pattern = regex::escape(name);
        for root in ["tests", "test", "__tests__"] {
            if !backend.is_dir(root).await {
                continue;
            }
            let Ok(raw) = backend.search(&pattern, root, Some("*.py")).await else {
                continue;
            };
            for line in raw.lines() {
                if let Some(m) = LINE_PREFIX.captures(line) {
                    let path = m.get(1).unwrap().as_str().trim().to_string();
                    if seen.insert(path.clone()) {
                        impacted.push(path);
                    }
                }
            }
        }
    }

    impacted.truncate(40);
    impacted
}

/// Run the deterministic verification gate: per-file lint, targeted tests,
/// and profile commands. Returns `(passed, summary)`.
pub async fn run_deterministic_gate(
    backend: &Arc<dyn Backend>,
    registry: &ToolRegistry,
    ctx: &ToolContext,
    config: &AgentConfig,
    modified_abs: &[String],
    sink: &Arc<dyn EventSink>,
) -> (bool, String) {
    if modified_abs.is_empty() {
        return (true, "No modified files (or all deleted).".to_string());
    }
    let working_directory = backend.working_directory().to_string();

    let mut failures: Vec<String> = Vec::new();
    let mut checks_run: Vec<String> = Vec::new();

    // 1) Per-file lint gate.
    for (idx, abs_path) in modified_abs.iter().enumerate() {
        let rel = to_relative(abs_path, &working_directory);
        let result = registry
            .execute("lint_file", json!({"path": rel}), ctx)
            .await;
        let text = result.text();
        checks_run.push(format!("lint_file {}", rel));
        sink.on_event(AgentEvent::ToolResult {
            tool_use_id: format!("deterministic-lint-{}", idx + 1),
            tool_name: "lint_file".to_string(),
            success: result.success,
            content: text.clone(),
            duration_secs: None,
            exit_code: None,
        })
        .await;
        if !result.success {
            failures.push(format!("lint_file {}: {}", rel, take_chars(&text, 1000)));
        }
    }

    // 2) Targeted tests.
    if config.deterministic_verification_run_tests {
        let impacted: Vec<String> = select_impacted_tests(backend, config, modified_abs)
            .await
            .into_iter()
            .filter(|p| p.ends_with(".py"))
            .take(20)
            .collect();
        if !impacted.is_empty() {
            let quoted: Vec<String> = impacted.iter().map(|p| shell_quote(p)).collect();
            let command = format!("pytest -q {}", quoted.join(" "));
            let result = registry
                .execute("shell", json!({"command": command, "timeout": 180}), ctx)
                .await;
            let text = result.text();
            checks_run.push(command.clone());
            sink.on_event(AgentEvent::ToolResult {
                tool_use_id: "deterministic-tests".to_string(),
                tool_name: "shell".to_string(),
                success: result.success,
                content: text.clone(),
                duration_secs: None,
                exit_code: None,
            })
            .await;
            if !result.success {
                failures.push(format!("{}: {}", command, take_chars(&text, 1600)));
            }
        }
    }

    // 3) Language profile commands.
    if config.verification_orchestrator_enabled {
        for (idx, command) in orchestrator_commands(backend, modified_abs)
            .await
            .iter()
            .enumerate()
        {
            let result = registry
                .execute("shell", json!({"command": command, "timeout": 240}), ctx)
                .await;
            let text = result.text();
            checks_run.push(command.clone());
            sink.on_event(AgentEvent::ToolResult {
                tool_use_id: format!("verification-orchestrator-{}", idx + 1),
                tool_name: "shell".to_string(),
                success: result.success,
                content: text.clone(),
                duration_secs: None,
                exit_code: None,
            })
            .await;
            if !result.success {
                failures.push(format!("{}: {}", command, take_chars(&text, 1600)));
            }
        }
    }

    let mut summary = format!(
        "Deterministic verification checks:\n- {}",
        checks_run[..checks_run.len().min(30)].join("\n- ")
    );
    if failures.is_empty() {
        summary.push_str("\n\nAll deterministic verification checks passed.");
        (true, summary)
    } else {
        summary.push_str(&format!(
            "\n\nFailures:\n- {}",
            failures[..failures.len().min(20)].join("\n- ")
        ));
        (false, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::test_utils::CollectingSink;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<dyn Backend>) {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        (dir, backend)
    }

    #[tokio::test]
    async fn profile_commands_for_python_project() {
        let (_dir, backend) = setup().await;
        backend.write_file("pyproject.toml", "[tool.ruff]").await.unwrap();
        backend.write_file("src/app.py", "x = 1\n").await.unwrap();
        let modified = vec![backend.resolve_path("src/app.py")];
        let commands = orchestrator_commands(&backend, &modified).await;
        assert!(commands.iter().any(|c| c.starts_with("python -m py_compile")));
        assert!(commands.iter().any(|c| c.starts_with("ruff check")));
        assert!(commands.len() <= 8);
    }

    #[tokio::test]
    async fn rust_profile_runs_cargo_test() {
        let (_dir, backend) = setup().await;
        backend.write_file("Cargo.toml", "[package]").await.unwrap();
        backend.write_file("src/lib.rs", "").await.unwrap();
        let modified = vec![backend.resolve_path("src/lib.rs")];
        let commands = orchestrator_commands(&backend, &modified).await;
        assert_eq!(commands, vec!["cargo test -q"]);
    }

    #[tokio::test]
    async fn discovers_convention_tests() {
        let (_dir, backend) = setup().await;
        backend.write_file("pkg/mod.py", "def f(): pass\n").await.unwrap();
        backend
            .write_file("pkg/tests/test_mod.py", "def test_f(): pass\n")
            .await
            .unwrap();
        let modified = vec![backend.resolve_path("pkg/mod.py")];
        let tests = discover_test_files(&backend, &modified).await;
        assert_eq!(tests, vec!["pkg/tests/test_mod.py"]);
    }

    #[tokio::test]
    async fn impact_search_finds_referencing_tests() {
        let (_dir, backend) = setup().await;
        backend
            .write_file("src/widget.py", "def widget(): pass\n")
            .await
            .unwrap();
        backend
            .write_file("tests/test_other.py", "from src.widget import widget\n")
            .await
            .unwrap();
        let config = AgentConfig::default();
        let modified = vec![backend.resolve_path("src/widget.py")];
        let impacted = select_impacted_tests(&backend, &config, &modified).await;
        assert!(impacted.iter().any(|t| t.contains("test_other.py")));
    }

    #[tokio::test]
    async fn gate_passes_clean_project_and_reports_failures() {
        let (_dir, backend) = setup().await;
        backend.write_file("ok.sh", "echo fine\n").await.unwrap();
        let registry = ToolRegistry::builtin();
        let ctx = ToolContext::new(backend.clone());
        let config = AgentConfig {
            deterministic_verification_run_tests: false,
            verification_orchestrator_enabled: false,
            ..AgentConfig::default()
        };
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let modified = vec![backend.resolve_path("ok.sh")];
        let (ok, summary) =
            run_deterministic_gate(&backend, &registry, &ctx, &config, &modified, &dyn_sink).await;
        assert!(ok, "{}", summary);
        assert!(summary.contains("All deterministic verification checks passed."));

        // A broken file fails the gate with the lint failure in the summary.
        backend.write_file("bad.sh", "if then fi\n").await.unwrap();
        let modified = vec![backend.resolve_path("bad.sh")];
        let (ok, summary) =
            run_deterministic_gate(&backend, &registry, &ctx, &config, &modified, &dyn_sink).await;
        assert!(!ok);
        assert!(summary.contains("Failures:"));
        assert!(summary.contains("lint_file bad.sh"));
    }
}
