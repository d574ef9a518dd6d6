//! The coding agent executor: owns the transcript, snapshots, and context
//! state, and drives the agentic loop.

mod agent_loop;
mod build;
mod dispatch;
pub mod stream;

pub use build::RunOptions;
pub use stream::{AssembledResponse, collect_stream};

use crate::backend::Backend;
use crate::config::AgentConfig;
use crate::context::ContextState;
use crate::decompose::TaskComplexity;
use crate::events::{AgentEvent, EventSink};
use crate::history::HistoryManager;
use crate::plan::Plan;
use crate::semantic::SemanticIndex;
use crate::snapshot::SnapshotStore;
use crate::tools::{ToolContext, ToolRegistry};
use codex::chat::Message;
use codex::model as model_caps;
use codex::provider::{AdaptiveEffort, GenerationConfig};
use codex::{LlmProvider, Usage};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Phases with distinct sampling profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Scout,
    Plan,
    Build,
    Verify,
}

static STEP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:step|working on step|executing step|starting step)\s+(\d+)").unwrap()
});

/// The agent orchestration kernel for one project session.
///
/// Exclusively owns its history, snapshot store, and context state; the
/// backend is shared and may outlive a run.
pub struct CodingAgent {
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) registry: ToolRegistry,
    pub(crate) config: AgentConfig,
    pub(crate) history_manager: HistoryManager,

    pub history: Vec<Message>,
    pub(crate) system_prompt: String,
    pub(crate) max_iterations: usize,
    pub(crate) cancelled: Arc<AtomicBool>,

    pub(crate) snapshots: SnapshotStore,
    pub(crate) state: ContextState,
    pub(crate) usage: Usage,

    /// Read cache keyed by `backend_id \0 resolved_path`.
    pub(crate) file_cache: HashMap<String, String>,
    pub(crate) consecutive_stream_errors: u32,
    pub(crate) last_stream_error_sig: String,

    pub(crate) detected_language: String,
    pub(crate) task_complexity: TaskComplexity,
    pub(crate) current_plan: Option<Plan>,
    pub(crate) plan_step_index: usize,
    pub(crate) scout_context: Option<String>,
    pub(crate) plan_context_summary: String,
    pub(crate) phase_summaries: Vec<String>,
    pub(crate) deterministic_verification_done: bool,
    pub(crate) verification_gate_attempts: u32,
    pub(crate) reasoning_trace_repairs: u32,

    pub(crate) semantic_index: Option<Arc<dyn SemanticIndex>>,
}

impl CodingAgent {
    pub async fn new(
        provider: Arc<dyn LlmProvider>,
        backend: Arc<dyn Backend>,
        config: AgentConfig,
    ) -> Self {
        let detected_language = crate::prompts::detect_project_language(&backend).await;
        let registry = ToolRegistry::builtin();
        let system_prompt = crate::prompts::compose_system_prompt(
            crate::prompts::PromptPhase::Direct,
            backend.working_directory(),
            &registry.names(),
            &detected_language,
            None,
        );
        let context_window = model_caps::context_window(provider.model_id());
        let history_manager = HistoryManager::new(context_window, config.fast_model.clone());
        let max_iterations = config.max_iterations;

        Self {
            provider,
            backend,
            registry,
            config,
            history_manager,
            history: Vec::new(),
            system_prompt,
            max_iterations,
            cancelled: Arc::new(AtomicBool::new(false)),
            snapshots: SnapshotStore::new(),
            state: ContextState::new(),
            usage: Usage::default(),
            file_cache: HashMap::new(),
            consecutive_stream_errors: 0,
            last_stream_error_sig: String::new(),
            detected_language,
            task_complexity: TaskComplexity::Low,
            current_plan: None,
            plan_step_index: 0,
            scout_context: None,
            plan_context_summary: String::new(),
            phase_summaries: Vec::new(),
            deterministic_verification_done: false,
            verification_gate_attempts: 0,
            reasoning_trace_repairs: 0,
            semantic_index: None,
        }
    }

    pub fn with_semantic_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.semantic_index = Some(index);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.current_plan.as_ref()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn history_manager(&self) -> &HistoryManager {
        &self.history_manager
    }

    /// A cancel handle that can be sent to another task.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Cancel the current run and kill any child command.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.backend.cancel_running_command().await;
    }

    /// Thread-safe: queue user guidance for injection at the next safe point
    /// and interrupt any in-flight stream.
    pub fn inject_guidance(&self, text: impl Into<String>) {
        self.state.guidance.push(text.into());
    }

    /// Revert every file modified this run.
    pub async fn revert_all(&mut self) -> Vec<String> {
        self.file_cache.clear();
        self.snapshots.revert_all(&self.backend).await
    }

    pub fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    /// Revert to the state captured at a plan-step checkpoint.
    pub async fn revert_to_step(&mut self, step: usize) -> Vec<String> {
        self.file_cache.clear();
        let reverted = self.snapshots.revert_to_step(&self.backend, step).await;
        if !reverted.is_empty() {
            self.plan_step_index = step;
        }
        reverted
    }

    /// Restore files from a session checkpoint.
    pub async fn rewind_to_checkpoint(&mut self, checkpoint_id: &str) -> Vec<String> {
        self.file_cache.clear();
        self.snapshots
            .rewind_to_checkpoint(&self.backend, checkpoint_id)
            .await
    }

    /// Reset conversation history and all per-run state.
    pub fn reset(&mut self) {
        self.history.clear();
        self.cancelled.store(false, Ordering::SeqCst);
        self.state.reset();
        self.snapshots.clear();
        self.usage = Usage::default();
        self.file_cache.clear();
        self.consecutive_stream_errors = 0;
        self.last_stream_error_sig = String::new();
        self.current_plan = None;
        self.plan_step_index = 0;
        self.scout_context = None;
        self.plan_context_summary = String::new();
        self.phase_summaries.clear();
        self.deterministic_verification_done = false;
        self.verification_gate_attempts = 0;
        self.reasoning_trace_repairs = 0;
        self.task_complexity = TaskComplexity::Low;
    }

    // ── caches ──────────────────────────────────────────────────────

    pub(crate) fn file_cache_key(&self, path: &str) -> String {
        format!(
            "{}\u{0}{}",
            self.backend.backend_id(),
            self.backend.resolve_path(path)
        )
    }

    pub(crate) fn invalidate_file_cache(&mut self, path: &str) {
        let key = self.file_cache_key(path);
        self.file_cache.remove(&key);
    }

    // ── prompts ─────────────────────────────────────────────────────

    /// System prompt with dynamic sections: project rules, learned failure
    /// patterns, current todos, and situational reminders.
    pub(crate) async fn effective_system_prompt(&mut self, base: &str) -> String {
        let mut prompt = base.to_string();

        let rules = crate::prompts::load_project_rules(&self.backend).await;
        if !rules.is_empty() {
            prompt.push_str(&format!(
                "\n\n<project_rules>\nThese project-specific rules MUST be followed:\n\n{}\n</project_rules>",
                rules
            ));
        }

        if self.config.learning_loop_enabled {
            let learned = self.state.failure_patterns_prompt(&self.backend).await;
            if !learned.is_empty() {
                prompt.push_str(&format!(
                    "\n\n<known_failure_patterns>\n{}\n</known_failure_patterns>",
                    learned
                ));
            }
        }

        if !self.state.todos.is_empty() {
            let mut lines = vec![
                "<current_todos>".to_string(),
                "Your task checklist (update with TodoWrite as you progress):".to_string(),
            ];
            for todo in &self.state.todos {
                lines.push(format!("  [{}] {}", todo.status, todo.content.trim()));
            }
            lines.push("</current_todos>".to_string());
            prompt.push_str(&format!("\n\n{}", lines.join("\n")));
        }

        let plan_total = self
            .current_plan
            .as_ref()
            .map(|p| p.steps.len())
            .unwrap_or(0);
        let tracked = self.snapshots.tracked_paths();
        let mut modified = 0usize;
        let mut new_files = 0usize;
        for path in &tracked {
            if self.backend.file_exists(path).await {
                modified += 1;
            } else {
                new_files += 1;
            }
        }
        let reminders = self.state.gather_system_reminders(
            plan_total,
            self.plan_step_index,
            modified,
            new_files,
            self.usage.input_tokens,
        );
        if !reminders.is_empty() {
            let rendered: Vec<String> = reminders.iter().map(|r| format!("- {}", r)).collect();
            prompt.push_str(&format!(
                "\n\n<system_reminders>\n{}\n</system_reminders>",
                rendered.join("\n")
            ));
        }

        prompt
    }

    // ── plan step tracking ──────────────────────────────────────────

    /// Parse assistant text for plan step references; on transition, capture
    /// a step checkpoint and return the new step number.
    pub(crate) async fn detect_plan_step(&mut self, text: &str) -> Option<usize> {
        let plan_len = self.current_plan.as_ref()?.steps.len();
        let head = crate::history::take_chars(text, 500);
        let matches: Vec<usize> = STEP_RE
            .captures_iter(head)
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<usize>().ok()))
            .collect();
        let step = *matches.last()?;
        if step < 1 || step > plan_len {
            return None;
        }
        let old = self.plan_step_index;
        if step != old {
            self.plan_step_index = step;
            self.snapshots
                .capture_step_checkpoint(&self.backend, old)
                .await;
            debug!("plan step transition {} -> {}", old, step);
            return Some(step);
        }
        None
    }

    // ── generation configs ──────────────────────────────────────────

    pub(crate) fn default_generation_config(&self) -> GenerationConfig {
        let model_id = self.provider.model_id();
        let supports_thinking = model_caps::supports_thinking(model_id);
        GenerationConfig {
            max_tokens: model_caps::default_max_tokens(model_id),
            enable_thinking: supports_thinking,
            thinking_budget: if supports_thinking { 16_000 } else { 0 },
            ..GenerationConfig::default()
        }
    }

    /// Phase-specific sampling: scouts run hot and cheap, planning and
    /// building cool down, verification maxes reasoning effort.
    pub(crate) fn generation_config_for_phase(
        &self,
        phase: GenerationPhase,
        base: Option<&GenerationConfig>,
    ) -> GenerationConfig {
        let mut config = base.cloned().unwrap_or_else(|| self.default_generation_config());
        let model_id = self.provider.model_id();
        let supports_thinking = model_caps::supports_thinking(model_id);
        let supports_adaptive = model_caps::supports_adaptive_thinking(model_id);

        match phase {
            GenerationPhase::Scout => {
                config.temperature = Some(0.8);
                config.top_p = Some(0.9);
                config.enable_thinking = false;
                config.thinking_budget = 0;
            }
            GenerationPhase::Plan => {
                config.temperature = Some(0.3);
                config.top_p = Some(0.9);
                config.enable_thinking = supports_thinking;
                if supports_adaptive {
                    config.adaptive_effort = AdaptiveEffort::High;
                }
            }
            GenerationPhase::Build => {
                config.temperature = Some(0.1);
                config.top_p = Some(0.95);
                config.enable_thinking = supports_thinking;
                if supports_adaptive {
                    config.adaptive_effort = AdaptiveEffort::High;
                }
            }
            GenerationPhase::Verify => {
                config.temperature = Some(0.1);
                config.top_p = Some(0.95);
                config.enable_thinking = supports_thinking;
                if supports_thinking {
                    let cap = model_caps::thinking_max_budget(model_id);
                    config.thinking_budget =
                        ((config.thinking_budget as f64 * 1.2) as u32).min(cap);
                }
                if supports_adaptive {
                    config.adaptive_effort = AdaptiveEffort::Max;
                }
            }
        }
        config
    }

    pub(crate) fn tool_context(&self) -> ToolContext {
        ToolContext::new(self.backend.clone()).with_semantic_index(self.semantic_index.clone())
    }

    pub(crate) async fn emit(&self, sink: &Arc<dyn EventSink>, event: AgentEvent) {
        sink.on_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::test_utils::MockProvider;
    use tempfile::TempDir;

    async fn agent(dir: &TempDir) -> CodingAgent {
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        CodingAgent::new(provider, backend, AgentConfig::default()).await
    }

    #[tokio::test]
    async fn plan_step_detection_and_checkpointing() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent(&dir).await;
        agent.current_plan = Some(Plan {
            steps: vec!["1. a".into(), "2. b".into(), "3. c".into()],
            ..Plan::default()
        });

        assert_eq!(agent.detect_plan_step("Working on step 2 now").await, Some(2));
        assert_eq!(agent.plan_step_index, 2);
        // Same step again is not a transition.
        assert_eq!(agent.detect_plan_step("still step 2").await, None);
        // Out-of-range references are ignored.
        assert_eq!(agent.detect_plan_step("step 9 next").await, None);
    }

    #[tokio::test]
    async fn phase_configs_differ() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let scout = agent.generation_config_for_phase(GenerationPhase::Scout, None);
        assert_eq!(scout.temperature, Some(0.8));
        assert!(!scout.enable_thinking);
        let build = agent.generation_config_for_phase(GenerationPhase::Build, None);
        assert_eq!(build.temperature, Some(0.1));
    }

    #[tokio::test]
    async fn effective_prompt_includes_todos_and_rules() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent(&dir).await;
        agent
            .backend
            .write_file("CLAUDE.md", "Use tabs.")
            .await
            .unwrap();
        agent
            .state
            .set_todos(&[serde_json::json!({"content": "do x", "status": "pending"})]);
        let prompt = agent.effective_system_prompt("BASE").await;
        assert!(prompt.starts_with("BASE"));
        assert!(prompt.contains("<project_rules>"));
        assert!(prompt.contains("Use tabs."));
        assert!(prompt.contains("<current_todos>"));
        assert!(prompt.contains("[pending] do x"));
        assert!(prompt.contains("<system_reminders>"));
    }
}
