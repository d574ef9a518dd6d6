//! Agent configuration.
//!
//! Every knob here can be set through the environment (`CODEX_*` variables),
//! which is how the CLI and the web front-end configure the kernel without
//! linking against it twice.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Runtime configuration for the agent kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Stream recovery
    pub stream_max_retries: usize,
    /// Base for exponential backoff between stream retries, in seconds.
    pub stream_retry_backoff_base: f64,

    // Scout sub-loop
    pub scout_enabled: bool,
    pub scout_max_iterations: usize,
    pub scout_model: String,
    /// Fast model for classification, summarization, and worker lanes.
    pub fast_model: String,

    // Plan phase
    pub plan_phase_enabled: bool,
    pub task_refinement_enabled: bool,

    // Completion gates
    pub enforce_reasoning_trace: bool,
    pub deterministic_verification_gate: bool,
    pub deterministic_verification_run_tests: bool,
    pub verification_orchestrator_enabled: bool,

    // Review and policy
    pub human_review_mode: bool,
    pub policy_engine_enabled: bool,
    pub block_destructive_commands: bool,
    pub auto_approve_commands: bool,

    // Learning
    pub learning_loop_enabled: bool,

    // Manager-workers
    pub parallel_subagents_enabled: bool,
    pub parallel_subagents_max_workers: usize,

    // Command execution
    pub live_command_streaming: bool,
    pub session_checkpoints_enabled: bool,

    // Verification targeting
    pub test_impact_selection_enabled: bool,

    // Semantic index
    pub codebase_index_enabled: bool,
    pub embedding_model_id: String,

    // Loop bounds
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stream_max_retries: 3,
            stream_retry_backoff_base: 2.0,
            scout_enabled: true,
            scout_max_iterations: 8,
            scout_model: "us.anthropic.claude-haiku-4-5-20251001-v1:0".to_string(),
            fast_model: "us.anthropic.claude-sonnet-4-20250514-v1:0".to_string(),
            plan_phase_enabled: true,
            task_refinement_enabled: false,
            enforce_reasoning_trace: true,
            deterministic_verification_gate: true,
            deterministic_verification_run_tests: true,
            verification_orchestrator_enabled: true,
            human_review_mode: false,
            policy_engine_enabled: true,
            block_destructive_commands: true,
            auto_approve_commands: false,
            learning_loop_enabled: true,
            parallel_subagents_enabled: true,
            parallel_subagents_max_workers: 3,
            live_command_streaming: true,
            session_checkpoints_enabled: true,
            test_impact_selection_enabled: true,
            codebase_index_enabled: true,
            embedding_model_id: "cohere.embed-english-v3".to_string(),
            max_iterations: 200,
        }
    }
}

impl AgentConfig {
    /// Build a config from `CODEX_*` environment variables, falling back to
    /// the defaults above for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stream_max_retries: env_usize("CODEX_STREAM_MAX_RETRIES", d.stream_max_retries),
            stream_retry_backoff_base: env_f64(
                "CODEX_STREAM_RETRY_BACKOFF",
                d.stream_retry_backoff_base,
            ),
            scout_enabled: env_bool("CODEX_SCOUT_ENABLED", d.scout_enabled),
            scout_max_iterations: env_usize("CODEX_SCOUT_MAX_ITERATIONS", d.scout_max_iterations),
            scout_model: env_string("CODEX_SCOUT_MODEL", &d.scout_model),
            fast_model: env_string("CODEX_FAST_MODEL", &d.fast_model),
            plan_phase_enabled: env_bool("CODEX_PLAN_PHASE_ENABLED", d.plan_phase_enabled),
            task_refinement_enabled: env_bool(
                "CODEX_TASK_REFINEMENT_ENABLED",
                d.task_refinement_enabled,
            ),
            enforce_reasoning_trace: env_bool(
                "CODEX_ENFORCE_REASONING_TRACE",
                d.enforce_reasoning_trace,
            ),
            deterministic_verification_gate: env_bool(
                "CODEX_DETERMINISTIC_VERIFICATION_GATE",
                d.deterministic_verification_gate,
            ),
            deterministic_verification_run_tests: env_bool(
                "CODEX_DETERMINISTIC_VERIFICATION_RUN_TESTS",
                d.deterministic_verification_run_tests,
            ),
            verification_orchestrator_enabled: env_bool(
                "CODEX_VERIFICATION_ORCHESTRATOR_ENABLED",
                d.verification_orchestrator_enabled,
            ),
            human_review_mode: env_bool("CODEX_HUMAN_REVIEW_MODE", d.human_review_mode),
            policy_engine_enabled: env_bool("CODEX_POLICY_ENGINE_ENABLED", d.policy_engine_enabled),
            block_destructive_commands: env_bool(
                "CODEX_BLOCK_DESTRUCTIVE_COMMANDS",
                d.block_destructive_commands,
            ),
            auto_approve_commands: env_bool(
                "CODEX_AUTO_APPROVE_COMMANDS",
                d.auto_approve_commands,
            ),
            learning_loop_enabled: env_bool("CODEX_LEARNING_LOOP_ENABLED", d.learning_loop_enabled),
            parallel_subagents_enabled: env_bool(
                "CODEX_PARALLEL_SUBAGENTS_ENABLED",
                d.parallel_subagents_enabled,
            ),
            parallel_subagents_max_workers: env_usize(
                "CODEX_PARALLEL_SUBAGENTS_MAX_WORKERS",
                d.parallel_subagents_max_workers,
            ),
            live_command_streaming: env_bool(
                "CODEX_LIVE_COMMAND_STREAMING",
                d.live_command_streaming,
            ),
            session_checkpoints_enabled: env_bool(
                "CODEX_SESSION_CHECKPOINTS_ENABLED",
                d.session_checkpoints_enabled,
            ),
            test_impact_selection_enabled: env_bool(
                "CODEX_TEST_IMPACT_SELECTION_ENABLED",
                d.test_impact_selection_enabled,
            ),
            codebase_index_enabled: env_bool(
                "CODEX_CODEBASE_INDEX_ENABLED",
                d.codebase_index_enabled,
            ),
            embedding_model_id: env_string("CODEX_EMBEDDING_MODEL_ID", &d.embedding_model_id),
            max_iterations: env_usize("CODEX_MAX_TOOL_ITERATIONS", d.max_iterations),
        }
    }

    /// Default per-command timeout.
    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Hard cap on any caller-supplied command timeout.
    pub fn command_timeout_cap(&self) -> Duration {
        Duration::from_secs(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let c = AgentConfig::default();
        assert_eq!(c.stream_max_retries, 3);
        assert!(c.deterministic_verification_gate);
        assert!(c.block_destructive_commands);
        assert!(!c.auto_approve_commands);
        assert_eq!(c.parallel_subagents_max_workers, 3);
        assert_eq!(c.default_command_timeout(), Duration::from_secs(30));
        assert_eq!(c.command_timeout_cap(), Duration::from_secs(300));
    }
}
