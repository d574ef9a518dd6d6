//! Agent events and the event sink contract.
//!
//! Every externally observable step of a run is an [`AgentEvent`] delivered
//! in order to a caller-supplied [`EventSink`]. The kind set is closed; the
//! front-end switches on `type` after serde serialization.

use crate::context::TodoItem;
use crate::decompose::Phase;
use async_trait::async_trait;
use codex::Usage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // ── stream lifecycle ────────────────────────────────────────────
    ThinkingStart,
    Thinking {
        content: String,
    },
    ThinkingEnd,
    TextStart,
    Text {
        content: String,
    },
    TextEnd,
    ToolUseStart {
        id: String,
        name: String,
    },
    /// Periodic progress while tool input JSON streams in.
    ToolInputDelta {
        id: String,
        bytes: usize,
        path: String,
    },
    /// A complete tool invocation was parsed from the stream.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        success: bool,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    ToolRejected {
        tool_use_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        policy_blocked: bool,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    WebSearchResult {
        tool_use_id: String,
        content: Value,
    },
    UsageStart {
        usage: Usage,
    },
    MessageEnd {
        usage: Usage,
    },
    StreamRetry {
        content: String,
        attempt: usize,
        max_retries: usize,
    },
    StreamRecovering {
        content: String,
    },
    StreamFailed {
        content: String,
    },

    // ── phase lifecycle ─────────────────────────────────────────────
    PhaseStart {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        strategy: Option<String>,
    },
    PhaseEnd {
        name: String,
    },
    PhasePlan {
        steps: Vec<String>,
        plan_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        plan_file: Option<String>,
        plan_title: String,
        decomposition: Vec<Phase>,
    },
    ScoutStart {
        content: String,
    },
    ScoutProgress {
        content: String,
    },
    ScoutEnd {
        content: String,
    },
    UpdatedPlan {
        plan_text: String,
    },

    // ── progress ────────────────────────────────────────────────────
    PlanStepProgress {
        step: usize,
        total: usize,
    },
    TodosUpdated {
        todos: Vec<TodoItem>,
    },
    CheckpointCreated {
        checkpoint_id: String,
        label: String,
    },
    AutoApproved {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        policy_reason: Option<String>,
    },
    ContextClarification {
        content: String,
    },
    GuidanceQueued,
    GuidanceApplied {
        content: String,
    },
    GuidanceInterrupt {
        content: String,
    },
    StrategyEscalation {
        content: String,
    },
    ErrorRecovery {
        content: String,
    },
    ErrorRecoverySuccess {
        content: String,
    },
    ErrorRecoveryPartial {
        content: String,
    },
    AutoFixSuccess {
        content: String,
    },
    VerificationStage {
        stage: String,
        content: String,
    },
    VerificationPlan {
        strategy: String,
        files_to_verify: usize,
        cached: usize,
    },
    CommandStart {
        tool_use_id: String,
        command: String,
    },
    CommandOutput {
        tool_use_id: String,
        chunk: String,
        is_stderr: bool,
    },
    CommandPartialFailure {
        tool_use_id: String,
    },
    Done {
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        context_usage_pct: u32,
    },
    Cancelled,
    Error {
        message: String,
    },
}

/// Receives events in order on the executor task.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: AgentEvent);
}

/// Sink that drops everything. Useful for sub-loops that run silent.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn on_event(&self, _event: AgentEvent) {}
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn on_event(&self, event: AgentEvent) {
        (**self).on_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_tag() {
        let event = AgentEvent::ToolRejected {
            tool_use_id: "t1".into(),
            tool_name: "shell".into(),
            reason: Some("destructive".into()),
            policy_blocked: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_rejected");
        assert_eq!(json["policy_blocked"], true);

        let done = AgentEvent::Done {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 0,
            context_usage_pct: 3,
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
    }
}
