//! Streaming events produced by an LLM provider.

use crate::Usage;
use serde::{Deserialize, Serialize};

/// Why a model ended its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Length,
    StopSequence,
    #[serde(other)]
    Other,
}

impl StopReason {
    /// True when the response was cut off by an output-length limit.
    pub fn is_token_cutoff(&self) -> bool {
        matches!(self, StopReason::MaxTokens | StopReason::Length)
    }
}

/// One event from a streaming chat response.
///
/// Events for a single content block arrive contiguously: a `*Start`, zero or
/// more deltas, then the matching `*End`. Blocks never interleave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    ThinkingStart,
    ThinkingDelta {
        content: String,
    },
    ThinkingEnd {
        /// Continuity signature to be preserved verbatim in the next request.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    TextStart,
    TextDelta {
        content: String,
    },
    TextEnd,
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolUseInputDelta {
        partial_json: String,
    },
    ToolUseEnd,
    /// A provider-executed tool invocation (e.g. server-side web search).
    ServerToolUseStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ServerToolUseEnd,
    WebSearchResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    /// Input-side token accounting, emitted once near the start of the stream.
    UsageStart {
        usage: Usage,
    },
    /// Final event: output tokens and the stop reason.
    MessageEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
        usage: Usage,
    },
}
