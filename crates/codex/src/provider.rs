//! The provider trait: request/stream abstraction over an LLM transport.

use crate::chat::{Message, ToolDefinition};
use crate::error::LLMError;
use crate::stream::{StopReason, StreamChunk};
use crate::{ToolCall, Usage};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Boxed stream of chat events.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>;

/// Reasoning effort for adaptive thinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptiveEffort {
    Low,
    Medium,
    #[default]
    High,
    Max,
}

impl std::fmt::Display for AdaptiveEffort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdaptiveEffort::Low => "low",
            AdaptiveEffort::Medium => "medium",
            AdaptiveEffort::High => "high",
            AdaptiveEffort::Max => "max",
        };
        write!(f, "{}", s)
    }
}

/// Sampling and reasoning parameters for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Provider routing hint, e.g. "cross-region".
    pub throughput_mode: String,
    pub enable_thinking: bool,
    pub thinking_budget: u32,
    /// Adaptive (effort-based) thinking instead of a fixed budget.
    #[serde(default)]
    pub adaptive: bool,
    #[serde(default)]
    pub adaptive_effort: AdaptiveEffort,
    /// Whether thinking deltas should be forwarded on the stream.
    #[serde(default = "default_true")]
    pub stream_thinking: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            throughput_mode: "cross-region".to_string(),
            enable_thinking: false,
            thinking_budget: 0,
            adaptive: false,
            adaptive_effort: AdaptiveEffort::default(),
            stream_thinking: true,
        }
    }
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

/// What the embedding is for; providers may prefix-tune per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Document,
    Query,
}

/// Request/stream abstraction over an LLM transport.
///
/// Implementations MUST apply prompt caching at up to three breakpoints when
/// the underlying provider supports it: the system prompt, the last tool
/// schema, and the most recent stable user message (see [`crate::cache`]).
/// Thinking blocks and their continuity signatures must be passed through to
/// the next request verbatim.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// The default model id used when a call passes `model_id: None`.
    fn model_id(&self) -> &str;

    /// Streaming chat. `model_id` overrides the default model for this call.
    async fn stream(
        &self,
        messages: &[Message],
        system: &str,
        tools: Option<&[ToolDefinition]>,
        model_id: Option<&str>,
        config: &GenerationConfig,
    ) -> Result<ChunkStream, LLMError>;

    /// One-shot completion for classifier/summarizer calls.
    async fn generate(
        &self,
        messages: &[Message],
        system: &str,
        tools: Option<&[ToolDefinition]>,
        model_id: Option<&str>,
        config: &GenerationConfig,
    ) -> Result<Completion, LLMError>;

    /// Embed texts for the semantic index. Default: unsupported.
    async fn embed(
        &self,
        texts: &[String],
        kind: EmbeddingKind,
    ) -> Result<Vec<Vec<f32>>, LLMError> {
        let _ = (texts, kind);
        Err(LLMError::NotImplemented(
            "embeddings not supported by this provider".into(),
        ))
    }
}
