//! Test doubles: a scripted LLM provider and an event-collecting sink.

use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use async_trait::async_trait;
use codex::chat::{Message, ToolDefinition};
use codex::provider::{ChunkStream, Completion, GenerationConfig};
use codex::stream::{StopReason, StreamChunk};
use codex::{LLMError, LlmProvider, ToolCall, Usage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One scripted stream attempt: the chunks (or errors) it yields in order.
pub type ScriptedStream = Vec<Result<StreamChunk, LLMError>>;

/// Provider whose stream and generate responses are scripted in advance.
///
/// Each `stream` call pops the next scripted attempt; when the script is
/// exhausted it returns a bare end-of-turn. `generate` pops scripted
/// completions, falling back to a fixed text.
pub struct MockProvider {
    model_id: String,
    streams: Mutex<VecDeque<ScriptedStream>>,
    completions: Mutex<VecDeque<Completion>>,
    default_completion_text: String,
    /// (system, message_count) per stream call, for assertions.
    pub stream_calls: Mutex<Vec<(String, usize)>>,
}

impl MockProvider {
    pub fn empty() -> Self {
        Self {
            model_id: "mock-model".to_string(),
            streams: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            default_completion_text: String::new(),
            stream_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_completion_text(text: impl Into<String>) -> Self {
        let mut provider = Self::empty();
        provider.default_completion_text = text.into();
        provider
    }

    pub fn push_stream(&self, chunks: ScriptedStream) {
        self.streams.lock().push_back(chunks);
    }

    pub fn push_completion(&self, completion: Completion) {
        self.completions.lock().push_back(completion);
    }

    /// A plain text assistant turn ending the conversation.
    pub fn text_turn(text: &str) -> ScriptedStream {
        vec![
            Ok(StreamChunk::UsageStart {
                usage: Usage {
                    input_tokens: 100,
                    ..Usage::default()
                },
            }),
            Ok(StreamChunk::TextStart),
            Ok(StreamChunk::TextDelta {
                content: text.to_string(),
            }),
            Ok(StreamChunk::TextEnd),
            Ok(StreamChunk::MessageEnd {
                stop_reason: Some(StopReason::EndTurn),
                usage: Usage {
                    output_tokens: 50,
                    ..Usage::default()
                },
            }),
        ]
    }

    /// An assistant turn requesting tool calls.
    pub fn tool_turn(text: &str, calls: &[(&str, &str, serde_json::Value)]) -> ScriptedStream {
        let mut chunks = vec![
            Ok(StreamChunk::UsageStart {
                usage: Usage {
                    input_tokens: 100,
                    ..Usage::default()
                },
            }),
        ];
        if !text.is_empty() {
            chunks.push(Ok(StreamChunk::TextStart));
            chunks.push(Ok(StreamChunk::TextDelta {
                content: text.to_string(),
            }));
            chunks.push(Ok(StreamChunk::TextEnd));
        }
        for (id, name, input) in calls {
            chunks.push(Ok(StreamChunk::ToolUseStart {
                id: id.to_string(),
                name: name.to_string(),
            }));
            chunks.push(Ok(StreamChunk::ToolUseInputDelta {
                partial_json: input.to_string(),
            }));
            chunks.push(Ok(StreamChunk::ToolUseEnd));
        }
        chunks.push(Ok(StreamChunk::MessageEnd {
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage {
                output_tokens: 30,
                ..Usage::default()
            },
        }));
        chunks
    }

    /// A stream attempt that fails mid-way with the given error.
    pub fn failing_turn(error: LLMError) -> ScriptedStream {
        vec![
            Ok(StreamChunk::UsageStart {
                usage: Usage {
                    input_tokens: 100,
                    ..Usage::default()
                },
            }),
            Ok(StreamChunk::TextStart),
            Ok(StreamChunk::TextDelta {
                content: "partial".to_string(),
            }),
            Err(error),
        ]
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream(
        &self,
        messages: &[Message],
        system: &str,
        _tools: Option<&[ToolDefinition]>,
        _model_id: Option<&str>,
        _config: &GenerationConfig,
    ) -> Result<ChunkStream, LLMError> {
        self.stream_calls
            .lock()
            .push((system.to_string(), messages.len()));
        let scripted = self.streams.lock().pop_front().unwrap_or_else(|| {
            vec![
                Ok(StreamChunk::TextStart),
                Ok(StreamChunk::TextDelta {
                    content: "The task is complete.".to_string(),
                }),
                Ok(StreamChunk::TextEnd),
                Ok(StreamChunk::MessageEnd {
                    stop_reason: Some(StopReason::EndTurn),
                    usage: Usage::default(),
                }),
            ]
        });
        Ok(Box::pin(futures::stream::iter(scripted)))
    }

    async fn generate(
        &self,
        _messages: &[Message],
        _system: &str,
        _tools: Option<&[ToolDefinition]>,
        _model_id: Option<&str>,
        _config: &GenerationConfig,
    ) -> Result<Completion, LLMError> {
        if let Some(completion) = self.completions.lock().pop_front() {
            return Ok(completion);
        }
        Ok(Completion {
            content: self.default_completion_text.clone(),
            thinking: None,
            tool_calls: Vec::<ToolCall>::new(),
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
        })
    }
}

/// Sink that records every event for assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<AgentEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().clone()
    }

    pub fn count_done(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, AgentEvent::Done { .. }))
            .count()
    }

    pub fn count_cancelled(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, AgentEvent::Cancelled))
            .count()
    }

    pub fn count_errors(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, AgentEvent::Error { .. }))
            .count()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn on_event(&self, event: AgentEvent) {
        self.events.lock().push(event);
    }
}

/// Question handler returning a fixed answer.
pub struct StaticAnswer(pub String);

#[async_trait]
impl crate::callbacks::QuestionHandler for StaticAnswer {
    async fn request_answer(
        &self,
        _question: &str,
        _context: &str,
        _tool_use_id: &str,
        _options: Option<Vec<String>>,
    ) -> Result<String, AgentError> {
        Ok(self.0.clone())
    }
}
