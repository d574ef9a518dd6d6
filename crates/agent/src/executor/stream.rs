//! Stream consumption: turn a provider chunk stream into assistant content,
//! emitting UI events along the way.

use crate::context::GuidanceQueue;
use crate::events::{AgentEvent, EventSink};
use codex::chat::ContentBlock;
use codex::provider::ChunkStream;
use codex::stream::{StopReason, StreamChunk};
use codex::{LLMError, ToolCall, Usage};
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

static PATH_IN_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""path"\s*:\s*"([^"]+)""#).unwrap());

/// Fully assembled assistant response from one stream attempt.
#[derive(Debug, Default)]
pub struct AssembledResponse {
    /// Assistant content blocks, thinking included for continuity.
    pub content: Vec<ContentBlock>,
    pub text_blocks: Vec<String>,
    pub tool_uses: Vec<ToolCall>,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
    /// Guidance arrived mid-stream; the partial response must be discarded.
    pub interrupted: bool,
    pub cancelled: bool,
}

impl AssembledResponse {
    /// Concatenated assistant-visible text.
    pub fn text(&self) -> String {
        self.text_blocks.join("\n\n")
    }
}

/// Consume a chunk stream to completion, forwarding events to the sink.
///
/// Cancellation and guidance are checked between chunks; both abort the
/// attempt with the corresponding flag set instead of erroring.
pub async fn collect_stream(
    mut stream: ChunkStream,
    sink: &Arc<dyn EventSink>,
    cancelled: &AtomicBool,
    guidance: Option<&GuidanceQueue>,
) -> Result<AssembledResponse, LLMError> {
    let mut response = AssembledResponse::default();

    let mut current_text = String::new();
    let mut current_thinking = String::new();
    let mut current_tool: Option<(String, String)> = None;
    let mut tool_json = String::new();
    let mut tool_input_bytes = 0usize;
    let mut tool_input_path = String::new();
    let mut last_delta_report = 0usize;
    let mut server_tool: Option<ContentBlock> = None;

    while let Some(chunk) = stream.next().await {
        if cancelled.load(Ordering::SeqCst) {
            response.cancelled = true;
            return Ok(response);
        }
        if let Some(guidance) = guidance {
            if guidance.interrupt_requested() {
                response.interrupted = true;
                return Ok(response);
            }
        }

        match chunk? {
            StreamChunk::ThinkingStart => {
                current_thinking.clear();
                sink.on_event(AgentEvent::ThinkingStart).await;
            }
            StreamChunk::ThinkingDelta { content } => {
                current_thinking.push_str(&content);
                sink.on_event(AgentEvent::Thinking { content }).await;
            }
            StreamChunk::ThinkingEnd { signature } => {
                response.content.push(ContentBlock::Thinking {
                    thinking: std::mem::take(&mut current_thinking),
                    signature,
                });
                sink.on_event(AgentEvent::ThinkingEnd).await;
            }
            StreamChunk::TextStart => {
                current_text.clear();
                sink.on_event(AgentEvent::TextStart).await;
            }
            StreamChunk::TextDelta { content } => {
                current_text.push_str(&content);
                sink.on_event(AgentEvent::Text { content }).await;
            }
            StreamChunk::TextEnd => {
                if !current_text.is_empty() {
                    response.text_blocks.push(current_text.clone());
                    response.content.push(ContentBlock::Text {
                        text: std::mem::take(&mut current_text),
                    });
                }
                sink.on_event(AgentEvent::TextEnd).await;
            }
            StreamChunk::ToolUseStart { id, name } => {
                current_tool = Some((id.clone(), name.clone()));
                tool_json.clear();
                tool_input_bytes = 0;
                tool_input_path.clear();
                last_delta_report = 0;
                sink.on_event(AgentEvent::ToolUseStart { id, name }).await;
            }
            StreamChunk::ToolUseInputDelta { partial_json } => {
                tool_json.push_str(&partial_json);
                tool_input_bytes += partial_json.len();
                if tool_input_path.is_empty() && tool_input_bytes < 1000 {
                    if let Some(m) = PATH_IN_JSON.captures(&tool_json) {
                        tool_input_path = m.get(1).unwrap().as_str().to_string();
                    }
                }
                // Report progress roughly every 2K of streamed input.
                if tool_input_bytes - last_delta_report >= 2000 {
                    last_delta_report = tool_input_bytes;
                    if let Some((id, _)) = &current_tool {
                        sink.on_event(AgentEvent::ToolInputDelta {
                            id: id.clone(),
                            bytes: tool_input_bytes,
                            path: tool_input_path.clone(),
                        })
                        .await;
                    }
                }
            }
            StreamChunk::ToolUseEnd => {
                if let Some((id, name)) = current_tool.take() {
                    let input: serde_json::Value =
                        serde_json::from_str(&tool_json).unwrap_or(serde_json::json!({}));
                    response.content.push(ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    sink.on_event(AgentEvent::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    })
                    .await;
                    response.tool_uses.push(ToolCall { id, name, input });
                }
            }
            StreamChunk::ServerToolUseStart { id, name, input } => {
                server_tool = Some(ContentBlock::ServerToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                sink.on_event(AgentEvent::ServerToolUse { id, name, input })
                    .await;
            }
            StreamChunk::ServerToolUseEnd => {
                if let Some(block) = server_tool.take() {
                    response.content.push(block);
                }
            }
            StreamChunk::WebSearchResult {
                tool_use_id,
                content,
            } => {
                response.content.push(ContentBlock::WebSearchToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                });
                sink.on_event(AgentEvent::WebSearchResult {
                    tool_use_id,
                    content,
                })
                .await;
            }
            StreamChunk::UsageStart { usage } => {
                response.usage.input_tokens += usage.input_tokens;
                response.usage.cache_read_tokens += usage.cache_read_tokens;
                response.usage.cache_write_tokens += usage.cache_write_tokens;
                sink.on_event(AgentEvent::UsageStart { usage }).await;
            }
            StreamChunk::MessageEnd { stop_reason, usage } => {
                response.usage.output_tokens += usage.output_tokens;
                response.stop_reason = stop_reason;
                sink.on_event(AgentEvent::MessageEnd { usage }).await;
            }
        }
    }

    // An unterminated text block still counts (stream ended abruptly but
    // without an error).
    if !current_text.is_empty() {
        response.text_blocks.push(current_text.clone());
        response.content.push(ContentBlock::Text { text: current_text });
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use crate::test_utils::{CollectingSink, MockProvider};
    use serde_json::json;

    async fn run(chunks: crate::test_utils::ScriptedStream) -> (AssembledResponse, Vec<AgentEvent>) {
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let cancelled = AtomicBool::new(false);
        let stream: ChunkStream = Box::pin(futures::stream::iter(chunks));
        let response = collect_stream(stream, &dyn_sink, &cancelled, None)
            .await
            .unwrap();
        (response, sink.events())
    }

    #[tokio::test]
    async fn assembles_text_and_tools_in_order() {
        let chunks = MockProvider::tool_turn(
            "Working on step 1",
            &[
                ("t1", "read_file", json!({"path": "src/app.py"})),
                ("t2", "shell", json!({"command": "ls"})),
            ],
        );
        let (response, events) = run(chunks).await;
        assert_eq!(response.text(), "Working on step 1");
        assert_eq!(response.tool_uses.len(), 2);
        assert_eq!(response.tool_uses[0].id, "t1");
        assert_eq!(response.tool_uses[1].name, "shell");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.input_tokens, 100);
        assert_eq!(response.usage.output_tokens, 30);
        // Content preserves block order: text before tool uses.
        assert!(matches!(response.content[0], ContentBlock::Text { .. }));
        assert!(matches!(response.content[1], ContentBlock::ToolUse { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCall { name, .. } if name == "read_file")));
    }

    #[tokio::test]
    async fn malformed_tool_json_becomes_empty_object() {
        let chunks = vec![
            Ok(StreamChunk::ToolUseStart {
                id: "t1".into(),
                name: "shell".into(),
            }),
            Ok(StreamChunk::ToolUseInputDelta {
                partial_json: "{broken".into(),
            }),
            Ok(StreamChunk::ToolUseEnd),
            Ok(StreamChunk::MessageEnd {
                stop_reason: Some(StopReason::ToolUse),
                usage: Usage::default(),
            }),
        ];
        let (response, _) = run(chunks).await;
        assert_eq!(response.tool_uses[0].input, json!({}));
    }

    #[tokio::test]
    async fn stream_error_propagates() {
        let chunks = MockProvider::failing_turn(LLMError::HttpError("connection reset".into()));
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let cancelled = AtomicBool::new(false);
        let stream: ChunkStream = Box::pin(futures::stream::iter(chunks));
        let err = collect_stream(stream, &dyn_sink, &cancelled, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn guidance_interrupt_aborts() {
        let guidance = GuidanceQueue::new();
        guidance.push("change of direction".into());
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let cancelled = AtomicBool::new(false);
        let chunks = MockProvider::text_turn("long answer");
        let stream: ChunkStream = Box::pin(futures::stream::iter(chunks));
        let response = collect_stream(stream, &dyn_sink, &cancelled, Some(&guidance))
            .await
            .unwrap();
        assert!(response.interrupted);
        assert!(response.content.is_empty());
    }

    #[tokio::test]
    async fn thinking_blocks_preserved_with_signature() {
        let chunks = vec![
            Ok(StreamChunk::ThinkingStart),
            Ok(StreamChunk::ThinkingDelta {
                content: "reasoning...".into(),
            }),
            Ok(StreamChunk::ThinkingEnd {
                signature: Some("sig-abc".into()),
            }),
            Ok(StreamChunk::TextStart),
            Ok(StreamChunk::TextDelta {
                content: "done".into(),
            }),
            Ok(StreamChunk::TextEnd),
            Ok(StreamChunk::MessageEnd {
                stop_reason: Some(StopReason::EndTurn),
                usage: Usage::default(),
            }),
        ];
        let (response, _) = run(chunks).await;
        match &response.content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                assert_eq!(thinking, "reasoning...");
                assert_eq!(signature.as_deref(), Some("sig-abc"));
            }
            other => panic!("expected thinking block, got {:?}", other),
        }
    }
}
