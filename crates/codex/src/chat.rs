//! Chat data model: roles, content blocks, messages, and tool definitions.
//!
//! Messages are the unit of conversation history. A message's content is
//! either a plain string or an ordered list of typed blocks; both shapes
//! round-trip through serde so persisted sessions deserialize unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Base64 image payload attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// One typed block inside a structured message.
///
/// Walkers over history match exhaustively on this enum; an unknown variant
/// in persisted data is a structural fault, not something to skip silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        /// Opaque continuity signature; must be echoed back verbatim.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Image {
        source: ImageSource,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    WebSearchToolResult {
        tool_use_id: String,
        content: Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Message content: a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Blocks view of the content; a bare string yields an empty slice.
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    pub fn blocks_mut(&mut self) -> Option<&mut Vec<ContentBlock>> {
        match &mut self.content {
            MessageContent::Blocks(blocks) => Some(blocks),
            MessageContent::Text(_) => None,
        }
    }

    /// All tool_use blocks in this message, in order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.blocks()
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect()
    }

    /// Ids of tool_use blocks in this message.
    pub fn tool_use_ids(&self) -> Vec<String> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ids answered by tool_result blocks in this message.
    pub fn tool_result_ids(&self) -> Vec<String> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content (string content or text blocks).
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                parts.join(" ")
            }
        }
    }

    /// True if any block in this message is a tool_result.
    pub fn has_tool_results(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

/// A tool the model may invoke via structured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_and_block_content_round_trip() {
        let plain = Message::user("hello");
        let json = serde_json::to_value(&plain).unwrap();
        assert_eq!(json["content"], json!("hello"));
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, plain);

        let structured = Message::assistant(vec![
            ContentBlock::Thinking {
                thinking: "hmm".into(),
                signature: Some("sig".into()),
            },
            ContentBlock::text("done"),
        ]);
        let json = serde_json::to_value(&structured).unwrap();
        assert_eq!(json["content"][0]["type"], "thinking");
        assert_eq!(json["content"][0]["signature"], "sig");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, structured);
    }

    #[test]
    fn tool_use_and_result_ids() {
        let assistant = Message::assistant(vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "read_file".into(),
            input: json!({"path": "a.rs"}),
        }]);
        assert_eq!(assistant.tool_use_ids(), vec!["t1"]);

        let user = Message::user(vec![ContentBlock::tool_result("t1", "ok")]);
        assert_eq!(user.tool_result_ids(), vec!["t1"]);
        assert!(user.has_tool_results());
    }

    #[test]
    fn is_error_omitted_when_false() {
        let ok = ContentBlock::tool_result("t1", "fine");
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("is_error").is_none());

        let err = ContentBlock::error_result("t1", "boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["is_error"], json!(true));
    }

    #[test]
    fn text_joins_blocks() {
        let msg = Message::assistant(vec![
            ContentBlock::text("first"),
            ContentBlock::ToolUse {
                id: "x".into(),
                name: "shell".into(),
                input: json!({}),
            },
            ContentBlock::text("second"),
        ]);
        assert_eq!(msg.text(), "first second");
    }
}
