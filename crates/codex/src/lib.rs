//! Core LLM abstraction for the codex agent runtime.
//!
//! This crate defines the data model shared between the orchestration kernel
//! and any LLM transport: chat messages made of typed content blocks, tool
//! definitions, streaming events, generation parameters, and the
//! [`LlmProvider`] trait that transports implement. It deliberately contains
//! no networking — transports live behind the trait.

pub mod cache;
pub mod chat;
pub mod error;
pub mod model;
pub mod provider;
pub mod stream;

pub use chat::{ContentBlock, ImageSource, Message, MessageContent, Role, ToolDefinition};
pub use error::LLMError;
pub use provider::{ChunkStream, Completion, EmbeddingKind, GenerationConfig, LlmProvider};
pub use stream::{StopReason, StreamChunk};

use serde::{Deserialize, Serialize};

/// A parsed tool invocation emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Token accounting for a single request or a whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_tokens: 50,
            cache_write_tokens: 0,
        });
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 0,
            cache_write_tokens: 7,
        });
        assert_eq!(total.input_tokens, 110);
        assert_eq!(total.output_tokens, 25);
        assert_eq!(total.cache_read_tokens, 50);
        assert_eq!(total.cache_write_tokens, 7);
        assert_eq!(total.total(), 135);
    }
}
