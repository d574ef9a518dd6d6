//! Caller-supplied callback interfaces: approval and clarifying questions.
//!
//! Both are awaited on the executor task; the dispatcher applies the
//! question deadline.

use crate::error::AgentError;
use async_trait::async_trait;

/// Approves or rejects a proposed mutating operation.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(
        &self,
        tool_name: &str,
        description: &str,
        input: &serde_json::Value,
    ) -> bool;
}

/// Answers a clarifying question from the model.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    async fn request_answer(
        &self,
        question: &str,
        context: &str,
        tool_use_id: &str,
        options: Option<Vec<String>>,
    ) -> Result<String, AgentError>;
}

/// Approves everything. For YOLO runs and tests.
pub struct ApproveAll;

#[async_trait]
impl ApprovalHandler for ApproveAll {
    async fn request_approval(&self, _tool: &str, _description: &str, _input: &serde_json::Value) -> bool {
        true
    }
}

/// Rejects everything.
pub struct DenyAll;

#[async_trait]
impl ApprovalHandler for DenyAll {
    async fn request_approval(&self, _tool: &str, _description: &str, _input: &serde_json::Value) -> bool {
        false
    }
}
