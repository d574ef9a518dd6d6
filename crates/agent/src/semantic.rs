//! Capability interface to the external codebase embedding index.
//!
//! The kernel never builds or stores embeddings itself; it consumes whatever
//! implementation the host wires in.

use crate::error::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One retrieval hit from the semantic index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticHit {
    pub path: String,
    pub score: f32,
    pub snippet: String,
}

/// Semantic code retrieval over the project.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SemanticHit>, AgentError>;

    /// Invalidation hook for file mutations; default is a no-op for indexes
    /// that watch the filesystem themselves.
    async fn notify_file_changed(&self, path: &str) {
        let _ = path;
    }
}
