//! Agent orchestration kernel: an interactive coding agent runtime driving
//! an LLM through a tool-using loop over a local or SSH project directory.
//!
//! The pipeline is intent → (scout) → (plan) → decompose → build → verify;
//! every stage emits [`events::AgentEvent`]s to a caller-supplied sink and is
//! re-entered through the same [`executor::CodingAgent`] loop.

pub mod backend;
pub mod callbacks;
pub mod config;
pub mod context;
pub mod decompose;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod intent;
pub mod plan;
pub mod planning;
pub mod policy;
pub mod prompts;
pub mod scout;
pub mod semantic;
pub mod session;
pub mod snapshot;
pub mod tools;
pub mod verify;

pub mod test_utils;

pub use backend::{Backend, LocalBackend, SshBackend, SshTarget};
pub use callbacks::{ApprovalHandler, ApproveAll, DenyAll, QuestionHandler};
pub use config::AgentConfig;
pub use context::{ContextState, GuidanceQueue, TodoItem};
pub use decompose::{Phase, PhaseType, Strategy, TaskComplexity};
pub use error::{AgentError, BackendError};
pub use events::{AgentEvent, EventSink, NullSink};
pub use executor::{CodingAgent, RunOptions};
pub use intent::{Complexity, Intent, classify_intent};
pub use plan::Plan;
pub use policy::{PolicyDecision, PolicyEngine};
pub use semantic::{SemanticHit, SemanticIndex};
pub use session::{Session, SessionStore};
pub use snapshot::{SnapshotStore, SnapshotValue};
pub use tools::{Tool, ToolKind, ToolRegistry, ToolResult};
