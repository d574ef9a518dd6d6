//! Prompt-cache breakpoint planning.
//!
//! Providers that support prompt caching mark up to three positions as cache
//! breakpoints. The plan is computed here so every transport places them the
//! same way and cache hits survive across iterations of the agent loop.

use crate::chat::{Message, Role};

/// Where cache-control markers should be placed for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePlan {
    /// Mark the system prompt.
    pub system: bool,
    /// Mark the last tool schema in the tool list.
    pub last_tool: bool,
    /// Index of the most recent stable user message, if any.
    pub stable_user_index: Option<usize>,
}

impl CachePlan {
    /// Compute the breakpoint plan for a request.
    ///
    /// The "stable" user message is the most recent user message: everything
    /// up to and including it is identical in the next request, because the
    /// loop only appends after it.
    pub fn compute(messages: &[Message], has_system: bool, has_tools: bool) -> Self {
        let stable_user_index = messages
            .iter()
            .rposition(|m| matches!(m.role, Role::User));
        Self {
            system: has_system,
            last_tool: has_tools,
            stable_user_index,
        }
    }

    /// Number of breakpoints in this plan (providers usually cap at 4).
    pub fn breakpoint_count(&self) -> usize {
        usize::from(self.system)
            + usize::from(self.last_tool)
            + usize::from(self.stable_user_index.is_some())
    }
}
