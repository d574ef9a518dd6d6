//! Reconnect hand-off: a new connection bearing a known session id parks
//! until the previous handler releases ownership, then receives a cleaned
//! history replay plus any partial stream buffer.

use codex::chat::{ContentBlock, Message, MessageContent};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};

/// What the old handler hands to the new connection.
#[derive(Debug, Default)]
pub struct ReplayPayload {
    /// History cleaned of internal tags, ready for display.
    pub history: Vec<Message>,
    /// Thinking text that was mid-stream at disconnect time.
    pub partial_thinking: Option<String>,
    /// Assistant text that was mid-stream at disconnect time.
    pub partial_text: Option<String>,
}

/// A request from a reconnecting client, answered by the active handler.
pub struct HandoffRequest {
    pub reply: oneshot::Sender<ReplayPayload>,
}

/// Held by the active handler of a session; dropping it deregisters.
pub struct HandoffGuard {
    session_id: String,
    registry: Arc<HandoffRegistry>,
    receiver: mpsc::UnboundedReceiver<HandoffRequest>,
}

impl HandoffGuard {
    /// Wait for the next reconnect request, if any arrives.
    pub async fn next_request(&mut self) -> Option<HandoffRequest> {
        self.receiver.recv().await
    }

    /// Non-blocking poll for a pending reconnect request.
    pub fn try_request(&mut self) -> Option<HandoffRequest> {
        self.receiver.try_recv().ok()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for HandoffGuard {
    fn drop(&mut self) {
        let session_id = self.session_id.clone();
        let registry = self.registry.clone();
        // Deregistration is async; detach it when a runtime is available.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.deregister(&session_id).await;
            });
        }
    }
}

/// Registry of live session handlers, keyed by session id.
#[derive(Default)]
pub struct HandoffRegistry {
    active: Mutex<HashMap<String, mpsc::UnboundedSender<HandoffRequest>>>,
}

impl HandoffRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register as the active handler for a session.
    pub async fn register(self: &Arc<Self>, session_id: &str) -> HandoffGuard {
        let (tx, rx) = mpsc::unbounded_channel();
        self.active.lock().await.insert(session_id.to_string(), tx);
        HandoffGuard {
            session_id: session_id.to_string(),
            registry: self.clone(),
            receiver: rx,
        }
    }

    async fn deregister(&self, session_id: &str) {
        self.active.lock().await.remove(session_id);
    }

    /// True when some handler currently owns this session.
    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().await.contains_key(session_id)
    }

    /// Request a hand-off from the current handler of `session_id`. Blocks
    /// until the handler replies with the replay payload. Returns `None`
    /// when no handler is active (a plain resume-from-disk case).
    pub async fn request(&self, session_id: &str) -> Option<ReplayPayload> {
        let sender = {
            let active = self.active.lock().await;
            active.get(session_id).cloned()
        }?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if sender.send(HandoffRequest { reply: reply_tx }).is_err() {
            return None;
        }
        info!("handoff requested for session {}", session_id);
        reply_rx.await.ok()
    }
}

static INTERNAL_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)<(codebase_context|project_context|plan_phase_context|approved_plan|full_plan|plan_decomposition|manager_worker_insights|completed_phases)>.*?</(codebase_context|project_context|plan_phase_context|approved_plan|full_plan|plan_decomposition|manager_worker_insights|completed_phases)>",
    )
    .unwrap()
});
static SYSTEM_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[(SYSTEM|System)[^\]]*\].*$").unwrap());

fn clean_text(text: &str) -> String {
    let without_tags = INTERNAL_TAG.replace_all(text, "");
    let without_system = SYSTEM_LINE.replace_all(&without_tags, "");
    without_system.trim().to_string()
}

/// Strip internal context tags and `[SYSTEM …]` lines from a history so the
/// replay shows only what a user should see. Messages left empty by the
/// cleaning are dropped; tool traffic is preserved.
pub fn clean_history_for_replay(history: &[Message]) -> Vec<Message> {
    let mut cleaned = Vec::new();
    for message in history {
        match &message.content {
            MessageContent::Text(text) => {
                let text = clean_text(text);
                if !text.is_empty() {
                    cleaned.push(Message {
                        role: message.role,
                        content: MessageContent::Text(text),
                    });
                }
            }
            MessageContent::Blocks(blocks) => {
                let mut kept: Vec<ContentBlock> = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            let text = clean_text(text);
                            if !text.is_empty() {
                                kept.push(ContentBlock::Text { text });
                            }
                        }
                        other => kept.push(other.clone()),
                    }
                }
                if !kept.is_empty() {
                    cleaned.push(Message {
                        role: message.role,
                        content: MessageContent::Blocks(kept),
                    });
                }
            }
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cleaning_strips_internal_tags_and_system_lines() {
        let history = vec![
            Message::user(
                "<codebase_context>\nsecret scouting\n</codebase_context>\n\nFix the bug",
            ),
            Message::user("[SYSTEM] You have used 10 of 12 iterations."),
            Message::assistant(vec![
                ContentBlock::text("Working on it"),
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read_file".into(),
                    input: serde_json::json!({"path": "a.rs"}),
                },
            ]),
        ];
        let cleaned = clean_history_for_replay(&history);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].text(), "Fix the bug");
        assert!(!cleaned[0].text().contains("codebase_context"));
        // Tool traffic survives.
        assert_eq!(cleaned[1].tool_use_ids(), vec!["t1"]);
    }

    #[tokio::test]
    async fn handoff_rendezvous_delivers_payload() {
        let registry = HandoffRegistry::new();
        let mut guard = registry.register("sess-1").await;
        assert!(registry.is_active("sess-1").await);

        // Old handler answers requests in the background.
        let handler = tokio::spawn(async move {
            if let Some(request) = guard.next_request().await {
                let _ = request.reply.send(ReplayPayload {
                    history: vec![Message::user("replayed")],
                    partial_thinking: Some("half a thought".into()),
                    partial_text: None,
                });
            }
            // Guard dropped here: handler released the session.
        });

        let payload = registry.request("sess-1").await.unwrap();
        assert_eq!(payload.history.len(), 1);
        assert_eq!(payload.partial_thinking.as_deref(), Some("half a thought"));
        handler.await.unwrap();

        // After release, the session eventually has no active handler.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_active("sess-1").await);
        assert!(registry.request("sess-1").await.is_none());
    }
}
