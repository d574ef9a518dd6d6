//! Bridging between the live executor and the persisted session record.

use super::Session;
use crate::executor::CodingAgent;
use crate::snapshot::{SessionCheckpoint, SnapshotValue};
use codex::Usage;
use log::debug;
use serde_json::{Value, json};
use std::collections::BTreeMap;

const PERSISTED_SESSION_CHECKPOINTS: usize = 10;
const PERSISTED_STEP_CHECKPOINTS: usize = 15;

impl CodingAgent {
    /// Serialize the executor's state into a session record. Oversize
    /// snapshot entries are dropped; everything else round-trips.
    pub fn export_state(&self, session: &mut Session) {
        session.history = self.history.clone();
        let usage = self.usage();
        session.token_usage.input_tokens = usage.input_tokens;
        session.token_usage.output_tokens = usage.output_tokens;
        session.token_usage.cache_read_tokens = usage.cache_read_tokens;
        session.token_usage.cache_write_tokens = usage.cache_write_tokens;

        let extra = &mut session.extra_state;
        extra.insert(
            "approved_commands".into(),
            json!(self.state.approved_keys()),
        );
        extra.insert(
            "running_summary".into(),
            json!(self.state.running_summary.clone()),
        );
        extra.insert("todos".into(), json!(self.state.todos.clone()));
        extra.insert("memory".into(), json!(self.state.memory_map().clone()));
        extra.insert(
            "pending_guidance".into(),
            json!(self.state.guidance.peek_all()),
        );
        extra.insert("plan".into(), json!(self.current_plan.clone()));
        extra.insert("plan_step_index".into(), json!(self.plan_step_index));
        extra.insert(
            "scout_context".into(),
            json!(self.scout_context.clone()),
        );
        extra.insert(
            "deterministic_verification_done".into(),
            json!(self.deterministic_verification_done),
        );
        extra.insert(
            "file_snapshots".into(),
            json!(self.snapshots.persistable_files()),
        );
        extra.insert(
            "session_checkpoints".into(),
            json!(self
                .snapshots
                .persistable_session_checkpoints(PERSISTED_SESSION_CHECKPOINTS)),
        );
        extra.insert(
            "step_checkpoints".into(),
            json!(self
                .snapshots
                .persistable_step_checkpoints(PERSISTED_STEP_CHECKPOINTS)),
        );
    }

    /// Restore executor state from a persisted session. Unknown or malformed
    /// keys are ignored; the history is repaired afterwards in case a
    /// mid-stream-failure state was saved.
    pub fn restore_state(&mut self, session: &Session) {
        self.history = session.history.clone();
        self.usage = Usage {
            input_tokens: session.token_usage.input_tokens,
            output_tokens: session.token_usage.output_tokens,
            cache_read_tokens: session.token_usage.cache_read_tokens,
            cache_write_tokens: session.token_usage.cache_write_tokens,
        };

        let extra = &session.extra_state;
        let get = |key: &str| extra.get(key).cloned().unwrap_or(Value::Null);

        if let Ok(approved) = serde_json::from_value::<Vec<String>>(get("approved_commands")) {
            self.state.restore_approved(approved);
        }
        if let Some(summary) = get("running_summary").as_str() {
            self.state.running_summary = summary.to_string();
        }
        if let Ok(todos) =
            serde_json::from_value::<Vec<crate::context::TodoItem>>(get("todos"))
        {
            self.state.todos = todos;
        }
        if let Ok(memory) =
            serde_json::from_value::<std::collections::HashMap<String, String>>(get("memory"))
        {
            self.state.restore_memory(memory);
        }
        if let Ok(pending) = serde_json::from_value::<Vec<String>>(get("pending_guidance")) {
            // Re-queued guidance is picked up at the next iteration start.
            for item in pending {
                if !item.trim().is_empty() {
                    self.state.guidance.push(item);
                }
            }
        }
        if let Ok(plan) =
            serde_json::from_value::<Option<crate::plan::Plan>>(get("plan"))
        {
            self.current_plan = plan;
        }
        if let Some(step) = get("plan_step_index").as_u64() {
            self.plan_step_index = step as usize;
        }
        if let Ok(scout) = serde_json::from_value::<Option<String>>(get("scout_context")) {
            self.scout_context = scout;
        }
        if let Some(done) = get("deterministic_verification_done").as_bool() {
            self.deterministic_verification_done = done;
        }

        let files = serde_json::from_value::<BTreeMap<String, SnapshotValue>>(
            get("file_snapshots"),
        )
        .unwrap_or_default();
        let step_checkpoints = serde_json::from_value::<
            BTreeMap<usize, BTreeMap<String, Option<String>>>,
        >(get("step_checkpoints"))
        .unwrap_or_default();
        let session_checkpoints = serde_json::from_value::<Vec<SessionCheckpoint>>(
            get("session_checkpoints"),
        )
        .unwrap_or_default();
        self.snapshots
            .restore(files, step_checkpoints, session_checkpoints);

        // A session saved mid-stream-failure may carry orphaned tool_use
        // blocks.
        if self.history_manager.repair(&mut self.history) {
            debug!("restored session history required repair");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use crate::config::AgentConfig;
    use crate::session::SessionStore;
    use crate::test_utils::MockProvider;
    use codex::LlmProvider;
    use codex::chat::{ContentBlock, Message};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn agent(dir: &TempDir) -> CodingAgent {
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        CodingAgent::new(provider, backend, AgentConfig::default()).await
    }

    #[tokio::test]
    async fn export_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = SessionStore::open(store_dir.path()).await.unwrap();

        let mut source = agent(&dir).await;
        source.history.push(Message::user("do the thing"));
        source.history.push(Message::assistant(vec![
            ContentBlock::text("done"),
        ]));
        source.usage.input_tokens = 1234;
        source.usage.output_tokens = 56;
        source.state.memory_write("test_cmd", "pytest -q");
        source.state.set_todos(&[serde_json::json!({
            "content": "finish", "status": "pending"
        })]);
        source.state.remember_approval("cmd:git push".to_string());
        source.plan_step_index = 2;
        source
            .backend()
            .write_file("f.txt", "original")
            .await
            .unwrap();
        {
            let backend = source.backend().clone();
            source.snapshots.snapshot_file(&backend, "f.txt").await;
        }

        let mut session = store.create_session(dir.path().to_str().unwrap(), "m", "default");
        source.export_state(&mut session);
        store.save(&mut session).await.unwrap();

        let loaded = store.load(&session.session_id).await.unwrap();
        let mut target = agent(&dir).await;
        target.restore_state(&loaded);

        assert_eq!(target.history, source.history);
        assert_eq!(target.usage().input_tokens, 1234);
        assert_eq!(target.usage().output_tokens, 56);
        assert_eq!(
            target.state.memory_read("test_cmd").map(String::as_str),
            Some("pytest -q")
        );
        assert_eq!(target.state.todos.len(), 1);
        assert!(target.state.was_approved("cmd:git push"));
        assert_eq!(target.plan_step_index, 2);
        assert_eq!(target.snapshots().len(), 1);
    }
}
