//! Agent context state: todos, memory, approvals, guidance queue, running
//! summary, and the failure-pattern ledger.
//!
//! Everything here is owned by the executor task except [`GuidanceQueue`],
//! which is multi-producer (UI) single-consumer (loop) and therefore shared.

use crate::backend::Backend;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-value cap for memory entries.
const MEMORY_VALUE_CAP: usize = 10_000;

/// Ledger caps.
const LEDGER_DETAIL_CAP: usize = 500;
const LEDGER_ROW_CAP: usize = 200;

const FAILURE_LEDGER_PATH: &str = ".bedrock-codex/learning/failure_patterns.json";

/// One checklist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: String,
}

/// One deduplicated failure pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub kind: String,
    pub detail: String,
    pub count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    #[serde(default)]
    pub last_context: Value,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct FailureLedgerFile {
    patterns: Vec<FailurePattern>,
    last_updated: i64,
}

/// Thread-safe mid-task guidance queue. Producers enqueue from any task; the
/// executor drains between (or during) iterations. The interrupt flag is a
/// sticky bit reset by the consumer.
#[derive(Default)]
pub struct GuidanceQueue {
    pending: Mutex<Vec<String>>,
    interrupt: AtomicBool,
}

impl GuidanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue guidance and raise the interrupt so an in-flight stream aborts.
    pub fn push(&self, text: String) {
        self.pending.lock().push(text);
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Drain all queued guidance into one string and clear the interrupt.
    pub fn consume(&self) -> Option<String> {
        let drained: Vec<String> = std::mem::take(&mut *self.pending.lock());
        self.interrupt.store(false, Ordering::SeqCst);
        if drained.is_empty() {
            None
        } else {
            Some(drained.join("\n\n"))
        }
    }

    /// Non-destructive view for serialization.
    pub fn peek_all(&self) -> Vec<String> {
        self.pending.lock().clone()
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

/// Mutable per-run context owned by the executor.
pub struct ContextState {
    pub todos: Vec<TodoItem>,
    memory: HashMap<String, String>,
    approved: HashSet<String>,
    pub guidance: Arc<GuidanceQueue>,
    pub running_summary: String,
    /// Per-target failure counters for strategy escalation.
    pub step_failure_counts: HashMap<String, u64>,
    ledger_cache: Option<Vec<FailurePattern>>,
}

impl Default for ContextState {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextState {
    pub fn new() -> Self {
        Self {
            todos: Vec::new(),
            memory: HashMap::new(),
            approved: HashSet::new(),
            guidance: Arc::new(GuidanceQueue::new()),
            running_summary: String::new(),
            step_failure_counts: HashMap::new(),
            ledger_cache: None,
        }
    }

    pub fn reset(&mut self) {
        self.todos.clear();
        self.memory.clear();
        self.approved.clear();
        self.running_summary.clear();
        self.step_failure_counts.clear();
        self.ledger_cache = None;
        let _ = self.guidance.consume();
    }

    // ── todos ───────────────────────────────────────────────────────

    /// Replace the checklist, normalizing ids and statuses.
    pub fn set_todos(&mut self, raw: &[Value]) {
        self.todos = raw
            .iter()
            .enumerate()
            .map(|(i, t)| TodoItem {
                id: t
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| (i + 1).to_string()),
                content: t
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                status: t
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("pending")
                    .to_string(),
            })
            .collect();
    }

    // ── memory ──────────────────────────────────────────────────────

    pub fn memory_write(&mut self, key: &str, value: &str) {
        let mut value = value.to_string();
        value.truncate(MEMORY_VALUE_CAP);
        self.memory.insert(key.to_string(), value);
    }

    pub fn memory_read(&self, key: &str) -> Option<&String> {
        self.memory.get(key)
    }

    pub fn memory_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .memory
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        entries
    }

    pub fn memory_map(&self) -> &HashMap<String, String> {
        &self.memory
    }

    pub fn restore_memory(&mut self, map: HashMap<String, String>) {
        self.memory = map;
    }

    // ── approval memo ───────────────────────────────────────────────

    /// Canonical fingerprint for an operation: commands by exact command
    /// line, file mutations by op + backend + resolved path, everything else
    /// by sorted input JSON.
    pub fn approval_key(
        tool_name: &str,
        input: &Value,
        backend: &Arc<dyn Backend>,
        is_file_mutating: bool,
    ) -> String {
        if tool_name == "shell" {
            let command = input.get("command").and_then(Value::as_str).unwrap_or("");
            return format!("cmd:{}", command);
        }
        if is_file_mutating {
            let path = input.get("path").and_then(Value::as_str).unwrap_or("");
            let resolved = backend.resolve_path(path);
            return format!("{}:{}:{}", tool_name, backend.backend_id(), resolved);
        }
        format!("{}:{}", tool_name, input)
    }

    pub fn was_approved(&self, key: &str) -> bool {
        self.approved.contains(key)
    }

    pub fn remember_approval(&mut self, key: String) {
        self.approved.insert(key);
    }

    pub fn approved_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.approved.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn restore_approved(&mut self, keys: Vec<String>) {
        self.approved = keys.into_iter().collect();
    }

    // ── failure ledger ──────────────────────────────────────────────

    async fn load_ledger(&mut self, backend: &Arc<dyn Backend>) -> Vec<FailurePattern> {
        if let Some(cached) = &self.ledger_cache {
            return cached.clone();
        }
        let rows = match backend.read_file(FAILURE_LEDGER_PATH).await {
            Ok(raw) => serde_json::from_str::<FailureLedgerFile>(&raw)
                .map(|f| f.patterns)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        self.ledger_cache = Some(rows.clone());
        rows
    }

    async fn save_ledger(&mut self, backend: &Arc<dyn Backend>, rows: Vec<FailurePattern>) {
        let file = FailureLedgerFile {
            patterns: rows.clone(),
            last_updated: time::OffsetDateTime::now_utc().unix_timestamp(),
        };
        match serde_json::to_string_pretty(&file) {
            Ok(serialized) => {
                if let Err(e) = backend.write_file(FAILURE_LEDGER_PATH, &serialized).await {
                    warn!("failed to save failure patterns: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize failure patterns: {}", e),
        }
        self.ledger_cache = Some(rows);
    }

    /// Record one failure, deduplicated by `(kind, detail)` with counters,
    /// sorted by `(count desc, last_seen desc)` and capped.
    pub async fn record_failure_pattern(
        &mut self,
        backend: &Arc<dyn Backend>,
        kind: &str,
        detail: &str,
        context: Value,
    ) {
        let mut rows = self.load_ledger(backend).await;
        let mut detail_key = detail.trim().to_string();
        detail_key.truncate(LEDGER_DETAIL_CAP);
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        match rows
            .iter_mut()
            .find(|r| r.kind == kind && r.detail == detail_key)
        {
            Some(row) => {
                row.count += 1;
                row.last_seen = now;
                row.last_context = context;
            }
            None => rows.push(FailurePattern {
                kind: kind.to_string(),
                detail: detail_key,
                count: 1,
                first_seen: now,
                last_seen: now,
                last_context: context,
            }),
        }
        rows.sort_by(|a, b| (b.count, b.last_seen).cmp(&(a.count, a.last_seen)));
        rows.truncate(LEDGER_ROW_CAP);
        self.save_ledger(backend, rows).await;
    }

    /// Top ledger rows rendered for the system prompt.
    pub async fn failure_patterns_prompt(&mut self, backend: &Arc<dyn Backend>) -> String {
        let rows = self.load_ledger(backend).await;
        if rows.is_empty() {
            return String::new();
        }
        let mut lines = Vec::new();
        for row in rows.iter().take(8) {
            let mut detail = row.detail.clone();
            detail.truncate(180);
            lines.push(format!("- [{}] x{}: {}", row.kind, row.count, detail));
        }
        format!(
            "Avoid repeating these known failure patterns:\n{}\n\nIf you encounter one of these \
             patterns, try an alternative approach rather than repeating the same failing operation.",
            lines.join("\n")
        )
    }

    // ── system reminders ────────────────────────────────────────────

    /// Contextual reminders injected into the system prompt: plan progress,
    /// pending modifications, todo discipline, context pressure, and test
    /// nudges.
    pub fn gather_system_reminders(
        &self,
        plan_total_steps: usize,
        plan_step_index: usize,
        modified_count: usize,
        new_file_count: usize,
        total_input_tokens: u64,
    ) -> Vec<String> {
        let mut reminders = Vec::new();

        if plan_total_steps > 0 {
            if plan_step_index < plan_total_steps {
                let remaining = plan_total_steps - plan_step_index;
                reminders.push(format!(
                    "Active plan: step {}/{} ({} remaining). Follow plan steps in order. \
                     Note any deviations.",
                    plan_step_index + 1,
                    plan_total_steps,
                    remaining
                ));
            } else {
                reminders.push(
                    "Implementation plan is complete. Verify all changes work correctly \
                     before finishing."
                        .to_string(),
                );
            }
        }

        if modified_count > 0 || new_file_count > 0 {
            let mut msg = format!("You have {} file(s) with pending modifications", modified_count);
            if new_file_count > 0 {
                msg.push_str(&format!(" and {} new file(s)", new_file_count));
            }
            msg.push_str(". The user can keep or revert these changes.");
            reminders.push(msg);
        }

        let in_progress = self.todos.iter().filter(|t| t.status == "in_progress").count();
        let pending = self.todos.iter().filter(|t| t.status == "pending").count();
        if in_progress > 0 {
            reminders.push(format!(
                "You have {} task(s) in progress. Complete them before starting new work.",
                in_progress
            ));
        } else if pending > 0 {
            reminders.push(format!(
                "You have {} pending task(s). Set one to in_progress and begin.",
                pending
            ));
        }

        if total_input_tokens > 150_000 {
            reminders.push(
                "Context window is getting large. Be concise in tool calls — use \
                 offset/limit for reads, avoid re-reading files already in context."
                    .to_string(),
            );
        }

        if (modified_count > 0 || new_file_count > 0) && self.memory.contains_key("test_cmd") {
            reminders.push(format!(
                "You have modified {} file(s) and know the test command. Run tests to \
                 verify your changes before finishing.",
                modified_count + new_file_count
            ));
        }

        reminders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn guidance_queue_is_sticky_until_consumed() {
        let q = GuidanceQueue::new();
        assert!(q.consume().is_none());
        q.push("first".into());
        q.push("second".into());
        assert!(q.interrupt_requested());
        assert_eq!(q.consume().unwrap(), "first\n\nsecond");
        assert!(!q.interrupt_requested());
        assert!(q.consume().is_none());
    }

    #[test]
    fn todos_normalize_ids_and_status() {
        let mut state = ContextState::new();
        state.set_todos(&[
            json!({"content": "a", "status": "in_progress"}),
            json!({"id": "x9", "content": "b"}),
        ]);
        assert_eq!(state.todos[0].id, "1");
        assert_eq!(state.todos[0].status, "in_progress");
        assert_eq!(state.todos[1].id, "x9");
        assert_eq!(state.todos[1].status, "pending");
    }

    #[test]
    fn memory_values_are_capped() {
        let mut state = ContextState::new();
        state.memory_write("k", &"v".repeat(20_000));
        assert_eq!(state.memory_read("k").unwrap().len(), MEMORY_VALUE_CAP);
    }

    #[test]
    fn approval_keys_distinguish_backends() {
        let backend_a: Arc<dyn Backend> = Arc::new(LocalBackend::new("/tmp/a"));
        let backend_b: Arc<dyn Backend> = Arc::new(LocalBackend::new("/tmp/b"));
        let input = json!({"path": "f.txt", "old_string": "x", "new_string": "y"});
        let key_a = ContextState::approval_key("edit_file", &input, &backend_a, true);
        let key_b = ContextState::approval_key("edit_file", &input, &backend_b, true);
        assert_ne!(key_a, key_b);

        let cmd = json!({"command": "ls"});
        assert_eq!(
            ContextState::approval_key("shell", &cmd, &backend_a, false),
            "cmd:ls"
        );
    }

    #[tokio::test]
    async fn ledger_dedups_and_sorts() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        let mut state = ContextState::new();

        state
            .record_failure_pattern(&backend, "command_failure", "exit 1", json!({}))
            .await;
        state
            .record_failure_pattern(&backend, "command_failure", "exit 1", json!({}))
            .await;
        state
            .record_failure_pattern(&backend, "policy_block", "rm -rf", json!({}))
            .await;

        let raw = backend
            .read_file(".bedrock-codex/learning/failure_patterns.json")
            .await
            .unwrap();
        let file: FailureLedgerFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.patterns.len(), 2);
        assert_eq!(file.patterns[0].detail, "exit 1");
        assert_eq!(file.patterns[0].count, 2);

        let prompt = state.failure_patterns_prompt(&backend).await;
        assert!(prompt.contains("[command_failure] x2"));
    }

    #[test]
    fn reminders_cover_plan_and_todos() {
        let mut state = ContextState::new();
        state.set_todos(&[json!({"content": "t", "status": "pending"})]);
        let reminders = state.gather_system_reminders(5, 2, 1, 0, 0);
        assert!(reminders.iter().any(|r| r.contains("step 3/5")));
        assert!(reminders.iter().any(|r| r.contains("pending modifications")));
        assert!(reminders.iter().any(|r| r.contains("pending task")));
    }
}
