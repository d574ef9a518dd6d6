//! Two-phase tool dispatch: safe tools run concurrently, mutations run
//! behind policy and approval, grouped serially per file, commands strictly
//! serial.

use super::CodingAgent;
use crate::callbacks::{ApprovalHandler, QuestionHandler};
use crate::context::ContextState;
use crate::events::{AgentEvent, EventSink};
use crate::policy::PolicyEngine;
use crate::tools::{ToolContext, ToolKind, ToolRegistry, ToolResult, special};
use codex::ToolCall;
use codex::chat::ContentBlock;
use futures::future::join_all;
use log::error;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline for a clarifying question to be answered.
const QUESTION_DEADLINE: Duration = Duration::from_secs(300);

static EXIT_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[exit code: (\d+)\]").unwrap());
static PARTIAL_FAILURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(error|failed|traceback|exception)").unwrap());

fn tool_result_block(call: &ToolCall, result: &ToolResult) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: call.id.clone(),
        content: result.text(),
        is_error: !result.success,
    }
}

/// Serial execution of all edits targeting one file. The first failure skips
/// the rest of the group. Includes the auto-retry augmentation on exact-match
/// failures and the auto-lint pass after successful writes.
async fn run_file_group(
    registry: ToolRegistry,
    ctx: ToolContext,
    calls: Vec<ToolCall>,
    window_factor: f64,
) -> Vec<(ToolCall, ToolResult)> {
    let mut results = Vec::with_capacity(calls.len());
    let mut failed = false;
    for call in calls {
        if failed {
            results.push((
                call,
                ToolResult::err("Skipped: earlier edit to same file failed."),
            ));
            continue;
        }
        let mut result = registry
            .execute(&call.name, call.input.clone(), &ctx)
            .await;

        // Auto-retry on exact-match failure: re-read the file and hand the
        // model its real content.
        if !result.success && call.name == "edit_file" {
            let err_text = result.text().to_lowercase();
            if err_text.contains("not found") || err_text.contains("occurrences") {
                if let Some(path) = call.input.get("path").and_then(Value::as_str) {
                    let fresh = registry
                        .execute("read_file", json!({"path": path}), &ctx)
                        .await;
                    if fresh.success {
                        let cap = (8_000f64 * window_factor) as usize;
                        let max_lines = (150f64 * window_factor) as usize;
                        let mut content = fresh.output;
                        if content.len() > cap {
                            let lines: Vec<&str> = content.lines().collect();
                            content = format!(
                                "{}\n... ({} lines omitted)",
                                lines[..max_lines.min(lines.len())].join("\n"),
                                lines.len().saturating_sub(max_lines)
                            );
                        }
                        result = ToolResult::err(format!(
                            "{}\n\n[Auto-read] Current file content:\n{}\n\nRetry with the \
                             correct old_string from the content above.",
                            result.text(),
                            content
                        ));
                    }
                }
            }
        }

        // Auto-lint after a successful write.
        if result.success {
            if let Some(path) = call.input.get("path").and_then(Value::as_str) {
                let lint = registry
                    .execute("lint_file", json!({"path": path}), &ctx)
                    .await;
                let lint_out = lint.text();
                let lint_lower = lint_out.to_lowercase();
                let clean = lint_lower.contains("no issues")
                    || lint_lower.contains("no errors")
                    || lint_lower.contains("looks good");
                if !lint_out.trim().is_empty() && !clean {
                    result = ToolResult::ok(format!(
                        "{}\n\n[Auto-lint] Errors detected:\n{}\nFix these lint errors.",
                        result.output,
                        lint_out.trim()
                    ));
                }
            }
        }

        if !result.success {
            failed = true;
        }
        results.push((call, result));
    }
    results
}

impl CodingAgent {
    /// Execute one batch of tool calls and return tool_result blocks in the
    /// original request order.
    pub(crate) async fn execute_tools_parallel(
        &mut self,
        tool_uses: &[ToolCall],
        sink: &Arc<dyn EventSink>,
        approval: &Arc<dyn ApprovalHandler>,
        question: Option<&Arc<dyn QuestionHandler>>,
    ) -> Vec<ContentBlock> {
        let mut results_by_id: HashMap<String, ContentBlock> = HashMap::new();

        // ── state-backed specials, handled inline ──
        for call in tool_uses {
            match call.name.as_str() {
                special::TODO_WRITE => {
                    let raw: Vec<Value> = call
                        .input
                        .get("todos")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    self.state.set_todos(&raw);
                    let mut lines =
                        vec![format!("Todos updated ({} items).", self.state.todos.len())];
                    for todo in &self.state.todos {
                        lines.push(format!("  [{}] {}", todo.status, todo.content));
                    }
                    let content = lines.join("\n");
                    self.emit(
                        sink,
                        AgentEvent::ToolResult {
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            success: true,
                            content: content.clone(),
                            duration_secs: None,
                            exit_code: None,
                        },
                    )
                    .await;
                    self.emit(
                        sink,
                        AgentEvent::TodosUpdated {
                            todos: self.state.todos.clone(),
                        },
                    )
                    .await;
                    results_by_id
                        .insert(call.id.clone(), ContentBlock::tool_result(&call.id, content));
                }
                special::TODO_READ => {
                    let content = if self.state.todos.is_empty() {
                        "No todos yet. Use TodoWrite to create a task list.".to_string()
                    } else {
                        serde_json::to_string_pretty(&self.state.todos)
                            .unwrap_or_else(|_| "[]".to_string())
                    };
                    self.emit(
                        sink,
                        AgentEvent::ToolResult {
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            success: true,
                            content: content.clone(),
                            duration_secs: None,
                            exit_code: None,
                        },
                    )
                    .await;
                    results_by_id
                        .insert(call.id.clone(), ContentBlock::tool_result(&call.id, content));
                }
                special::MEMORY_WRITE => {
                    let key = call
                        .input
                        .get("key")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    let (content, is_error) = if key.is_empty() {
                        (
                            "Error: key is required and cannot be empty.".to_string(),
                            true,
                        )
                    } else {
                        let value = match call.input.get("value") {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        };
                        self.state.memory_write(&key, &value);
                        (format!("Stored key '{}'.", key), false)
                    };
                    self.emit(
                        sink,
                        AgentEvent::ToolResult {
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            success: !is_error,
                            content: content.clone(),
                            duration_secs: None,
                            exit_code: None,
                        },
                    )
                    .await;
                    let block = if is_error {
                        ContentBlock::error_result(&call.id, content)
                    } else {
                        ContentBlock::tool_result(&call.id, content)
                    };
                    results_by_id.insert(call.id.clone(), block);
                }
                special::MEMORY_READ => {
                    let key = call
                        .input
                        .get("key")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    let content = if key.is_empty() {
                        let entries = self.state.memory_entries();
                        if entries.is_empty() {
                            "No facts stored yet. Use MemoryWrite to store key-value facts."
                                .to_string()
                        } else {
                            entries
                                .iter()
                                .map(|(k, v)| format!("{}: {}", k, v))
                                .collect::<Vec<_>>()
                                .join("\n")
                        }
                    } else {
                        match self.state.memory_read(&key) {
                            Some(value) => value.clone(),
                            None => format!("No value stored for key '{}'.", key),
                        }
                    };
                    self.emit(
                        sink,
                        AgentEvent::ToolResult {
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            success: true,
                            content: content.clone(),
                            duration_secs: None,
                            exit_code: None,
                        },
                    )
                    .await;
                    results_by_id
                        .insert(call.id.clone(), ContentBlock::tool_result(&call.id, content));
                }
                special::ASK_USER_QUESTION => {
                    let q = call
                        .input
                        .get("question")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let context = call
                        .input
                        .get("context")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let options = call.input.get("options").and_then(Value::as_array).map(|a| {
                        a.iter()
                            .map(|o| {
                                o.as_str()
                                    .map(str::to_string)
                                    .unwrap_or_else(|| o.to_string())
                            })
                            .collect::<Vec<String>>()
                    });
                    let answer = match question {
                        Some(handler) => {
                            match tokio::time::timeout(
                                QUESTION_DEADLINE,
                                handler.request_answer(q, context, &call.id, options),
                            )
                            .await
                            {
                                Ok(Ok(answer)) => answer,
                                Ok(Err(e)) => format!("Error asking user: {}", e),
                                Err(_) => {
                                    "No answer within the deadline; proceeding with best assumption."
                                        .to_string()
                                }
                            }
                        }
                        None => {
                            "No question callback; proceeding with best assumption.".to_string()
                        }
                    };
                    results_by_id
                        .insert(call.id.clone(), ContentBlock::tool_result(&call.id, answer));
                }
                _ => {}
            }
        }

        // ── classify the rest ──
        let rest: Vec<&ToolCall> = tool_uses
            .iter()
            .filter(|c| {
                !special::is_state_tool(&c.name) && c.name != special::ASK_USER_QUESTION
            })
            .collect();
        let mut safe_calls: Vec<&ToolCall> = Vec::new();
        let mut file_write_calls: Vec<&ToolCall> = Vec::new();
        let mut command_calls: Vec<&ToolCall> = Vec::new();
        for call in rest {
            match self.registry.kind_of(&call.name) {
                ToolKind::Safe => safe_calls.push(call),
                ToolKind::FileMutating => file_write_calls.push(call),
                ToolKind::Command => command_calls.push(call),
            }
        }

        // ── phase A: safe tools, concurrent ──
        if !safe_calls.is_empty() {
            self.run_safe_batch(&safe_calls, sink, &mut results_by_id).await;
        }

        // ── phase B: file writes ──
        if !file_write_calls.is_empty() {
            self.run_file_write_batch(&file_write_calls, sink, approval, &mut results_by_id)
                .await;
        }

        // ── phase B: commands, strictly serial ──
        for call in command_calls {
            self.run_command_call(call, sink, approval, &mut results_by_id)
                .await;
        }

        // Results preserve the request order regardless of execution order.
        tool_uses
            .iter()
            .filter_map(|call| results_by_id.remove(&call.id))
            .collect()
    }

    /// True when the call is a full-file read eligible for cache/dedup.
    fn is_plain_read(call: &ToolCall) -> bool {
        call.name == "read_file"
            && call.input.get("offset").is_none()
            && call.input.get("limit").is_none()
    }

    async fn run_safe_batch(
        &mut self,
        safe_calls: &[&ToolCall],
        sink: &Arc<dyn EventSink>,
        results_by_id: &mut HashMap<String, ContentBlock>,
    ) {
        let ctx = self.tool_context();

        // Cache hits and same-batch duplicate reads resolve without running.
        let mut to_run: Vec<ToolCall> = Vec::new();
        let mut cached: Vec<(ToolCall, ToolResult)> = Vec::new();
        let mut seen_reads: HashMap<String, String> = HashMap::new(); // resolved -> first call id
        let mut duplicates: Vec<(ToolCall, String)> = Vec::new(); // call -> source call id
        for &call in safe_calls {
            if Self::is_plain_read(call) {
                let path = call.input.get("path").and_then(Value::as_str).unwrap_or("");
                let resolved = self.backend.resolve_path(path);
                if let Some(source) = seen_reads.get(&resolved) {
                    duplicates.push((call.clone(), source.clone()));
                    continue;
                }
                seen_reads.insert(resolved, call.id.clone());
                let key = self.file_cache_key(path);
                if let Some(content) = self.file_cache.get(&key) {
                    cached.push((call.clone(), ToolResult::ok(content.clone())));
                    continue;
                }
            }
            to_run.push(call.clone());
        }

        let futures: Vec<_> = to_run
            .into_iter()
            .map(|call| {
                let registry = self.registry.clone();
                let ctx = ctx.clone();
                async move {
                    let result = registry.execute(&call.name, call.input.clone(), &ctx).await;
                    (call, result)
                }
            })
            .collect();
        let mut outcomes: Vec<(ToolCall, ToolResult)> = join_all(futures).await;

        // Cache successful full reads.
        for (call, result) in &outcomes {
            if Self::is_plain_read(call) && result.success {
                let path = call.input.get("path").and_then(Value::as_str).unwrap_or("");
                let key = self.file_cache_key(path);
                self.file_cache.insert(key, result.output.clone());
            }
        }

        outcomes.extend(cached);
        // Duplicates share the result produced for their source call.
        let by_id: HashMap<String, ToolResult> = outcomes
            .iter()
            .map(|(c, r)| (c.id.clone(), r.clone()))
            .collect();
        for (dup, source_id) in duplicates {
            if let Some(result) = by_id.get(&source_id) {
                outcomes.push((dup, result.clone()));
            }
        }

        for (call, result) in outcomes {
            self.emit(
                sink,
                AgentEvent::ToolResult {
                    tool_use_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    success: result.success,
                    content: result.text(),
                    duration_secs: None,
                    exit_code: None,
                },
            )
            .await;
            if !result.success && self.config.learning_loop_enabled {
                self.state
                    .record_failure_pattern(
                        &self.backend,
                        "safe_tool_failure",
                        crate::history::take_chars(&result.text(), 1000),
                        json!({"tool_name": call.name, "tool_input": call.input}),
                    )
                    .await;
            }
            results_by_id.insert(call.id.clone(), tool_result_block(&call, &result));
        }
    }

    async fn run_file_write_batch(
        &mut self,
        file_write_calls: &[&ToolCall],
        sink: &Arc<dyn EventSink>,
        approval: &Arc<dyn ApprovalHandler>,
        results_by_id: &mut HashMap<String, ContentBlock>,
    ) {
        // Policy + approvals, serial, before anything runs.
        let mut approved_calls: Vec<ToolCall> = Vec::new();
        for call in file_write_calls {
            let decision = PolicyEngine::decide(&call.name, &call.input, &self.config);
            if decision.blocked {
                let msg = format!(
                    "Blocked by policy engine: {}",
                    decision.reason.clone().unwrap_or_else(|| "Operation is not allowed.".into())
                );
                results_by_id
                    .insert(call.id.clone(), ContentBlock::error_result(&call.id, &msg));
                self.emit(
                    sink,
                    AgentEvent::ToolRejected {
                        tool_use_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        reason: decision.reason.clone(),
                        policy_blocked: true,
                    },
                )
                .await;
                if self.config.learning_loop_enabled {
                    self.state
                        .record_failure_pattern(
                            &self.backend,
                            "policy_block",
                            &msg,
                            json!({"tool_name": call.name, "input": call.input}),
                        )
                        .await;
                }
                continue;
            }
            if decision.require_approval {
                let key = ContextState::approval_key(&call.name, &call.input, &self.backend, true);
                if self.state.was_approved(&key) {
                    self.emit(
                        sink,
                        AgentEvent::AutoApproved {
                            tool_name: call.name.clone(),
                            policy_reason: decision.reason.clone(),
                        },
                    )
                    .await;
                } else {
                    let mut description = self.format_tool_description(&call.name, &call.input);
                    if let Some(reason) = &decision.reason {
                        description.push_str(&format!("\n\nPolicy note: {}", reason));
                    }
                    let approved = approval
                        .request_approval(&call.name, &description, &call.input)
                        .await;
                    if !approved {
                        results_by_id.insert(
                            call.id.clone(),
                            ContentBlock::error_result(&call.id, "User rejected this operation."),
                        );
                        self.emit(
                            sink,
                            AgentEvent::ToolRejected {
                                tool_use_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                reason: decision.reason.clone(),
                                policy_blocked: false,
                            },
                        )
                        .await;
                        continue;
                    }
                    self.state.remember_approval(key);
                }
            }
            approved_calls.push((*call).clone());
        }
        if approved_calls.is_empty() {
            return;
        }

        // Snapshot every target before any write.
        for call in &approved_calls {
            if let Some(path) = call.input.get("path").and_then(Value::as_str) {
                self.snapshots.snapshot_file(&self.backend, path).await;
            }
        }

        // Group by resolved path: same-file edits serialize, groups run in
        // parallel.
        let mut groups: HashMap<String, Vec<ToolCall>> = HashMap::new();
        for call in approved_calls {
            let path = call.input.get("path").and_then(Value::as_str).unwrap_or("");
            let resolved = self.backend.resolve_path(path);
            groups.entry(resolved).or_default().push(call);
        }

        // Session checkpoint before the batch.
        if self.config.session_checkpoints_enabled {
            let targets: Vec<String> = groups.keys().cloned().collect();
            let total: usize = groups.values().map(Vec::len).sum();
            if let Some(cp_id) = self
                .snapshots
                .create_session_checkpoint(
                    &self.backend,
                    &format!("before_file_batch:{}", total),
                    &targets,
                )
                .await
            {
                self.emit(
                    sink,
                    AgentEvent::CheckpointCreated {
                        checkpoint_id: cp_id,
                        label: "before_file_batch".to_string(),
                    },
                )
                .await;
            }
        }

        let ctx = self.tool_context();
        let window_factor = self.history_manager.window_factor();
        let futures: Vec<_> = groups
            .into_values()
            .map(|calls| run_file_group(self.registry.clone(), ctx.clone(), calls, window_factor))
            .collect();
        let group_results = join_all(futures).await;

        for group in group_results {
            for (call, result) in group {
                if result.success {
                    if let Some(path) = call.input.get("path").and_then(Value::as_str) {
                        self.invalidate_file_cache(path);
                        if call.name == "write_file" {
                            let abs = self.backend.resolve_path(path);
                            if let Some(content) =
                                call.input.get("content").and_then(Value::as_str)
                            {
                                self.snapshots.record_created_content(&abs, content);
                            }
                        }
                    }
                } else if self.config.learning_loop_enabled {
                    self.state
                        .record_failure_pattern(
                            &self.backend,
                            "file_edit_failure",
                            crate::history::take_chars(&result.text(), 1200),
                            json!({"tool_name": call.name, "tool_input": call.input}),
                        )
                        .await;
                }
                self.emit(
                    sink,
                    AgentEvent::ToolResult {
                        tool_use_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        success: result.success,
                        content: result.text(),
                        duration_secs: None,
                        exit_code: None,
                    },
                )
                .await;
                results_by_id.insert(call.id.clone(), tool_result_block(&call, &result));
            }
        }
    }

    async fn run_command_call(
        &mut self,
        call: &ToolCall,
        sink: &Arc<dyn EventSink>,
        approval: &Arc<dyn ApprovalHandler>,
        results_by_id: &mut HashMap<String, ContentBlock>,
    ) {
        let decision = PolicyEngine::decide(&call.name, &call.input, &self.config);
        if decision.blocked {
            let msg = format!(
                "Blocked by policy engine: {}",
                decision.reason.clone().unwrap_or_else(|| "Operation is not allowed.".into())
            );
            results_by_id.insert(call.id.clone(), ContentBlock::error_result(&call.id, &msg));
            self.emit(
                sink,
                AgentEvent::ToolRejected {
                    tool_use_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    reason: decision.reason.clone(),
                    policy_blocked: true,
                },
            )
            .await;
            if self.config.learning_loop_enabled {
                self.state
                    .record_failure_pattern(
                        &self.backend,
                        "policy_block",
                        &msg,
                        json!({"tool_name": call.name, "tool_input": call.input}),
                    )
                    .await;
            }
            return;
        }

        let key = ContextState::approval_key(&call.name, &call.input, &self.backend, false);
        if decision.require_approval {
            if self.state.was_approved(&key) {
                self.emit(
                    sink,
                    AgentEvent::AutoApproved {
                        tool_name: call.name.clone(),
                        policy_reason: decision.reason.clone(),
                    },
                )
                .await;
            } else {
                let mut description = self.format_tool_description(&call.name, &call.input);
                if let Some(reason) = &decision.reason {
                    description.push_str(&format!("\n\nPolicy note: {}", reason));
                }
                if !approval
                    .request_approval(&call.name, &description, &call.input)
                    .await
                {
                    results_by_id.insert(
                        call.id.clone(),
                        ContentBlock::error_result(&call.id, "User rejected this operation."),
                    );
                    self.emit(
                        sink,
                        AgentEvent::ToolRejected {
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            reason: decision.reason.clone(),
                            policy_blocked: false,
                        },
                    )
                    .await;
                    return;
                }
                self.state.remember_approval(key);
            }
        } else if self.config.auto_approve_commands {
            self.emit(
                sink,
                AgentEvent::AutoApproved {
                    tool_name: call.name.clone(),
                    policy_reason: None,
                },
            )
            .await;
        } else if self.state.was_approved(&key) {
            self.emit(
                sink,
                AgentEvent::AutoApproved {
                    tool_name: call.name.clone(),
                    policy_reason: None,
                },
            )
            .await;
        } else {
            let description = self.format_tool_description(&call.name, &call.input);
            if !approval
                .request_approval(&call.name, &description, &call.input)
                .await
            {
                results_by_id.insert(
                    call.id.clone(),
                    ContentBlock::error_result(&call.id, "User rejected this operation."),
                );
                self.emit(
                    sink,
                    AgentEvent::ToolRejected {
                        tool_use_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        reason: None,
                        policy_blocked: false,
                    },
                )
                .await;
                return;
            }
            self.state.remember_approval(key);
        }

        if call.name == "shell" {
            self.emit(
                sink,
                AgentEvent::CommandStart {
                    tool_use_id: call.id.clone(),
                    command: call
                        .input
                        .get("command")
                        .and_then(Value::as_str)
                        .unwrap_or("?")
                        .to_string(),
                },
            )
            .await;
        }

        // Checkpoint before any non-safe command.
        if self.config.session_checkpoints_enabled {
            let targets = self.snapshots.tracked_paths();
            if let Some(cp_id) = self
                .snapshots
                .create_session_checkpoint(
                    &self.backend,
                    &format!("before_command:{}", call.name),
                    &targets,
                )
                .await
            {
                self.emit(
                    sink,
                    AgentEvent::CheckpointCreated {
                        checkpoint_id: cp_id,
                        label: format!("before_command:{}", call.name),
                    },
                )
                .await;
            }
        }

        let start = Instant::now();
        let result = if call.name == "shell" && self.config.live_command_streaming {
            self.run_command_with_streaming(call, sink).await
        } else {
            let ctx = self.tool_context();
            self.registry.execute(&call.name, call.input.clone(), &ctx).await
        };
        let duration = start.elapsed().as_secs_f64();

        let mut result_text = result.text();
        if !result.success {
            if let Some(cp_id) = self.snapshots.latest_checkpoint_id() {
                result_text.push_str(&format!(
                    "\n\n[checkpoint] You can rewind with checkpoint id: {}",
                    cp_id
                ));
            }
        }

        let exit_code = if call.name == "shell" {
            EXIT_CODE_RE
                .captures(&result_text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
                .or(if result.success { Some(0) } else { None })
        } else {
            None
        };

        self.emit(
            sink,
            AgentEvent::ToolResult {
                tool_use_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: result.success,
                content: result_text.clone(),
                duration_secs: Some((duration * 10.0).round() / 10.0),
                exit_code,
            },
        )
        .await;
        if !result.success && self.config.learning_loop_enabled {
            self.state
                .record_failure_pattern(
                    &self.backend,
                    "command_failure",
                    crate::history::take_chars(&result_text, 1200),
                    json!({"tool_name": call.name, "tool_input": call.input}),
                )
                .await;
        }
        let block = ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content: result_text,
            is_error: !result.success,
        };
        results_by_id.insert(call.id.clone(), block);
    }

    /// Run a shell command streaming `command_output` events live, with a
    /// one-shot partial-failure signal on error-looking output.
    async fn run_command_with_streaming(
        &self,
        call: &ToolCall,
        sink: &Arc<dyn EventSink>,
    ) -> ToolResult {
        let command = call
            .input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if command.is_empty() {
            return ToolResult::err("command is required");
        }
        let ctx = self.tool_context();
        let timeout = ctx.clamp_timeout(call.input.get("timeout").and_then(Value::as_u64));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, bool)>();
        let callback: crate::backend::OutputCallback = Arc::new(move |chunk: &str, is_stderr| {
            let _ = tx.send((chunk.to_string(), is_stderr));
        });

        let backend = self.backend.clone();
        let cmd = command.clone();
        let mut run = tokio::spawn(async move {
            backend
                .run_command_stream(&cmd, ".", timeout, callback)
                .await
        });

        let mut partial_failure_sent = false;
        let output = loop {
            tokio::select! {
                chunk = rx.recv() => {
                    match chunk {
                        Some((chunk, is_stderr)) => {
                            if !partial_failure_sent && PARTIAL_FAILURE_RE.is_match(&chunk) {
                                partial_failure_sent = true;
                                self.emit(sink, AgentEvent::CommandPartialFailure {
                                    tool_use_id: call.id.clone(),
                                }).await;
                            }
                            self.emit(sink, AgentEvent::CommandOutput {
                                tool_use_id: call.id.clone(),
                                chunk,
                                is_stderr,
                            }).await;
                        }
                        None => {
                            // Producer finished; collect the command result.
                            break (&mut run).await;
                        }
                    }
                }
                result = &mut run => {
                    // Drain whatever is left in the channel.
                    while let Ok((chunk, is_stderr)) = rx.try_recv() {
                        self.emit(sink, AgentEvent::CommandOutput {
                            tool_use_id: call.id.clone(),
                            chunk,
                            is_stderr,
                        }).await;
                    }
                    break result;
                }
            }
        };

        let command_output = match output {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return ToolResult::err(format!("Command failed: {}", e)),
            Err(join_err) => {
                error!("command task panicked: {}", join_err);
                return ToolResult::err("Command task failed unexpectedly");
            }
        };
        let formatted = crate::tools::builtins::ShellTool::format_output(
            &command_output.stdout,
            &command_output.stderr,
            command_output.exit_code,
        );
        if command_output.exit_code == 0 {
            ToolResult::ok(formatted)
        } else {
            ToolResult {
                success: false,
                output: formatted.clone(),
                error: Some(formatted),
            }
        }
    }

    /// Human-readable description of a tool call for the approval dialog.
    pub(crate) fn format_tool_description(&self, name: &str, input: &Value) -> String {
        match name {
            "write_file" => {
                let path = input.get("path").and_then(Value::as_str).unwrap_or("?");
                let lines = input
                    .get("content")
                    .and_then(Value::as_str)
                    .map(|c| c.lines().count())
                    .unwrap_or(0);
                format!("Write {} ({} lines)", path, lines)
            }
            "edit_file" => {
                let path = input.get("path").and_then(Value::as_str).unwrap_or("?");
                format!("Edit {}: replace string", path)
            }
            "symbol_edit" => format!(
                "Symbol edit {}: {} ({})",
                input.get("path").and_then(Value::as_str).unwrap_or("?"),
                input.get("symbol").and_then(Value::as_str).unwrap_or("?"),
                input.get("kind").and_then(Value::as_str).unwrap_or("all"),
            ),
            "shell" => format!(
                "Run: {}",
                input.get("command").and_then(Value::as_str).unwrap_or("?")
            ),
            "plan_review" => {
                let count = input
                    .get("plan_steps")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                format!("Review and approve plan execution ({} steps)", count)
            }
            _ => {
                let rendered = input.to_string();
                format!("{}({})", name, crate::history::take_chars(&rendered, 200))
            }
        }
    }

    /// Strategy escalation: repeated failures on the same target trigger a
    /// suggestion to switch approach.
    pub(crate) fn suggest_strategy_escalation(
        &mut self,
        tool_results: &[ContentBlock],
        context_usage: f64,
    ) -> Option<String> {
        static TARGET_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?:File|path)[:\s]+[`'\x22]?([A-Za-z0-9_\-./]+\.[A-Za-z]{1,5})").unwrap()
        });
        static ANY_PATH_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"([A-Za-z0-9_\-./]+\.[A-Za-z]{1,5})").unwrap());

        if tool_results.is_empty() {
            return None;
        }

        let mut failed_targets: Vec<String> = Vec::new();
        for block in tool_results {
            let ContentBlock::ToolResult {
                content, is_error, ..
            } = block
            else {
                continue;
            };
            let lower = content.to_lowercase();
            let head = crate::history::take_chars(&lower, 100);
            let is_fail = *is_error
                || lower.contains("not found")
                || lower.contains("multiple occurrences")
                || head.contains("error");
            if !is_fail {
                continue;
            }
            let target = TARGET_RE
                .captures(content)
                .or_else(|| ANY_PATH_RE.captures(crate::history::take_chars(content, 300)))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            if let Some(target) = target {
                *self
                    .state
                    .step_failure_counts
                    .entry(target.clone())
                    .or_default() += 1;
                failed_targets.push(target);
            }
        }

        let mut suggestions: Vec<String> = Vec::new();
        failed_targets.sort();
        failed_targets.dedup();
        for target in failed_targets {
            let total = *self.state.step_failure_counts.get(&target).unwrap_or(&0);
            if total >= 2 {
                suggestions.push(format!(
                    "Direct editing has failed {} times for `{}`. Consider writing a \
                     script via the shell to perform this transformation programmatically \
                     instead of individual edits.",
                    total, target
                ));
            }
            if total >= 3 {
                suggestions.push(format!(
                    "Repeated failures on `{}` ({} attempts). Break this step into smaller \
                     sub-steps, or try a completely different approach. Do NOT retry the \
                     same failing operation.",
                    target, total
                ));
            }
        }

        if self.task_complexity == crate::decompose::TaskComplexity::High && context_usage > 0.6 {
            suggestions.push(
                "Context is over 60% full during a complex task. Summarize completed work \
                 and indicate which files you're done with so the context trimmer can \
                 reclaim space."
                    .to_string(),
            );
        }

        if suggestions.is_empty() {
            return None;
        }
        let rendered: Vec<String> = suggestions.iter().map(|s| format!("- {}", s)).collect();
        Some(format!(
            "**Strategy Escalation** — The system detected repeated failures:\n{}",
            rendered.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use crate::callbacks::{ApproveAll, DenyAll};
    use crate::config::AgentConfig;
    use crate::test_utils::{CollectingSink, MockProvider};
    use codex::LlmProvider;
    use tempfile::TempDir;

    async fn agent_in(dir: &TempDir, config: AgentConfig) -> CodingAgent {
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        CodingAgent::new(provider, backend, config).await
    }

    fn call(id: &str, name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn results_preserve_request_order() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        agent.backend.write_file("a.txt", "alpha").await.unwrap();
        agent.backend.write_file("b.txt", "beta").await.unwrap();

        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        let calls = vec![
            call("t1", "read_file", json!({"path": "b.txt"})),
            call("t2", "read_file", json!({"path": "a.txt"})),
        ];
        let results = agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        assert_eq!(results.len(), 2);
        match (&results[0], &results[1]) {
            (
                ContentBlock::ToolResult { tool_use_id: first, .. },
                ContentBlock::ToolResult { tool_use_id: second, .. },
            ) => {
                assert_eq!(first, "t1");
                assert_eq!(second, "t2");
            }
            _ => panic!("expected tool results"),
        }
    }

    #[tokio::test]
    async fn duplicate_reads_share_one_execution() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        agent.backend.write_file("a.txt", "alpha").await.unwrap();

        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        let calls = vec![
            call("t1", "read_file", json!({"path": "a.txt"})),
            call("t2", "read_file", json!({"path": "a.txt"})),
        ];
        let results = agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        assert_eq!(results.len(), 2);
        // Both carry the same content.
        let texts: Vec<String> = results
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult { content, .. } => content.clone(),
                _ => panic!(),
            })
            .collect();
        assert_eq!(texts[0], texts[1]);
    }

    #[tokio::test]
    async fn write_snapshots_then_applies_and_read_cache_invalidated() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        agent.backend.write_file("f.txt", "old").await.unwrap();

        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);

        // Prime the read cache.
        let read = vec![call("r1", "read_file", json!({"path": "f.txt"}))];
        agent
            .execute_tools_parallel(&read, &dyn_sink, &approval, None)
            .await;
        assert_eq!(agent.file_cache.len(), 1);

        let writes = vec![call(
            "w1",
            "edit_file",
            json!({"path": "f.txt", "old_string": "old", "new_string": "new"}),
        )];
        let results = agent
            .execute_tools_parallel(&writes, &dyn_sink, &approval, None)
            .await;
        assert_eq!(results.len(), 1);
        assert!(agent.snapshots.contains(&agent.backend.resolve_path("f.txt")));
        assert!(agent.file_cache.is_empty());
        assert_eq!(agent.backend.read_file("f.txt").await.unwrap(), "new");

        // Revert restores the original.
        let reverted = agent.revert_all().await;
        assert_eq!(reverted.len(), 1);
        assert_eq!(agent.backend.read_file("f.txt").await.unwrap(), "old");
    }

    #[tokio::test]
    async fn same_file_edits_serialize_and_skip_after_failure() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        agent.backend.write_file("f.txt", "one two").await.unwrap();

        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        let calls = vec![
            call(
                "e1",
                "edit_file",
                json!({"path": "f.txt", "old_string": "absent", "new_string": "x"}),
            ),
            call(
                "e2",
                "edit_file",
                json!({"path": "f.txt", "old_string": "one", "new_string": "1"}),
            ),
        ];
        let results = agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        assert_eq!(results.len(), 2);
        match &results[1] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert!(*is_error);
                assert!(content.contains("Skipped: earlier edit to same file failed."));
            }
            _ => panic!(),
        }
        // Second edit never ran.
        assert_eq!(agent.backend.read_file("f.txt").await.unwrap(), "one two");
        // The first failure includes the auto-read content.
        match &results[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert!(content.contains("[Auto-read] Current file content:"));
            }
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn destructive_command_blocked_and_recorded() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        let calls = vec![call("c1", "shell", json!({"command": "rm -rf build/"}))];
        let results = agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        match &results[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert!(*is_error);
                assert!(content.contains("Blocked by policy engine"));
            }
            _ => panic!(),
        }
        assert!(sink.events().iter().any(|e| matches!(
            e,
            AgentEvent::ToolRejected { policy_blocked: true, .. }
        )));
        // Ledger gained a policy_block entry.
        let ledger = agent
            .backend
            .read_file(".bedrock-codex/learning/failure_patterns.json")
            .await
            .unwrap();
        assert!(ledger.contains("policy_block"));
    }

    #[tokio::test]
    async fn destructive_without_block_asks_and_rejection_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig {
            block_destructive_commands: false,
            ..AgentConfig::default()
        };
        let mut agent = agent_in(&dir, config).await;
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(DenyAll);
        let calls = vec![call("c1", "shell", json!({"command": "rm -rf build/"}))];
        let results = agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        match &results[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert!(*is_error);
                assert_eq!(content, "User rejected this operation.");
            }
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn approval_memo_prevents_reprompting() {
        struct CountingApproval(parking_lot::Mutex<usize>);
        #[async_trait::async_trait]
        impl ApprovalHandler for CountingApproval {
            async fn request_approval(&self, _t: &str, _d: &str, _i: &Value) -> bool {
                *self.0.lock() += 1;
                true
            }
        }

        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let counter = Arc::new(CountingApproval(parking_lot::Mutex::new(0)));
        let approval: Arc<dyn ApprovalHandler> = counter.clone();

        let calls = vec![call("c1", "shell", json!({"command": "git push origin main"}))];
        agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        let calls = vec![call("c2", "shell", json!({"command": "git push origin main"}))];
        agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        assert_eq!(*counter.0.lock(), 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::AutoApproved { .. })));
    }

    #[tokio::test]
    async fn todo_write_updates_state_and_emits() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        let calls = vec![call(
            "t1",
            "TodoWrite",
            json!({"todos": [{"content": "step one", "status": "in_progress"}]}),
        )];
        agent
            .execute_tools_parallel(&calls, &dyn_sink, &approval, None)
            .await;
        assert_eq!(agent.state.todos.len(), 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::TodosUpdated { .. })));
    }

    #[tokio::test]
    async fn escalation_after_repeated_failures() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent_in(&dir, AgentConfig::default()).await;
        let failure = ContentBlock::ToolResult {
            tool_use_id: "x".into(),
            content: "old_string not found in content (in src/lib.rs)".into(),
            is_error: true,
        };
        assert!(agent
            .suggest_strategy_escalation(std::slice::from_ref(&failure), 0.1)
            .is_none());
        let hint = agent
            .suggest_strategy_escalation(std::slice::from_ref(&failure), 0.1)
            .unwrap();
        assert!(hint.contains("Strategy Escalation"));
        assert!(hint.contains("src/lib.rs"));
    }
}
