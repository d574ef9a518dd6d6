//! The core agentic loop: stream, dispatch, gate, repeat.

use super::stream::{AssembledResponse, collect_stream};
use super::CodingAgent;
use crate::callbacks::{ApprovalHandler, QuestionHandler};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use crate::history::take_chars;
use crate::tools::special;
use crate::verify;
use codex::chat::{ContentBlock, Message};
use codex::provider::GenerationConfig;
use codex::stream::StopReason;
use codex::ToolDefinition;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Outcome of one streaming attempt cycle.
enum StreamOutcome {
    Success(AssembledResponse),
    Interrupted,
    Failed,
    Cancelled,
}

static TRACE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"what\s+i\s+learned",
        r"why\s+it\s+matters",
        r"\bdecision\b",
        r"next\s+actions?",
        r"verification\s+status",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
    .collect()
});

impl CodingAgent {
    /// Core streaming agent loop with tool execution. Returns when the model
    /// ends a turn without tools (after the completion gates), the iteration
    /// budget is exhausted, or the run is cancelled.
    pub(crate) async fn agent_loop(
        &mut self,
        sink: &Arc<dyn EventSink>,
        approval: &Arc<dyn ApprovalHandler>,
        config: Option<&GenerationConfig>,
        question: Option<&Arc<dyn QuestionHandler>>,
    ) -> Result<(), AgentError> {
        let gen_config = config
            .cloned()
            .unwrap_or_else(|| self.default_generation_config());
        let mut iteration = 0usize;
        let soft_limit = (self.max_iterations as f64 * 0.85) as usize;

        while iteration < self.max_iterations && !self.cancelled.load(Ordering::SeqCst) {
            iteration += 1;

            // Guidance injected mid-task gets a visible user message.
            if let Some(guidance) = self.state.guidance.consume() {
                self.history.push(Message::user(format!(
                    "[USER GUIDANCE — mid-task correction from the user. Incorporate this \
                     into your current work immediately.]\n\n{}",
                    guidance
                )));
                self.emit(sink, AgentEvent::GuidanceApplied { content: guidance })
                    .await;
            }

            // One-time wrap-up nudge near the iteration budget.
            if iteration == soft_limit {
                self.history.push(Message::user(format!(
                    "[SYSTEM] You have used {} of {} iterations. You are approaching the \
                     limit. Please wrap up your current task — summarize what you've done \
                     so far and what remains, then stop.",
                    iteration, self.max_iterations
                )));
            }

            self.history_manager
                .trim(
                    &mut self.history,
                    &mut self.state.running_summary,
                    &self.provider,
                )
                .await;
            self.history_manager.repair(&mut self.history);

            let outcome = self
                .stream_with_retry(sink, &gen_config, question.is_some())
                .await?;

            let response = match outcome {
                StreamOutcome::Success(response) => response,
                StreamOutcome::Interrupted => {
                    self.emit(
                        sink,
                        AgentEvent::GuidanceInterrupt {
                            content: "Guidance received — restarting with your correction."
                                .to_string(),
                        },
                    )
                    .await;
                    continue;
                }
                StreamOutcome::Cancelled => {
                    self.emit(sink, AgentEvent::Cancelled).await;
                    return Ok(());
                }
                StreamOutcome::Failed => return Ok(()),
            };

            if self.cancelled.load(Ordering::SeqCst) {
                self.emit(sink, AgentEvent::Cancelled).await;
                return Ok(());
            }

            // Track plan step transitions announced in assistant text.
            for text in &response.text_blocks {
                if let Some(step) = self.detect_plan_step(text).await {
                    let total = self
                        .current_plan
                        .as_ref()
                        .map(|p| p.steps.len())
                        .unwrap_or(0);
                    self.emit(sink, AgentEvent::PlanStepProgress { step, total })
                        .await;
                }
            }

            // Whether the latest user message carried tool results, observed
            // before this assistant message is appended.
            let last_user_had_tool_results = self
                .history
                .last()
                .map(|m| m.role == codex::chat::Role::User && m.has_tool_results())
                .unwrap_or(false);

            if !response.content.is_empty() {
                self.history
                    .push(Message::assistant(response.content.clone()));
            }

            let tool_uses = response.tool_uses.clone();

            // Token cut-off with no tools: continue silently.
            if tool_uses.is_empty()
                && response
                    .stop_reason
                    .map(|r| r.is_token_cutoff())
                    .unwrap_or(false)
            {
                self.history.push(Message::user(
                    "[SYSTEM] Your previous response was cut off due to length. Continue \
                     from where you left off. If you were mid tool call, complete it. If \
                     you were explaining, briefly summarize progress and continue the task."
                        .to_string(),
                ));
                self.emit(
                    sink,
                    AgentEvent::StreamRecovering {
                        content: "Continuing automatically...".to_string(),
                    },
                )
                .await;
                continue;
            }

            if tool_uses.is_empty() {
                let assistant_text = response.text();

                // Gate 1: conversational completion — hand the turn back to
                // the user instead of declaring the task done.
                if !crate::history::HistoryManager::assistant_signals_completion(&assistant_text)
                    && !last_user_had_tool_results
                {
                    return Ok(());
                }

                // Gate 2: structured reasoning trace after tool work.
                if self.config.enforce_reasoning_trace
                    && last_user_had_tool_results
                    && !Self::has_structured_reasoning_trace(&assistant_text)
                    && self.reasoning_trace_repairs < 2
                {
                    self.reasoning_trace_repairs += 1;
                    self.history.push(Message::user(
                        "[SYSTEM] Before finishing, provide a structured reasoning trace \
                         using these exact headings:\n- What I learned\n- Why it matters\n\
                         - Decision\n- Next actions\n- Verification status\n\nThen conclude."
                            .to_string(),
                    ));
                    self.emit(
                        sink,
                        AgentEvent::StreamRecovering {
                            content: "Requesting structured reasoning trace before completion..."
                                .to_string(),
                        },
                    )
                    .await;
                    continue;
                }

                // Gate 3: deterministic verification before done.
                if self.config.deterministic_verification_gate
                    && !self.snapshots.is_empty()
                    && !self.deterministic_verification_done
                    && self.verification_gate_attempts < 2
                {
                    let mut existing = Vec::new();
                    for path in self.snapshots.tracked_paths() {
                        if self.backend.file_exists(&path).await {
                            existing.push(path);
                        }
                    }
                    if existing.is_empty() {
                        // Everything tracked was deleted; nothing to verify.
                        self.deterministic_verification_done = true;
                    } else {
                        let (gate_ok, gate_summary) = verify::run_deterministic_gate(
                            &self.backend,
                            &self.registry,
                            &self.tool_context(),
                            &self.config,
                            &existing,
                            sink,
                        )
                        .await;
                        self.verification_gate_attempts += 1;
                        if !gate_ok {
                            if self.config.learning_loop_enabled {
                                self.state
                                    .record_failure_pattern(
                                        &self.backend,
                                        "verification_gate_failure",
                                        take_chars(&gate_summary, 2000),
                                        json!({}),
                                    )
                                    .await;
                            }
                            if self.verification_gate_attempts < 2 {
                                self.history.push(Message::user(format!(
                                    "[SYSTEM] Verification found issues. Try to fix them, but \
                                     if the issues are pre-existing or unrelated to your \
                                     changes, just confirm the task is complete and move on. \
                                     Do NOT loop — one fix attempt only.\n\n{}",
                                    gate_summary
                                )));
                                self.emit(
                                    sink,
                                    AgentEvent::StreamRecovering {
                                        content: "Verification found issues — one fix attempt..."
                                            .to_string(),
                                    },
                                )
                                .await;
                                continue;
                            }
                        }
                        // Passed or exhausted: surface the summary and let
                        // the model conclude.
                        self.deterministic_verification_done = true;
                        self.history.push(Message::user(format!(
                            "[SYSTEM] Verification complete:\n\n{}\n\nProvide final \
                             completion update and finish.",
                            gate_summary
                        )));
                        continue;
                    }
                }

                // Done.
                let context_usage_pct = self
                    .history_manager
                    .usage_pct(&self.history, &self.system_prompt);
                self.emit(
                    sink,
                    AgentEvent::Done {
                        input_tokens: self.usage.input_tokens,
                        output_tokens: self.usage.output_tokens,
                        cache_read_tokens: self.usage.cache_read_tokens,
                        context_usage_pct,
                    },
                )
                .await;
                return Ok(());
            }

            // Dispatch the tool batch.
            let results = self
                .execute_tools_parallel(&tool_uses, sink, approval, question)
                .await;
            let mut capped = self.cap_tool_results(results);

            // Post-edit verification hint.
            let write_paths: Vec<String> = tool_uses
                .iter()
                .filter(|c| {
                    matches!(
                        self.registry.kind_of(&c.name),
                        crate::tools::ToolKind::FileMutating
                    )
                })
                .filter_map(|c| {
                    c.input
                        .get("path")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .collect();
            if !write_paths.is_empty() {
                capped.push(ContentBlock::text(format!(
                    "[System] You just modified: {}. Verify your changes: re-read the \
                     modified sections to confirm edits applied correctly. Run lint_file on \
                     each changed file to catch any syntax errors or issues. Fix any \
                     problems before proceeding to the next step.",
                    write_paths.join(", ")
                )));
            }

            // Strategy escalation on repeated failures.
            let usage_fraction = self
                .history_manager
                .usage_fraction(&self.history, &self.system_prompt);
            if let Some(escalation) = self.suggest_strategy_escalation(&capped, usage_fraction) {
                capped.push(ContentBlock::text(format!("[STRATEGY HINT]\n{}", escalation)));
                self.emit(
                    sink,
                    AgentEvent::StrategyEscalation {
                        content: escalation,
                    },
                )
                .await;
            }

            // Pending guidance rides along with the tool results.
            if let Some(guidance) = self.state.guidance.consume() {
                capped.push(ContentBlock::text(format!(
                    "[USER GUIDANCE — mid-task correction from the user. Incorporate this \
                     into your current work immediately.]\n\n{}",
                    guidance
                )));
                self.emit(sink, AgentEvent::GuidanceApplied { content: guidance })
                    .await;
            }

            self.history.push(Message::user(capped));
        }

        if iteration >= self.max_iterations {
            self.emit(
                sink,
                AgentEvent::Error {
                    message: format!(
                        "Reached maximum iterations ({}). Stopping.",
                        self.max_iterations
                    ),
                },
            )
            .await;
        }
        Ok(())
    }

    /// One stream call with per-attempt retry, exponential backoff, and
    /// history rollback on exhaustion. Token counters only advance on a
    /// successful attempt, so retries are counter-idempotent.
    async fn stream_with_retry(
        &mut self,
        sink: &Arc<dyn EventSink>,
        gen_config: &GenerationConfig,
        questions_enabled: bool,
    ) -> Result<StreamOutcome, AgentError> {
        let max_retries = self.stream_max_retries();
        let backoff_base = self.config.stream_retry_backoff_base;

        let mut tools: Vec<ToolDefinition> = self.registry.definitions();
        if questions_enabled {
            tools.push(special::ask_user_question_definition());
        }
        let base_prompt = self.system_prompt.clone();
        let system = self.effective_system_prompt(&base_prompt).await;

        for attempt in 1..=max_retries {
            if attempt > 1 {
                self.emit(
                    sink,
                    AgentEvent::StreamRetry {
                        content: format!(
                            "Connection lost — retrying ({}/{})...",
                            attempt, max_retries
                        ),
                        attempt,
                        max_retries,
                    },
                )
                .await;
            }

            let stream_result = self
                .provider
                .stream(&self.history, &system, Some(&tools), None, gen_config)
                .await;

            let error = match stream_result {
                Ok(stream) => {
                    match collect_stream(
                        stream,
                        sink,
                        &self.cancelled,
                        Some(self.state.guidance.as_ref()),
                    )
                    .await
                    {
                        Ok(response) => {
                            if response.cancelled {
                                return Ok(StreamOutcome::Cancelled);
                            }
                            if response.interrupted {
                                return Ok(StreamOutcome::Interrupted);
                            }
                            self.usage.add(&response.usage);
                            self.consecutive_stream_errors = 0;
                            self.last_stream_error_sig.clear();
                            return Ok(StreamOutcome::Success(response));
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            if retryable && attempt < max_retries {
                let wait_secs = backoff_base * 2f64.powi(attempt as i32 - 1);
                warn!(
                    "stream error (attempt {}/{}), retrying in {:.1}s: {}",
                    attempt, max_retries, wait_secs, error
                );
                self.emit(
                    sink,
                    AgentEvent::StreamRecovering {
                        content: format!("Connection lost — retrying in {:.0}s...", wait_secs),
                    },
                )
                .await;
                tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
                continue;
            }

            // Non-retryable, or retries exhausted.
            let err_msg = if retryable {
                format!("Stream failed after {} retries: {}", max_retries, error)
            } else {
                error.to_string()
            };
            warn!("stream error (attempt {}): {}", attempt, error);

            let error_sig = take_chars(&error.to_string().to_lowercase(), 200).to_string();
            if error_sig == self.last_stream_error_sig {
                self.consecutive_stream_errors += 1;
            } else {
                self.consecutive_stream_errors = 1;
                self.last_stream_error_sig = error_sig;
            }

            if self.consecutive_stream_errors >= 3 {
                // Rollbacks aren't helping; repair the transcript in place to
                // avoid unbounded loss.
                warn!(
                    "recurring stream error ({}x) — repairing history instead of rolling back",
                    self.consecutive_stream_errors
                );
                self.history_manager.repair(&mut self.history);
            } else {
                let mut rolled_back = 0;
                if self
                    .history
                    .last()
                    .map(|m| m.role == codex::chat::Role::User)
                    .unwrap_or(false)
                {
                    self.history.pop();
                    rolled_back += 1;
                }
                if self
                    .history
                    .last()
                    .map(|m| {
                        m.role == codex::chat::Role::Assistant && !m.tool_use_ids().is_empty()
                    })
                    .unwrap_or(false)
                {
                    self.history.pop();
                    rolled_back += 1;
                }
                info!(
                    "rolled back {} messages after stream failure ({} remain, consecutive={})",
                    rolled_back,
                    self.history.len(),
                    self.consecutive_stream_errors
                );
            }

            if self.config.learning_loop_enabled {
                self.state
                    .record_failure_pattern(
                        &self.backend,
                        "stream_failure",
                        take_chars(&err_msg, 1200),
                        json!({"attempt": attempt, "max_retries": max_retries}),
                    )
                    .await;
            }

            let user_msg = if error.is_length_related() {
                self.history_manager
                    .trim(
                        &mut self.history,
                        &mut self.state.running_summary,
                        &self.provider,
                    )
                    .await;
                "Response hit a length limit. Conversation was compacted. Re-send your \
                 message or break the task into smaller steps."
                    .to_string()
            } else {
                format!(
                    "Streaming error: {}\n\nYour message was rolled back — you can re-send it.",
                    err_msg
                )
            };
            self.emit(sink, AgentEvent::StreamFailed { content: user_msg })
                .await;
            return Ok(StreamOutcome::Failed);
        }

        // Unreachable: every path in the loop returns.
        Ok(StreamOutcome::Failed)
    }

    fn stream_max_retries(&self) -> usize {
        self.config.stream_max_retries.max(1)
    }

    /// Per-result char cap scaled by context usage and window size.
    pub(crate) fn adaptive_result_cap(&self) -> usize {
        let usage = self
            .history_manager
            .usage_fraction(&self.history, &self.system_prompt);
        let factor = self.history_manager.window_factor();
        let base = if usage < 0.25 {
            50_000
        } else if usage < 0.40 {
            30_000
        } else if usage < 0.55 {
            20_000
        } else if usage < 0.70 {
            14_000
        } else {
            8_000
        };
        (base as f64 * factor) as usize
    }

    /// Cap tool result content at ingestion: head + tail with an explicit
    /// pointer at `read_file` offset/limit for the rest.
    pub(crate) fn cap_tool_results(&self, results: Vec<ContentBlock>) -> Vec<ContentBlock> {
        let cap = self.adaptive_result_cap();
        results
            .into_iter()
            .map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } if content.len() > cap => {
                    let lines: Vec<&str> = content.lines().collect();
                    let mut text = if lines.len() > 50 {
                        let head_n = (cap / 400).max(20);
                        let tail_n = (cap / 800).max(10);
                        format!(
                            "[Large output — excerpt below. Use read_file with offset/limit \
                             for full content.]\n\n{}\n\n... ({} lines omitted) ...\n\n{}",
                            lines[..head_n.min(lines.len())].join("\n"),
                            lines.len().saturating_sub(head_n + tail_n),
                            lines[lines.len().saturating_sub(tail_n)..].join("\n"),
                        )
                    } else {
                        format!(
                            "{}\n... (truncated; use read_file with offset/limit for full \
                             content) ...",
                            take_chars(&content, cap.saturating_sub(200))
                        )
                    };
                    if text.len() > cap {
                        text = format!("{}\n... (excerpt capped) ...", take_chars(&text, cap));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content: text,
                        is_error,
                    }
                }
                other => other,
            })
            .collect()
    }

    /// Case-insensitive check for 4 of the 5 reasoning-trace headings.
    pub(crate) fn has_structured_reasoning_trace(text: &str) -> bool {
        if text.trim().len() < 40 {
            return false;
        }
        let hits = TRACE_PATTERNS.iter().filter(|re| re.is_match(text)).count();
        hits >= 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use crate::callbacks::ApproveAll;
    use crate::config::AgentConfig;
    use crate::executor::RunOptions;
    use crate::test_utils::{CollectingSink, MockProvider};
    use codex::{LLMError, LlmProvider};
    use tempfile::TempDir;

    async fn setup(
        dir: &TempDir,
        provider: Arc<MockProvider>,
        config: AgentConfig,
    ) -> CodingAgent {
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        CodingAgent::new(provider, backend, config).await
    }

    fn quiet_config() -> AgentConfig {
        AgentConfig {
            scout_enabled: false,
            enforce_reasoning_trace: false,
            deterministic_verification_gate: false,
            learning_loop_enabled: false,
            stream_retry_backoff_base: 0.01,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn single_edit_run_emits_done_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::tool_turn(
            "Working on it",
            &[(
                "t1",
                "edit_file",
                serde_json::json!({
                    "path": "src/app.py",
                    "old_string": "DEBUG=False",
                    "new_string": "DEBUG=True"
                }),
            )],
        ));
        provider.push_stream(MockProvider::text_turn(
            "The task is complete. DEBUG is now enabled.",
        ));

        let mut agent = setup(&dir, provider, quiet_config()).await;
        agent
            .backend
            .write_file("src/app.py", "DEBUG=False\n")
            .await
            .unwrap();

        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run(
                "In src/app.py replace the string 'DEBUG=False' with 'DEBUG=True'.",
                sink.clone(),
                approval,
                None,
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(sink.count_done(), 1);
        assert_eq!(sink.count_cancelled(), 0);
        assert_eq!(sink.count_errors(), 0);
        assert_eq!(
            agent.backend.read_file("src/app.py").await.unwrap(),
            "DEBUG=True\n"
        );
        // Exactly one snapshot entry, and revert restores the file.
        assert_eq!(agent.snapshots.len(), 1);
        let reverted = agent.revert_all().await;
        assert_eq!(reverted.len(), 1);
        assert_eq!(
            agent.backend.read_file("src/app.py").await.unwrap(),
            "DEBUG=False\n"
        );
        // Token counters came through the stream.
        let done = sink
            .events()
            .into_iter()
            .find(|e| matches!(e, AgentEvent::Done { .. }))
            .unwrap();
        if let AgentEvent::Done {
            input_tokens,
            output_tokens,
            ..
        } = done
        {
            assert!(input_tokens > 0);
            assert!(output_tokens > 0);
        }
    }

    #[tokio::test]
    async fn history_pairing_invariant_after_run() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::tool_turn(
            "",
            &[("t1", "read_file", serde_json::json!({"path": "x.txt"}))],
        ));
        provider.push_stream(MockProvider::text_turn("The task is complete."));

        let mut agent = setup(&dir, provider, quiet_config()).await;
        agent.backend.write_file("x.txt", "content").await.unwrap();

        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run("read x.txt", sink.clone(), approval, None, RunOptions::default())
            .await
            .unwrap();

        // Every assistant tool_use is answered by the following user message.
        for (i, msg) in agent.history.iter().enumerate() {
            let ids = msg.tool_use_ids();
            if !ids.is_empty() {
                let next = &agent.history[i + 1];
                let result_ids = next.tool_result_ids();
                for id in ids {
                    assert!(result_ids.contains(&id), "missing result for {}", id);
                }
            }
        }
    }

    #[tokio::test]
    async fn stream_failure_retries_then_succeeds_with_clean_counters() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::failing_turn(LLMError::HttpError(
            "connection reset".into(),
        )));
        provider.push_stream(MockProvider::text_turn("The task is complete."));

        let mut agent = setup(&dir, provider, quiet_config()).await;
        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run("quick task", sink.clone(), approval, None, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(sink.count_done(), 1);
        // Usage equals what a clean single attempt reports: the failed
        // attempt's partial tokens were discarded.
        assert_eq!(agent.usage.input_tokens, 100);
        assert_eq!(agent.usage.output_tokens, 50);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::StreamRecovering { .. })));
    }

    #[tokio::test]
    async fn non_retryable_failure_rolls_back_and_reports() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(vec![Err(LLMError::AuthError("bad creds".into()))]);

        let mut agent = setup(&dir, provider, quiet_config()).await;
        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run("task", sink.clone(), approval, None, RunOptions::default())
            .await
            .unwrap();

        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::StreamFailed { .. })));
        assert_eq!(sink.count_done(), 0);
        // The user message was rolled back.
        assert!(agent.history.is_empty());
    }

    #[tokio::test]
    async fn max_tokens_cutoff_auto_continues() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(vec![
            Ok(codex::stream::StreamChunk::TextStart),
            Ok(codex::stream::StreamChunk::TextDelta {
                content: "partial explanation".into(),
            }),
            Ok(codex::stream::StreamChunk::TextEnd),
            Ok(codex::stream::StreamChunk::MessageEnd {
                stop_reason: Some(StopReason::MaxTokens),
                usage: codex::Usage::default(),
            }),
        ]);
        provider.push_stream(MockProvider::text_turn("The task is complete."));

        let mut agent = setup(&dir, provider, quiet_config()).await;
        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run("task", sink.clone(), approval, None, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(sink.count_done(), 1);
        // The continuation message was injected between the two turns.
        assert!(agent
            .history
            .iter()
            .any(|m| m.text().contains("cut off due to length")));
    }

    #[tokio::test]
    async fn conversational_response_exits_without_done() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::text_turn(
            "Which database are you using for sessions?",
        ));

        let mut agent = setup(&dir, provider, quiet_config()).await;
        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run("set up sessions", sink.clone(), approval, None, RunOptions::default())
            .await
            .unwrap();

        // Loop exits so the caller can accept another user message.
        assert_eq!(sink.count_done(), 0);
        assert_eq!(sink.count_errors(), 0);
    }

    #[tokio::test]
    async fn reasoning_trace_gate_requests_structure() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::tool_turn(
            "",
            &[("t1", "read_file", serde_json::json!({"path": "x.txt"}))],
        ));
        // Completion claim without the structured headings.
        provider.push_stream(MockProvider::text_turn("The task is complete."));
        // After the nudge, a structured conclusion.
        provider.push_stream(MockProvider::text_turn(
            "What I learned: the file was fine.\nWhy it matters: no bug.\n\
             Decision: no change needed.\nNext actions: none.\n\
             Verification status: clean. Task complete.",
        ));

        let config = AgentConfig {
            enforce_reasoning_trace: true,
            ..quiet_config()
        };
        let mut agent = setup(&dir, provider, config).await;
        agent.backend.write_file("x.txt", "data").await.unwrap();

        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        agent
            .run("inspect x.txt", sink.clone(), approval, None, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(sink.count_done(), 1);
        assert!(agent
            .history
            .iter()
            .any(|m| m.text().contains("structured reasoning trace")));
    }

    #[tokio::test]
    async fn cancellation_emits_single_cancelled() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::text_turn("The task is complete."));
        let mut agent = setup(&dir, provider, quiet_config()).await;
        agent.cancelled.store(true, Ordering::SeqCst);

        let sink = CollectingSink::new();
        let approval: Arc<dyn ApprovalHandler> = Arc::new(ApproveAll);
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        agent.history.push(Message::user("task"));
        agent
            .agent_loop(&dyn_sink, &approval, None, None)
            .await
            .unwrap();
        // Loop never started an iteration; no done, no cancelled duplicates.
        assert_eq!(sink.count_done(), 0);
        assert!(sink.count_cancelled() <= 1);
    }

    #[test]
    fn reasoning_trace_threshold() {
        let good = "What I learned: a. Why it matters: b. Decision: c. Next actions: d.";
        assert!(CodingAgent::has_structured_reasoning_trace(good));
        let partial = "Decision: do it. Next actions: none.";
        assert!(!CodingAgent::has_structured_reasoning_trace(partial));
    }

    #[tokio::test]
    async fn adaptive_cap_shrinks_with_usage() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        let mut agent = setup(&dir, provider, quiet_config()).await;
        // Near-empty history: full cap.
        assert_eq!(agent.adaptive_result_cap(), 50_000);
        // Inflate history past 70% of the 200K window.
        let big = "x".repeat(200_000 * 35 / 10);
        for _ in 0..2 {
            agent.history.push(Message::user(big.clone()));
        }
        assert_eq!(agent.adaptive_result_cap(), 8_000);
    }
}
