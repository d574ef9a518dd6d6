//! Plan generation: a bounded read-only sub-loop that produces a parseable
//! plan document, repairs it to a quality bar, and persists it.

use crate::callbacks::QuestionHandler;
use crate::decompose::{self, TaskComplexity};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use crate::executor::{CodingAgent, GenerationPhase, collect_stream};
use crate::history::take_chars;
use crate::plan::{self, Plan};
use crate::tools::special;
use codex::chat::{ContentBlock, ImageSource, Message, MessageContent};
use codex::ToolDefinition;
use futures::future::join_all;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

static FILE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_\-./]+\.[A-Za-z]{1,5}").unwrap());
static STEP_HAS_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_\-./]+\.[A-Za-z]{1,5}").unwrap());
static VERIFY_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(verify|test|lint|check|validate)\b").unwrap());
static AUDIT_KEYWORDS: &[&str] = &[
    "audit",
    "review",
    "analyze",
    "analyse",
    "find all",
    "rip apart",
    "end to end",
    "security",
];

const QUESTION_DEADLINE: Duration = Duration::from_secs(300);

impl CodingAgent {
    /// Generate a plan through an agentic loop with read-only tools. Returns
    /// the parsed step list, or `None` when planning fails or is cancelled.
    #[tracing::instrument(name = "agent.run_plan", skip_all, fields(task_chars = task.len()))]
    pub async fn run_plan(
        &mut self,
        task: &str,
        sink: Arc<dyn EventSink>,
        question: Option<Arc<dyn QuestionHandler>>,
        user_images: Vec<ImageSource>,
    ) -> Result<Option<Vec<String>>, AgentError> {
        self.cancelled.store(false, Ordering::SeqCst);
        self.current_plan = None;

        // Scout only when no auto-context and this is the first message;
        // planning has the same tools and fills gaps itself.
        let has_semantic = task.contains("<semantic_context>");
        let has_structure = task.contains("<project_structure>");
        if self.config.scout_enabled
            && self.history.is_empty()
            && !has_semantic
            && !has_structure
        {
            if let Some(mut context) = self.run_scout(task, &sink).await {
                let max_scout = self.history_manager.scale(5000);
                if context.len() > max_scout {
                    context = format!(
                        "{}\n... (scout context truncated)",
                        take_chars(&context, max_scout)
                    );
                }
                self.scout_context = Some(context);
            }
        } else if has_semantic || has_structure {
            info!("skipping scout — auto-context already contains semantic/structure context");
        }

        self.emit(
            &sink,
            AgentEvent::PhaseStart {
                name: "plan".to_string(),
                phase: None,
                total: None,
                phase_type: None,
                strategy: None,
            },
        )
        .await;

        let mut task_for_plan = task.to_string();
        if self.config.task_refinement_enabled {
            if let Some(refined) = self.refine_task(task, &sink).await {
                task_for_plan = refined;
            }
        }

        self.task_complexity = Self::estimate_task_complexity(&task_for_plan, "", None);
        info!("task complexity estimated: {}", self.task_complexity.as_str());

        let plan_system = crate::prompts::compose_system_prompt(
            crate::prompts::PromptPhase::Plan,
            self.backend.working_directory(),
            &self.registry.names(),
            &self.detected_language,
            Some(self.task_complexity.as_str()),
        );
        let plan_config = self.generation_config_for_phase(GenerationPhase::Plan, None);

        let mut plan_user = task_for_plan.clone();
        if let Some(ctx) = &self.scout_context {
            plan_user = format!(
                "<codebase_context>\n{}\n</codebase_context>\n\n{}",
                ctx, plan_user
            );
        }
        let project_docs = crate::prompts::load_project_docs(&self.backend).await;
        if !project_docs.is_empty() {
            plan_user = format!(
                "<project_context>\n{}\n</project_context>\n\n{}",
                project_docs, plan_user
            );
        }

        let first_content = if user_images.is_empty() {
            MessageContent::Text(plan_user)
        } else {
            let mut blocks = vec![ContentBlock::Text { text: plan_user }];
            for source in &user_images {
                blocks.push(ContentBlock::Image {
                    source: source.clone(),
                });
            }
            MessageContent::Blocks(blocks)
        };
        let mut plan_messages = vec![Message {
            role: codex::chat::Role::User,
            content: first_content,
        }];

        let task_lower = task.to_lowercase();
        let is_audit = AUDIT_KEYWORDS.iter().any(|kw| task_lower.contains(kw));
        let max_plan_iters = if is_audit {
            40
        } else if self.task_complexity == TaskComplexity::High {
            25
        } else {
            12
        };
        let nudge_threshold = if is_audit {
            20
        } else if self.task_complexity == TaskComplexity::High {
            8
        } else {
            5
        };

        let plan_tools: Vec<ToolDefinition> = {
            let mut tools = self.registry.safe_definitions();
            if question.is_some() {
                tools.push(special::ask_user_question_definition());
            }
            tools
        };

        let mut plan_text = String::new();
        let mut accumulated_texts: Vec<String> = Vec::new();
        let mut nudge_sent = false;

        for plan_iter in 0..max_plan_iters {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(None);
            }

            self.emit(
                &sink,
                AgentEvent::ScoutProgress {
                    content: format!(
                        "Planning — {}...",
                        if plan_iter < 3 {
                            "reading codebase"
                        } else {
                            "analyzing & planning"
                        }
                    ),
                },
            )
            .await;

            if plan_iter >= nudge_threshold && !nudge_sent {
                nudge_sent = true;
                plan_messages.push(Message::user(
                    "You have gathered sufficient context. Write the complete plan document \
                     NOW. You may read 1-2 more files if absolutely critical, but prioritize \
                     producing the plan. Include all findings and steps — don't leave \
                     anything out."
                        .to_string(),
                ));
            }

            let iter_tools = if plan_iter < max_plan_iters - 1 {
                Some(plan_tools.as_slice())
            } else {
                None
            };
            self.trim_plan_messages(&mut plan_messages);

            let response = match self
                .stream_plan_call(&plan_messages, &plan_system, iter_tools, &plan_config, &sink)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("plan stream failed: {}", e);
                    self.emit(
                        &sink,
                        AgentEvent::Error {
                            message: format!("Planning failed: {}", e),
                        },
                    )
                    .await;
                    return Ok(None);
                }
            };
            if response.cancelled || self.cancelled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.usage.add(&response.usage);

            let text = response.text();
            if !text.trim().is_empty() {
                accumulated_texts.push(text.trim().to_string());
            }
            plan_messages.push(Message::assistant(response.content.clone()));

            if response.tool_uses.is_empty() {
                // Select the best (longest) accumulated text as the plan.
                plan_text = accumulated_texts
                    .iter()
                    .max_by_key(|t| t.len())
                    .cloned()
                    .unwrap_or_default();
                info!(
                    "plan loop ended at iter {}: {} text blocks, selected {} chars",
                    plan_iter,
                    accumulated_texts.len(),
                    plan_text.len()
                );
                break;
            }

            // Clarifying questions route to the caller; read-only tools run
            // in parallel.
            let mut tool_results: Vec<ContentBlock> = Vec::new();
            let mut other_calls = Vec::new();
            for call in &response.tool_uses {
                if call.name == special::ASK_USER_QUESTION {
                    let q = call
                        .input
                        .get("question")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    let context = call
                        .input
                        .get("context")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    let options = call
                        .input
                        .get("options")
                        .and_then(|v| v.as_array())
                        .map(|a| {
                            a.iter()
                                .map(|o| o.as_str().map(str::to_string).unwrap_or_default())
                                .collect::<Vec<_>>()
                        });
                    let result_text = match &question {
                        Some(handler) if !q.is_empty() => {
                            match tokio::time::timeout(
                                QUESTION_DEADLINE,
                                handler.request_answer(q, context, &call.id, options),
                            )
                            .await
                            {
                                Ok(Ok(answer)) => format!("User answered: {}", answer),
                                Ok(Err(e)) => {
                                    format!("Clarification failed or skipped: {}", e)
                                }
                                Err(_) => "Clarification timed out; proceed with your best \
                                           assumption."
                                    .to_string(),
                            }
                        }
                        _ => "Clarification not available; proceed with your best assumption."
                            .to_string(),
                    };
                    self.emit(
                        &sink,
                        AgentEvent::ToolResult {
                            tool_use_id: call.id.clone(),
                            tool_name: special::ASK_USER_QUESTION.to_string(),
                            success: true,
                            content: take_chars(&result_text, 200).to_string(),
                            duration_secs: None,
                            exit_code: None,
                        },
                    )
                    .await;
                    tool_results.push(ContentBlock::tool_result(&call.id, result_text));
                } else {
                    other_calls.push(call.clone());
                }
            }

            if !other_calls.is_empty() {
                let ctx = self.tool_context();
                let futures: Vec<_> = other_calls
                    .iter()
                    .map(|call| {
                        let registry = self.registry.clone();
                        let ctx = ctx.clone();
                        let call = call.clone();
                        async move {
                            let result =
                                registry.execute(&call.name, call.input.clone(), &ctx).await;
                            (call, result)
                        }
                    })
                    .collect();
                for (call, result) in join_all(futures).await {
                    let mut text = result.text();
                    if text.len() > 10_000 {
                        text = self.history_manager.compress_tool_result(
                            &text,
                            &call.name,
                            false,
                        );
                        if text.len() > 15_000 {
                            let lines: Vec<&str> = text.lines().collect();
                            text = format!(
                                "{}\n... ({} lines omitted) ...",
                                lines[..80.min(lines.len())].join("\n"),
                                lines.len().saturating_sub(80)
                            );
                        }
                    }
                    self.emit(
                        &sink,
                        AgentEvent::ToolResult {
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            success: result.success,
                            content: take_chars(&text, 200).to_string(),
                            duration_secs: None,
                            exit_code: None,
                        },
                    )
                    .await;
                    tool_results.push(if result.success {
                        ContentBlock::tool_result(&call.id, text)
                    } else {
                        ContentBlock::error_result(&call.id, text)
                    });
                }
            }

            plan_messages.push(Message::user(tool_results));
        }

        // Force a conclusion if the loop exhausted without a plan document.
        if plan_text.is_empty() {
            self.emit(
                &sink,
                AgentEvent::ScoutProgress {
                    content: "Planning: finalizing plan document...".to_string(),
                },
            )
            .await;
            let conclusion = if is_audit {
                "STOP reading files. Output the COMPLETE audit findings NOW.\n\nStart \
                 directly with '# Audit Findings' — no preamble, no 'let me verify', no \
                 commentary before the findings. Just the document.\n\nOrganize by severity \
                 (Critical > High > Medium > Low). For each finding include: exact file \
                 path, line number(s), what the bug is, why it matters, and how to fix \
                 it.\n\nEnd with a prioritized fix plan. Include ALL findings — do not omit \
                 anything you discovered."
            } else {
                "STOP reading files. Output the COMPLETE implementation plan NOW.\n\nStart \
                 directly with '# Implementation Plan' — no preamble, no 'let me verify', \
                 no commentary before the plan. Just the plan document.\n\nInclude: Why, \
                 Approach, Affected Files table, numbered Steps with exact file paths and \
                 function names, Edge Cases & Risks, and Verification commands. Be thorough \
                 and specific."
            };
            plan_messages.push(Message::user(conclusion.to_string()));
            if let Ok(response) = self
                .stream_plan_call(&plan_messages, &plan_system, None, &plan_config, &sink)
                .await
            {
                self.usage.add(&response.usage);
                let text = response.text();
                if !text.trim().is_empty() {
                    accumulated_texts.push(text.trim().to_string());
                    plan_messages.push(Message::assistant(response.content));
                }
            }
            plan_text = accumulated_texts
                .iter()
                .max_by_key(|t| t.len())
                .cloned()
                .unwrap_or_default();
        }

        // Thinking fallback: a much larger thinking block can carry the plan.
        if plan_text.len() < 2_000 {
            let mut best_thinking = String::new();
            for message in &plan_messages {
                if message.role != codex::chat::Role::Assistant {
                    continue;
                }
                for block in message.blocks() {
                    match block {
                        ContentBlock::Thinking { thinking, .. }
                            if thinking.len() > best_thinking.len() =>
                        {
                            best_thinking = thinking.clone();
                        }
                        ContentBlock::Text { text } if text.len() > plan_text.len() => {
                            plan_text = text.clone();
                        }
                        _ => {}
                    }
                }
            }
            if !best_thinking.is_empty() && best_thinking.len() > plan_text.len() * 2 {
                info!(
                    "plan text was {} chars, using {}-char thinking block as plan",
                    plan_text.len(),
                    best_thinking.len()
                );
                plan_text = best_thinking;
            }
        }

        if plan_text.is_empty() {
            self.emit(
                &sink,
                AgentEvent::Error {
                    message: "Planning produced no output.".to_string(),
                },
            )
            .await;
            return Ok(None);
        }

        if let Some(extracted) = plan::extract_plan(&plan_text) {
            plan_text = extracted;
        }
        let mut steps = plan::parse_plan_steps(&plan_text);

        // Quality gate: at most two repair rounds.
        let mut repair_attempts = 0;
        while repair_attempts < 2
            && !self.plan_quality_sufficient(&task_for_plan, &plan_text, &steps)
        {
            repair_attempts += 1;
            self.emit(
                &sink,
                AgentEvent::ScoutProgress {
                    content: format!(
                        "Planning: refining plan quality (attempt {}) — requesting explicit \
                         multi-item checklist and actionable steps...",
                        repair_attempts
                    ),
                },
            )
            .await;
            let min_steps = if plan::task_looks_multi_item(&task_for_plan) {
                3
            } else {
                1
            };
            plan_messages.push(Message::user(format!(
                "The plan is close but needs these specific additions:\n1) Add at least {} \
                 numbered implementation steps with exact file paths\n2) Add a verification \
                 section (test/lint commands to run after changes)\n\nKeep everything you \
                 already have — just add the missing parts. Output the complete plan:",
                min_steps
            )));
            let Ok(response) = self
                .stream_plan_call(&plan_messages, &plan_system, None, &plan_config, &sink)
                .await
            else {
                break;
            };
            self.usage.add(&response.usage);
            let repaired = response.text().trim().to_string();
            if repaired.is_empty() {
                break;
            }
            plan_text = repaired;
            if let Some(extracted) = plan::extract_plan(&plan_text) {
                plan_text = extracted;
            }
            plan_messages.push(Message::assistant(response.content));
            steps = plan::parse_plan_steps(&plan_text);
        }

        // Capture file contents read during planning for build-phase reuse.
        let mut context_parts: Vec<String> = Vec::new();
        for message in &plan_messages {
            if message.role != codex::chat::Role::User {
                continue;
            }
            for block in message.blocks() {
                if let ContentBlock::ToolResult {
                    content,
                    is_error: false,
                    ..
                } = block
                {
                    if content.len() > 100 {
                        context_parts.push(take_chars(content, 3_000).to_string());
                    }
                }
            }
        }
        self.plan_context_summary =
            take_chars(&context_parts.join("\n---\n"), 30_000).to_string();

        let cleaned = plan::strip_plan_preamble(&plan_text);
        let title = plan::extract_plan_title(&cleaned);
        let decomposition = decompose::decompose_plan_steps(&steps, self.task_complexity);

        // Only persist plans with actionable steps — conversational output
        // makes garbage files.
        let plan_file = if steps.is_empty() {
            None
        } else {
            self.write_plan_file(&cleaned, &title).await
        };

        self.current_plan = Some(Plan {
            steps: steps.clone(),
            text: plan_text.clone(),
            title: title.clone(),
            file_path: plan_file.clone(),
            decomposition: decomposition.clone(),
        });
        self.plan_step_index = 0;

        self.emit(
            &sink,
            AgentEvent::PhasePlan {
                steps: steps.clone(),
                plan_text,
                plan_file,
                plan_title: title,
                decomposition,
            },
        )
        .await;

        Ok(Some(steps))
    }

    /// One streaming call of the plan loop, with events forwarded.
    async fn stream_plan_call(
        &self,
        messages: &[Message],
        system: &str,
        tools: Option<&[ToolDefinition]>,
        config: &codex::provider::GenerationConfig,
        sink: &Arc<dyn EventSink>,
    ) -> Result<crate::executor::AssembledResponse, codex::LLMError> {
        let stream = self
            .provider
            .stream(messages, system, tools, None, config)
            .await?;
        collect_stream(stream, sink, &self.cancelled, None).await
    }

    /// Trim the plan-phase message list in place. The plan loop keeps its own
    /// transcript independent of the main history, so it gets its own tiers:
    /// thinking drop, tool-result truncation, middle drop, emergency.
    pub(crate) fn trim_plan_messages(&self, messages: &mut Vec<Message>) {
        let context_window = self.history_manager.context_window();
        let reserved_output =
            64_000.min(codex::model::max_output_tokens(self.provider.model_id()) as u64 / 2);
        let usable = context_window.saturating_sub(reserved_output).max(1);

        let estimate = |messages: &[Message]| -> u64 {
            messages
                .iter()
                .map(|m| self.history_manager.message_tokens(m))
                .sum()
        };

        if estimate(messages) <= (usable as f64 * 0.60) as u64 {
            return;
        }

        // Tier 1: drop thinking from all but the last two messages.
        let keep_from = messages.len().saturating_sub(2);
        for message in messages[..keep_from].iter_mut() {
            if let Some(blocks) = message.blocks_mut() {
                blocks.retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
            }
        }
        if estimate(messages) <= (usable as f64 * 0.70) as u64 {
            return;
        }

        // Tier 2: truncate large tool results in older messages.
        for message in messages[..keep_from].iter_mut() {
            if let Some(blocks) = message.blocks_mut() {
                for block in blocks.iter_mut() {
                    if let ContentBlock::ToolResult { content, .. } = block {
                        if content.len() > 2_000 {
                            *content =
                                format!("{}\n... (trimmed) ...", take_chars(content, 1_000));
                        }
                    }
                }
            }
        }
        if estimate(messages) <= (usable as f64 * 0.80) as u64 {
            return;
        }

        // Tier 3: drop the oldest middle, keep first + last six.
        let keep_tail = 6.min(messages.len());
        if messages.len() > 1 + keep_tail {
            let first = messages[0].clone();
            let tail: Vec<Message> = messages[messages.len() - keep_tail..].to_vec();
            messages.clear();
            messages.push(first);
            messages.extend(tail);
        }
        if estimate(messages) <= (usable as f64 * 0.90) as u64 {
            return;
        }

        // Tier 4: emergency hard truncation.
        let last = messages.len().saturating_sub(1);
        for message in messages[..last].iter_mut() {
            match &mut message.content {
                MessageContent::Text(text) => {
                    if text.len() > 2_000 {
                        *text = format!("{} (trimmed)", take_chars(text, 1_000));
                    }
                }
                MessageContent::Blocks(blocks) => {
                    for block in blocks.iter_mut() {
                        match block {
                            ContentBlock::Text { text } if text.len() > 500 => {
                                *text = format!("{} (trimmed)", take_chars(text, 400));
                            }
                            ContentBlock::Thinking { thinking, .. } if thinking.len() > 500 => {
                                *thinking = format!("{} (trimmed)", take_chars(thinking, 400));
                            }
                            ContentBlock::ToolResult { content, .. } if content.len() > 500 => {
                                *content = format!("{} (trimmed)", take_chars(content, 400));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        info!(
            "plan context trimmed: ~{} tokens, {} messages",
            estimate(messages),
            messages.len()
        );
    }

    /// Estimate low/medium/high implementation complexity from keyword,
    /// scope, file-reference, and step-count signals.
    pub(crate) fn estimate_task_complexity(
        task: &str,
        plan_text: &str,
        steps: Option<&[String]>,
    ) -> TaskComplexity {
        let combined = format!("{}\n{}", task, plan_text).to_lowercase();
        let mut score = 0u32;

        const HIGH_KEYWORDS: &[&str] = &[
            "split",
            "decompose",
            "restructure",
            "migrate",
            "convert all",
            "rename across",
            "refactor into",
            "extract into",
            "move all",
            "rewrite",
            "overhaul",
            "reorganize",
        ];
        for kw in HIGH_KEYWORDS {
            if combined.contains(kw) {
                score += 3;
            }
        }

        const SCOPE_MARKERS: &[&str] = &[
            "all files",
            "every file",
            "across the codebase",
            "entire project",
            "each module",
        ];
        for marker in SCOPE_MARKERS {
            if combined.contains(marker) {
                score += 2;
            }
        }

        let unique_files: std::collections::HashSet<&str> = FILE_REF
            .find_iter(&combined)
            .map(|m| m.as_str())
            .filter(|f| f.contains('/') || f.matches('.').count() == 1)
            .collect();
        if unique_files.len() > 10 {
            score += 4;
        } else if unique_files.len() > 5 {
            score += 2;
        }

        let step_count = steps.map(|s| s.len()).unwrap_or(0);
        if step_count > 12 {
            score += 4;
        } else if step_count > 8 {
            score += 2;
        } else if step_count > 5 {
            score += 1;
        }

        if plan::task_looks_multi_item(task) {
            score += 1;
        }

        if score >= 6 {
            TaskComplexity::High
        } else if score >= 3 {
            TaskComplexity::Medium
        } else {
            TaskComplexity::Low
        }
    }

    /// Quality bar: high-complexity plans need ≥3 path-bearing actionable
    /// steps plus a verification step; medium needs 2 actionable; low 1.
    pub(crate) fn plan_quality_sufficient(
        &self,
        _task: &str,
        plan_text: &str,
        steps: &[String],
    ) -> bool {
        if plan_text.is_empty() || steps.is_empty() {
            return false;
        }
        let low = plan_text.to_lowercase();
        const STRUCTURE_MARKERS: &[&str] = &[
            "## steps",
            "## implementation",
            "## plan",
            "## approach",
            "### steps",
            "### implementation",
            "### plan",
            "**steps",
            "**implementation",
            "**approach",
            "1.",
            "1)",
            "- ",
        ];
        if !STRUCTURE_MARKERS.iter().any(|m| low.contains(m)) {
            return false;
        }

        let actionable = steps
            .iter()
            .filter(|s| plan::is_actionable_plan_step(s))
            .count();

        match self.task_complexity {
            TaskComplexity::High => {
                let with_paths = steps
                    .iter()
                    .filter(|s| plan::is_actionable_plan_step(s) && STEP_HAS_PATH.is_match(s))
                    .count();
                if with_paths < 3 {
                    return false;
                }
                steps.iter().any(|s| VERIFY_STEP.is_match(s))
            }
            TaskComplexity::Medium => actionable >= 2,
            TaskComplexity::Low => actionable >= 1,
        }
    }

    /// Persist the plan under `.bedrock-codex/plans/{title}.md`, appending a
    /// timestamp on collision.
    pub(crate) async fn write_plan_file(&mut self, cleaned: &str, title: &str) -> Option<String> {
        static ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
        let mut safe_title = ILLEGAL.replace_all(title, "").to_string();
        safe_title = take_chars(safe_title.trim(), 60)
            .trim_end_matches('.')
            .to_string();
        if safe_title.is_empty() {
            safe_title = "Plan".to_string();
        }

        let mut rel_path = format!(".bedrock-codex/plans/{}.md", safe_title);
        if self.backend.file_exists(&rel_path).await {
            let format = time::macros::format_description!(
                "[year][month][day]-[hour][minute][second]"
            );
            let timestamp = time::OffsetDateTime::now_utc()
                .format(&format)
                .unwrap_or_else(|_| "copy".to_string());
            rel_path = format!(".bedrock-codex/plans/{} ({}).md", safe_title, timestamp);
        }
        match self.backend.write_file(&rel_path, cleaned).await {
            Ok(()) => {
                info!("plan written to {}", rel_path);
                Some(rel_path)
            }
            Err(e) => {
                warn!("failed to write plan file: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use crate::config::AgentConfig;
    use crate::test_utils::{CollectingSink, MockProvider};
    use tempfile::TempDir;

    const PLAN_DOC: &str = "# Implementation Plan: Split utils\n\n## Steps\n\
        1. Create `utils/strings.py` with the string helpers from `utils.py`\n\
        2. Create `utils/numbers.py` with the numeric helpers from `utils.py`\n\
        3. Update all importers of `utils.py` and run tests to verify\n\n\
        ## Verification\nRun `pytest -q`.\n";

    fn quiet_config() -> AgentConfig {
        AgentConfig {
            scout_enabled: false,
            parallel_subagents_enabled: false,
            learning_loop_enabled: false,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn plan_run_produces_steps_and_persists() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        // One read, then the plan document.
        provider.push_stream(MockProvider::tool_turn(
            "Reading the module first.",
            &[("p1", "read_file", serde_json::json!({"path": "utils.py"}))],
        ));
        provider.push_stream(MockProvider::text_turn(PLAN_DOC));

        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        let module: String = (0..12)
            .map(|i| format!("def helper_{}(value):\n    return value + {}\n\n", i, i))
            .collect();
        backend.write_file("utils.py", &module).await.unwrap();
        let mut agent = CodingAgent::new(provider, backend.clone(), quiet_config()).await;
        // Split keyword drives complexity high so the gate checks paths.
        let sink = CollectingSink::new();
        let steps = agent
            .run_plan(
                "Split utils.py into utils/strings.py and utils/numbers.py and update all imports",
                sink.clone(),
                None,
                Vec::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert!(steps.len() >= 3);
        let plan = agent.current_plan().unwrap();
        assert_eq!(plan.title, "Split utils");
        assert!(!plan.decomposition.is_empty());
        let file = plan.file_path.clone().unwrap();
        assert!(file.starts_with(".bedrock-codex/plans/"));
        assert!(backend.file_exists(&file).await);

        // The phase_plan event carries the decomposition.
        assert!(sink.events().iter().any(|e| matches!(
            e,
            AgentEvent::PhasePlan { decomposition, .. } if !decomposition.is_empty()
        )));
        // Plan-phase tool reads were captured for build reuse.
        assert!(agent.plan_context_summary.contains("lines total"));
    }

    #[tokio::test]
    async fn plan_file_collision_gets_timestamp() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        backend
            .write_file(".bedrock-codex/plans/My Plan.md", "existing")
            .await
            .unwrap();
        let mut agent = CodingAgent::new(provider, backend, quiet_config()).await;
        let path = agent.write_plan_file("# My Plan\n", "My Plan").await.unwrap();
        assert_ne!(path, ".bedrock-codex/plans/My Plan.md");
        assert!(path.contains("My Plan ("));
    }

    #[test]
    fn complexity_estimation() {
        assert_eq!(
            CodingAgent::estimate_task_complexity("fix typo in readme", "", None),
            TaskComplexity::Low
        );
        assert_eq!(
            CodingAgent::estimate_task_complexity(
                "Split utils.py into utils/strings.py and utils/numbers.py and update all imports",
                "",
                None
            ),
            TaskComplexity::Medium
        );
        assert_eq!(
            CodingAgent::estimate_task_complexity(
                "Migrate and restructure each module across the codebase",
                "",
                None
            ),
            TaskComplexity::High
        );
    }

    #[tokio::test]
    async fn quality_gate_requires_verification_for_high() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        let mut agent = CodingAgent::new(provider, backend, quiet_config()).await;
        agent.task_complexity = TaskComplexity::High;

        let no_verify = "## Steps\n1. Edit `a.py` to add x\n2. Edit `b.py` to add y\n3. Edit `c.py` to add z\n";
        let steps = plan::parse_plan_steps(no_verify);
        assert!(!agent.plan_quality_sufficient("t", no_verify, &steps));

        let with_verify =
            format!("{}4. Run tests to verify the changes in `a.py`\n", no_verify);
        let steps = plan::parse_plan_steps(&with_verify);
        assert!(agent.plan_quality_sufficient("t", &with_verify, &steps));
    }

    #[tokio::test]
    async fn plan_trimming_caps_old_tool_results() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        let agent = CodingAgent::new(provider, backend, quiet_config()).await;

        let huge = "line\n".repeat(120_000);
        let mut messages = vec![Message::user("task")];
        for i in 0..10 {
            messages.push(Message::assistant(vec![ContentBlock::ToolUse {
                id: format!("t{}", i),
                name: "read_file".into(),
                input: serde_json::json!({"path": "x"}),
            }]));
            messages.push(Message::user(vec![ContentBlock::tool_result(
                format!("t{}", i),
                huge.clone(),
            )]));
        }
        let before: u64 = messages
            .iter()
            .map(|m| agent.history_manager.message_tokens(m))
            .sum();
        agent.trim_plan_messages(&mut messages);
        let after: u64 = messages
            .iter()
            .map(|m| agent.history_manager.message_tokens(m))
            .sum();
        assert!(after < before);
        assert_eq!(messages[0].text(), "task");
    }
}
