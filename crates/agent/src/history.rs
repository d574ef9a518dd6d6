//! Context-window management: token estimation, tiered trimming, tool-result
//! compression, summarization, and structural repair of the transcript.

use codex::chat::{ContentBlock, Message, MessageContent, Role};
use codex::provider::GenerationConfig;
use codex::LlmProvider;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Chars-per-token estimate for mixed English/code.
const CHARS_PER_TOKEN: f64 = 3.5;

/// Take at most `n` chars from the front of a string, on char boundaries.
pub fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Take at most `n` chars from the tail of a string.
fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let skip = count - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Manages the transcript against a model's context window.
pub struct HistoryManager {
    context_window: u64,
    fast_model: String,
}

impl HistoryManager {
    pub fn new(context_window: u64, fast_model: impl Into<String>) -> Self {
        Self {
            context_window,
            fast_model: fast_model.into(),
        }
    }

    pub fn context_window(&self) -> u64 {
        self.context_window
    }

    /// Window scale factor: 1.0 at 200K, linear above, capped at 3.0.
    pub fn window_factor(&self) -> f64 {
        (self.context_window as f64 / 200_000.0).clamp(1.0, 3.0)
    }

    /// Scale a heuristic limit by the window factor.
    pub fn scale(&self, base: usize) -> usize {
        (base as f64 * self.window_factor()) as usize
    }

    // ── token estimation ────────────────────────────────────────────

    pub fn estimate_tokens(&self, text: &str) -> u64 {
        ((text.len() as f64 / CHARS_PER_TOKEN) as u64).max(1)
    }

    fn block_tokens(&self, block: &ContentBlock) -> u64 {
        // 10 tokens of structural overhead per block.
        let mut total = 10;
        match block {
            ContentBlock::Text { text } => total += self.estimate_tokens(text),
            ContentBlock::Thinking { thinking, .. } => total += self.estimate_tokens(thinking),
            ContentBlock::ToolUse { input, .. } | ContentBlock::ServerToolUse { input, .. } => {
                total += self.estimate_tokens(&input.to_string())
            }
            ContentBlock::ToolResult { content, .. } => total += self.estimate_tokens(content),
            ContentBlock::Image { source } => total += self.estimate_tokens(&source.data),
            ContentBlock::WebSearchToolResult { content, .. } => {
                total += self.estimate_tokens(&content.to_string())
            }
        }
        total
    }

    pub fn message_tokens(&self, message: &Message) -> u64 {
        match &message.content {
            MessageContent::Text(text) => self.estimate_tokens(text) + 5,
            MessageContent::Blocks(blocks) => {
                blocks.iter().map(|b| self.block_tokens(b)).sum::<u64>() + 5
            }
        }
    }

    pub fn total_history_tokens(&self, history: &[Message]) -> u64 {
        history.iter().map(|m| self.message_tokens(m)).sum()
    }

    /// History total plus a real estimate of the composed system prompt.
    pub fn current_token_estimate(&self, history: &[Message], system_prompt: &str) -> u64 {
        let base = self.total_history_tokens(history);
        if system_prompt.is_empty() {
            base + 4_000
        } else {
            base + self.estimate_tokens(system_prompt)
        }
    }

    // ── tool result compression ─────────────────────────────────────

    /// File paths referenced by tool inputs in the last few messages — the
    /// working set whose reads stay hot.
    fn working_set_paths(&self, history: &[Message]) -> HashSet<String> {
        let horizon = self.scale(8);
        let start = history.len().saturating_sub(horizon);
        let mut paths = HashSet::new();
        for message in &history[start..] {
            for block in message.blocks() {
                if let ContentBlock::ToolUse { input, .. } = block {
                    if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                        paths.insert(path.to_string());
                    }
                }
            }
        }
        paths
    }

    /// Tool name that produced a given result id, found by walking backwards.
    fn tool_name_for_result(history: &[Message], tool_use_id: &str, before: usize) -> String {
        for message in history[..before.min(history.len())].iter().rev() {
            for block in message.blocks() {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    if id == tool_use_id {
                        return name.clone();
                    }
                }
            }
        }
        String::new()
    }

    /// Compress a large tool result with tool-type-aware rules. Hot file
    /// reads keep head+tail; cold reads collapse to structure.
    pub fn compress_tool_result(&self, text: &str, tool_name: &str, is_hot: bool) -> String {
        if text.len() < self.scale(500) {
            return text.to_string();
        }
        let lines: Vec<&str> = text.lines().collect();

        let is_file_view = matches!(tool_name, "read_file" | "Read");
        if is_file_view {
            if is_hot {
                let hot_limit = self.scale(60);
                if lines.len() > hot_limit {
                    let head_n = self.scale(30);
                    let tail_n = self.scale(10);
                    return format!(
                        "{}\n  ... ({} lines omitted, file in working set) ...\n{}",
                        lines[..head_n.min(lines.len())].join("\n"),
                        lines.len().saturating_sub(head_n + tail_n),
                        lines[lines.len().saturating_sub(tail_n)..].join("\n"),
                    );
                }
                return text.to_string();
            }
            let cold_limit = self.scale(40);
            if lines.len() > cold_limit {
                let structure: Vec<&str> = lines
                    .iter()
                    .filter(|line| {
                        let stripped = line
                            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '|' || c == ' ')
                            .trim_start();
                        crate::tools::builtins::helpers::is_structural_line(stripped)
                    })
                    .copied()
                    .collect();
                let head_n = self.scale(20);
                if !structure.is_empty() {
                    let struct_n = self.scale(50);
                    return format!(
                        "{}\n  ... ({} lines total, showing structure) ...\n{}\n  ... (end of structure) ...",
                        lines[..head_n.min(lines.len())].join("\n"),
                        lines.len().saturating_sub(head_n),
                        structure[..struct_n.min(structure.len())].join("\n"),
                    );
                }
                let tail_n = self.scale(8);
                return format!(
                    "{}\n  ... ({} lines omitted) ...\n{}",
                    lines[..head_n.min(lines.len())].join("\n"),
                    lines.len().saturating_sub(head_n + tail_n),
                    lines[lines.len().saturating_sub(tail_n)..].join("\n"),
                );
            }
            return text.to_string();
        }

        if tool_name == "search" && lines.len() > self.scale(20) {
            let keep = self.scale(15);
            return format!(
                "{}\n  ... ({} more matches) ...",
                lines[..keep.min(lines.len())].join("\n"),
                lines.len().saturating_sub(keep)
            );
        }

        if matches!(tool_name, "shell" | "Bash") && lines.len() > self.scale(30) {
            let head_n = self.scale(12);
            let tail_n = self.scale(5);
            return format!(
                "{}\n  ... ({} lines omitted) ...\n{}",
                lines[..head_n.min(lines.len())].join("\n"),
                lines.len().saturating_sub(head_n + tail_n),
                lines[lines.len().saturating_sub(tail_n)..].join("\n"),
            );
        }

        if matches!(tool_name, "list_directory" | "glob") && lines.len() > self.scale(40) {
            let keep = self.scale(30);
            return format!(
                "{}\n  ... ({} more entries) ...",
                lines[..keep.min(lines.len())].join("\n"),
                lines.len().saturating_sub(keep)
            );
        }

        let generic_limit = self.scale(1000);
        if text.len() > generic_limit {
            let keep = self.scale(600);
            return format!(
                "{}\n... ({} chars omitted) ...",
                take_chars(text, keep),
                text.len().saturating_sub(keep)
            );
        }

        text.to_string()
    }

    // ── tiered trim ─────────────────────────────────────────────────

    /// Multi-tier context management, invoked before every model call.
    ///
    /// Tier 0 compresses large tool results inline; tier 1 drops thinking
    /// from old messages and dedups `[System]` blocks; tier 2 summarizes the
    /// middle into the running summary; tier 3 is the emergency path.
    pub async fn trim(
        &self,
        history: &mut Vec<Message>,
        running_summary: &mut String,
        provider: &Arc<dyn LlmProvider>,
    ) {
        let tier1_limit = (self.context_window as f64 * 0.55) as u64;
        let tier2_limit = (self.context_window as f64 * 0.65) as u64;
        let tier3_limit = (self.context_window as f64 * 0.80) as u64;

        let mut current = self.total_history_tokens(history);
        if current <= tier1_limit {
            return;
        }

        // ── Tier 0: compress large tool results inline ──
        let hot_paths = self.working_set_paths(history);
        let threshold = self.scale(400);
        let len = history.len();
        for idx in 0..len.saturating_sub(2) {
            let Some(block_count) = history[idx].blocks_mut().map(|b| b.len()) else {
                continue;
            };
            for block_idx in 0..block_count {
                let (tool_use_id, text) = {
                    let Some(blocks) = history[idx].blocks_mut() else {
                        continue;
                    };
                    match &blocks[block_idx] {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } if content.len() > threshold => {
                            (tool_use_id.clone(), content.clone())
                        }
                        _ => continue,
                    }
                };
                let tool_name = Self::tool_name_for_result(history, &tool_use_id, idx);
                let is_hot = hot_paths.iter().any(|p| text.contains(p.as_str()));
                let compressed = self.compress_tool_result(&text, &tool_name, is_hot);
                if compressed.len() < text.len() {
                    if let Some(blocks) = history[idx].blocks_mut() {
                        if let ContentBlock::ToolResult { content, .. } = &mut blocks[block_idx] {
                            *content = compressed;
                        }
                    }
                }
            }
        }
        current = self.total_history_tokens(history);
        if current <= tier1_limit {
            return;
        }

        // ── Tier 1: drop thinking from older messages ──
        info!("context tier 1: dropping thinking (~{} tokens)", current);
        let thinking_horizon = self.scale(4);
        let keep_from = history.len().saturating_sub(thinking_horizon);
        for message in history[..keep_from].iter_mut() {
            if let Some(blocks) = message.blocks_mut() {
                blocks.retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
            }
        }
        // Deduplicate system-injected text blocks accumulated across
        // iterations.
        let mut seen_system: HashSet<String> = HashSet::new();
        for message in history[..keep_from].iter_mut() {
            if let Some(blocks) = message.blocks_mut() {
                blocks.retain(|b| match b {
                    ContentBlock::Text { text } if text.starts_with("[System]") => {
                        seen_system.insert(text.clone())
                    }
                    _ => true,
                });
            }
        }
        current = self.total_history_tokens(history);
        if current <= tier2_limit {
            return;
        }

        // ── Tier 2: summarize the middle into the running summary ──
        info!(
            "context tier 2: summarizing (~{} tokens > {})",
            current, tier2_limit
        );
        let summarize_horizon = self.scale(6);
        let keep_from = history.len().saturating_sub(summarize_horizon);
        for message in history[..keep_from].iter_mut() {
            if let Some(blocks) = message.blocks_mut() {
                blocks.retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
            }
        }

        let ratio = current as f64 / tier2_limit as f64;
        let keep_last_base = if ratio > 3.0 {
            self.scale(10)
        } else if ratio > 1.5 {
            self.scale(14)
        } else {
            self.scale(18)
        };
        let keep_last = keep_last_base.min(history.len());
        let keep_first = 1;

        if history.len() > keep_first + keep_last {
            let old_messages: Vec<Message> =
                history[keep_first..history.len() - keep_last].to_vec();
            let mut summary = self.summarize_old_messages(&old_messages, provider).await;
            if !running_summary.is_empty() {
                summary = format!("{}\n\n{}", running_summary, summary);
            }
            let max_summary = self.scale(3000);
            if summary.len() > max_summary {
                summary = tail_chars(&summary, max_summary).to_string();
            }
            *running_summary = summary.clone();

            let mut rebuilt = Vec::with_capacity(keep_first + 1 + keep_last);
            rebuilt.extend(history[..keep_first].iter().cloned());
            rebuilt.push(Message::user(summary));
            rebuilt.extend(history[history.len() - keep_last..].iter().cloned());
            *history = rebuilt;

            current = self.total_history_tokens(history);
            info!(
                "context tier 2: summarized {} messages, ~{} tokens remain",
                old_messages.len(),
                current
            );
        }
        if current <= tier3_limit {
            return;
        }

        // ── Tier 3: emergency ──
        info!("context tier 3 emergency: ~{} tokens", current);
        let last = history.len().saturating_sub(1);
        for message in history[..last].iter_mut() {
            if let Some(blocks) = message.blocks_mut() {
                blocks.retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
            }
        }
        current = self.total_history_tokens(history);

        let trim_threshold = self.scale(100);
        let trim_keep = self.scale(80);
        let str_threshold = self.scale(500);
        let str_keep = self.scale(200);

        if current > tier3_limit {
            let last = history.len().saturating_sub(1);
            for message in history[..last].iter_mut() {
                Self::hard_truncate_message(message, trim_threshold, trim_keep, str_threshold, str_keep);
            }
            current = self.total_history_tokens(history);
        }

        if current > tier3_limit && history.len() > 3 {
            let first = history[0].clone();
            let last_two: Vec<Message> = history[history.len() - 2..].to_vec();
            let summary_text = if running_summary.is_empty() {
                "(earlier work trimmed)".to_string()
            } else {
                running_summary.clone()
            };
            history.clear();
            history.push(first);
            history.push(Message::user(summary_text));
            history.extend(last_two);
            current = self.total_history_tokens(history);
        }

        if current > tier3_limit {
            for message in history.iter_mut() {
                if let Some(blocks) = message.blocks_mut() {
                    blocks.retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
                }
                Self::hard_truncate_message(message, trim_threshold, trim_keep, str_threshold, str_keep);
            }
            current = self.total_history_tokens(history);
        }

        info!(
            "context tier 3 done: ~{} tokens, {} messages",
            current,
            history.len()
        );

        // Structural validity after the emergency path.
        if history
            .first()
            .map(|m| m.role != Role::User)
            .unwrap_or(false)
        {
            let summary_text = if running_summary.is_empty() {
                "(session context)".to_string()
            } else {
                running_summary.clone()
            };
            history.insert(0, Message::user(summary_text));
        }
        self.repair(history);
    }

    fn hard_truncate_message(
        message: &mut Message,
        trim_threshold: usize,
        trim_keep: usize,
        str_threshold: usize,
        str_keep: usize,
    ) {
        match &mut message.content {
            MessageContent::Text(text) => {
                if text.len() > str_threshold {
                    *text = format!("{} (trimmed)", take_chars(text, str_keep));
                }
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks.iter_mut() {
                    match block {
                        ContentBlock::Text { text } if text.len() > trim_threshold => {
                            *text = format!("{} (trimmed)", take_chars(text, trim_keep));
                        }
                        ContentBlock::ToolResult { content, .. }
                            if content.len() > trim_threshold =>
                        {
                            *content = format!("{} (trimmed)", take_chars(content, trim_keep));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // ── repair ──────────────────────────────────────────────────────

    /// Validate and repair the transcript: every assistant `tool_use` must be
    /// answered by a `tool_result` in the immediately following user message.
    /// Missing results get synthetic error results; a missing message is
    /// inserted. Returns true if anything changed.
    pub fn repair(&self, history: &mut Vec<Message>) -> bool {
        if history.len() < 2 && history.iter().all(|m| m.tool_use_ids().is_empty()) {
            return false;
        }
        let mut repaired = false;
        let mut i = 0;
        while i < history.len() {
            if history[i].role != Role::Assistant {
                i += 1;
                continue;
            }
            let tool_use_ids: Vec<String> = history[i].tool_use_ids();
            if tool_use_ids.is_empty() {
                i += 1;
                continue;
            }

            let next_idx = i + 1;
            if next_idx >= history.len() {
                // Orphaned tool_use at the very end: strip the blocks.
                if let Some(blocks) = history[i].blocks_mut() {
                    blocks.retain(|b| !matches!(b, ContentBlock::ToolUse { .. }));
                    if blocks.is_empty() {
                        history.pop();
                    }
                } else {
                    history.pop();
                }
                warn!("repaired orphaned tool_use at end of history");
                repaired = true;
                continue;
            }

            let next_is_user = history[next_idx].role == Role::User;
            let result_ids: HashSet<String> =
                history[next_idx].tool_result_ids().into_iter().collect();
            let missing: Vec<String> = tool_use_ids
                .into_iter()
                .filter(|id| !result_ids.contains(id))
                .collect();

            if !missing.is_empty() {
                let dummies: Vec<ContentBlock> = missing
                    .iter()
                    .map(|id| {
                        ContentBlock::error_result(
                            id.clone(),
                            "(result unavailable — recovered from stream failure)",
                        )
                    })
                    .collect();
                if next_is_user {
                    match &mut history[next_idx].content {
                        MessageContent::Blocks(blocks) => blocks.extend(dummies),
                        MessageContent::Text(text) => {
                            let mut blocks = dummies;
                            if !text.is_empty() {
                                blocks.push(ContentBlock::text(text.clone()));
                            }
                            history[next_idx].content = MessageContent::Blocks(blocks);
                        }
                    }
                    warn!("added {} dummy tool_results at msg {}", missing.len(), next_idx);
                    repaired = true;
                } else {
                    history.insert(next_idx, Message::user(dummies));
                    warn!(
                        "inserted dummy tool_result message at {} for {} orphans",
                        next_idx,
                        missing.len()
                    );
                    repaired = true;
                    i += 2;
                    continue;
                }
            }
            i += 1;
        }
        if repaired {
            info!("history repaired, {} messages", history.len());
        }
        repaired
    }

    // ── summarization ───────────────────────────────────────────────

    /// Summarize old messages with the fast model; heuristic fallback.
    async fn summarize_old_messages(
        &self,
        messages: &[Message],
        provider: &Arc<dyn LlmProvider>,
    ) -> String {
        let mut text_parts: Vec<String> = Vec::new();
        for message in messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            match &message.content {
                MessageContent::Text(text) => {
                    text_parts.push(format!("[{}]: {}", role, take_chars(text, 500)));
                }
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        match block {
                            ContentBlock::Text { text } => {
                                text_parts.push(format!("[{}]: {}", role, take_chars(text, 500)));
                            }
                            ContentBlock::ToolUse { name, input, .. } => {
                                text_parts.push(format!(
                                    "[tool]: {}({})",
                                    name,
                                    take_chars(&input.to_string(), 200)
                                ));
                            }
                            ContentBlock::ToolResult { content, .. } => {
                                text_parts.push(format!("[result]: {}", take_chars(content, 300)));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        let mut conversation = text_parts.join("\n");

        let preserved = self.preserve_conversational_context(messages);
        if !preserved.is_empty() {
            conversation = format!("{}\n\n{}", preserved, conversation);
        }
        if conversation.len() > 30_000 {
            conversation = format!(
                "{}\n...\n{}",
                take_chars(&conversation, 15_000),
                tail_chars(&conversation, 15_000)
            );
        }

        let config = GenerationConfig {
            max_tokens: 2_000,
            enable_thinking: false,
            thinking_budget: 0,
            ..GenerationConfig::default()
        };
        let prompt = format!(
            "Summarize this coding conversation concisely. Preserve: (1) files \
             modified and how, (2) the task goal, (3) key decisions, (4) commands \
             that were run and their results, (5) any unresolved issues or next \
             steps.\n\nConversation:\n{}",
            conversation
        );
        let system = "You are a conversation summarizer for a coding assistant. \
                      Produce a clear, structured summary preserving all technical \
                      details. Keep the summary under 600 words.";

        match provider
            .generate(
                &[Message::user(prompt)],
                system,
                None,
                Some(&self.fast_model),
                &config,
            )
            .await
        {
            Ok(completion) if !completion.content.trim().is_empty() => {
                info!(
                    "summarized {} messages into {} chars",
                    messages.len(),
                    completion.content.len()
                );
                format!(
                    "[Running summary of earlier conversation]\n{}",
                    completion.content.trim()
                )
            }
            Ok(_) => self.summarize_heuristic(messages),
            Err(e) => {
                warn!("LLM summary failed ({}), using heuristic", e);
                self.summarize_heuristic(messages)
            }
        }
    }

    fn summarize_heuristic(&self, messages: &[Message]) -> String {
        let mut summary_parts: Vec<String> = Vec::new();
        let mut tool_counts: std::collections::BTreeMap<String, usize> = Default::default();

        for message in messages {
            match &message.content {
                MessageContent::Text(text) if text.len() > 20 => match message.role {
                    Role::User => {
                        summary_parts.push(format!("User asked: {}", take_chars(text, 200)))
                    }
                    Role::Assistant => {
                        summary_parts.push(format!("Assistant replied: {}", take_chars(text, 200)))
                    }
                },
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        match block {
                            ContentBlock::ToolUse { name, .. } => {
                                *tool_counts.entry(name.clone()).or_default() += 1;
                            }
                            ContentBlock::Text { text }
                                if message.role == Role::Assistant && text.len() > 20 =>
                            {
                                summary_parts
                                    .push(format!("Assistant: {}", take_chars(text, 200)));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        let mut result = vec![format!("[Summary of {} earlier messages]", messages.len())];
        if !tool_counts.is_empty() {
            let mut pairs: Vec<(String, usize)> = tool_counts.into_iter().collect();
            pairs.sort_by(|a, b| b.1.cmp(&a.1));
            let tools: Vec<String> =
                pairs.iter().map(|(n, c)| format!("{}×{}", n, c)).collect();
            result.push(format!("Tools used: {}", tools.join(", ")));
        }
        let tail_start = summary_parts.len().saturating_sub(6);
        result.extend(summary_parts[tail_start..].iter().cloned());
        result.join("\n")
    }

    /// Recent conversational lines with pronouns or command verbs, preserved
    /// through summarization so follow-ups keep their referents.
    fn preserve_conversational_context(&self, messages: &[Message]) -> String {
        const PRONOUNS: &[&str] = &["it", "that", "this", "them", "those", "he", "she", "they"];
        const COMMANDS: &[&str] = &["run", "execute", "try", "test", "check", "start", "stop"];

        let horizon = self.scale(6);
        let start = messages.len().saturating_sub(horizon);
        let mut items = Vec::new();
        for message in &messages[start..] {
            let text = message.text();
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let lower = text.to_lowercase();
            let has_pronoun = PRONOUNS.iter().any(|w| lower.contains(w));
            let has_command = COMMANDS.iter().any(|w| lower.contains(w));
            if has_pronoun || has_command {
                let role = match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                items.push(format!("Recent {}: {}", role, take_chars(text, 150)));
            }
        }
        if items.is_empty() {
            return String::new();
        }
        let keep = self.scale(3);
        let tail = items.len().saturating_sub(keep);
        format!("CONVERSATIONAL CONTEXT:\n{}", items[tail..].join("\n"))
    }

    // ── completion and context-loss signals ─────────────────────────

    /// Does the assistant text explicitly signal task completion or a
    /// follow-up offer?
    pub fn assistant_signals_completion(text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.len() < 10 {
            return false;
        }
        let lower = trimmed.to_lowercase();
        const COMPLETION: &[&str] = &[
            "task is complete",
            "task complete",
            "completed successfully",
            "all done",
            "finished",
            "implementation is complete",
            "ready to go",
            "should be working now",
            "fixed the issue",
            "problem is resolved",
            "issue is resolved",
            "resolved the problem",
            "changes have been applied",
            "successfully implemented",
            "task has been completed",
            "work is done",
        ];
        const FOLLOWUP: &[&str] = &[
            "let me know if you need",
            "let me know if there's",
            "feel free to",
            "if you need any",
            "anything else",
            "further assistance",
            "additional help",
        ];
        COMPLETION.iter().any(|p| lower.contains(p)) || FOLLOWUP.iter().any(|p| lower.contains(p))
    }

    /// A short follow-up that leads with a bare pronoun after summarization
    /// has discarded its referent.
    pub fn detect_context_loss_risk(&self, user_message: &str, running_summary: &str) -> bool {
        if user_message.is_empty() || user_message.len() > 500 {
            return false;
        }
        if running_summary.is_empty() {
            return false;
        }
        const PRONOUNS: &[&str] = &["it", "that", "this", "them", "those"];
        for sentence in user_message.split(['.', '!', '?']) {
            let sentence = sentence.trim().to_lowercase();
            if sentence.is_empty() {
                continue;
            }
            let first_words: Vec<&str> = sentence.split_whitespace().take(3).collect();
            if first_words
                .iter()
                .any(|w| PRONOUNS.contains(w))
            {
                return true;
            }
        }
        false
    }

    /// Usage fraction of the context window.
    pub fn usage_fraction(&self, history: &[Message], system_prompt: &str) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        self.current_token_estimate(history, system_prompt) as f64 / self.context_window as f64
    }

    /// Context usage percent for the done event.
    pub fn usage_pct(&self, history: &[Message], system_prompt: &str) -> u32 {
        (self.usage_fraction(history, system_prompt) * 100.0).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockProvider;
    use serde_json::json;

    fn manager() -> HistoryManager {
        HistoryManager::new(200_000, "fast-model")
    }

    fn text_turn(i: usize, chars: usize) -> Vec<Message> {
        vec![
            Message::user(format!("request {}: {}", i, "investigate this ".repeat(chars / 17))),
            Message::assistant(format!("findings {}: {}", i, "detail line ".repeat(chars / 12))),
        ]
    }

    #[test]
    fn token_estimation_shape() {
        let m = manager();
        assert_eq!(m.estimate_tokens(""), 1);
        assert_eq!(m.estimate_tokens(&"x".repeat(35)), 10);
        let msg = Message::user("hello world");
        // 11 chars / 3.5 = 3 tokens + 5 message overhead
        assert_eq!(m.message_tokens(&msg), 8);
        let blocks = Message::user(vec![ContentBlock::text("hello world")]);
        // block overhead 10 + 3 + message overhead 5
        assert_eq!(m.message_tokens(&blocks), 18);
    }

    #[test]
    fn window_factor_clamps() {
        assert_eq!(HistoryManager::new(200_000, "m").window_factor(), 1.0);
        assert_eq!(HistoryManager::new(1_000_000, "m").window_factor(), 3.0);
        assert_eq!(HistoryManager::new(100_000, "m").window_factor(), 1.0);
        assert_eq!(HistoryManager::new(400_000, "m").window_factor(), 2.0);
    }

    #[test]
    fn repair_inserts_missing_results() {
        let m = manager();
        let mut history = vec![
            Message::user("task"),
            Message::assistant(vec![
                ContentBlock::text("calling"),
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "shell".into(),
                    input: json!({"command": "ls"}),
                },
            ]),
            // Next message lacks the tool_result entirely.
            Message::assistant(vec![ContentBlock::text("answer")]),
        ];
        assert!(m.repair(&mut history));
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::User);
        assert_eq!(history[2].tool_result_ids(), vec!["t1"]);
        // Re-running is a no-op.
        assert!(!m.repair(&mut history));
    }

    #[test]
    fn repair_fills_partial_results() {
        let m = manager();
        let mut history = vec![
            Message::user("task"),
            Message::assistant(vec![
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "read_file".into(),
                    input: json!({"path": "x"}),
                },
                ContentBlock::ToolUse {
                    id: "b".into(),
                    name: "read_file".into(),
                    input: json!({"path": "y"}),
                },
            ]),
            Message::user(vec![ContentBlock::tool_result("a", "ok")]),
        ];
        assert!(m.repair(&mut history));
        let ids = history[2].tool_result_ids();
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
    }

    #[test]
    fn repair_strips_trailing_orphan() {
        let m = manager();
        let mut history = vec![
            Message::user("task"),
            Message::assistant(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "shell".into(),
                input: json!({}),
            }]),
        ];
        assert!(m.repair(&mut history));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn compression_cold_read_keeps_structure() {
        let m = manager();
        let mut text = String::new();
        for i in 0..200 {
            if i % 20 == 0 {
                text.push_str(&format!("def func_{}():\n", i));
            } else {
                text.push_str(&format!("    x = {}\n", i));
            }
        }
        let compressed = m.compress_tool_result(&text, "read_file", false);
        assert!(compressed.len() < text.len());
        assert!(compressed.contains("showing structure"));
        assert!(compressed.contains("def func_180"));
    }

    #[test]
    fn compression_hot_read_keeps_head_tail() {
        let m = manager();
        let text: String = (0..200).map(|i| format!("line {}\n", i)).collect();
        let compressed = m.compress_tool_result(&text, "read_file", true);
        assert!(compressed.contains("line 0"));
        assert!(compressed.contains("line 199"));
        assert!(compressed.contains("file in working set"));
    }

    #[tokio::test]
    async fn trim_noop_under_limit() {
        let m = manager();
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::empty());
        let mut history = vec![Message::user("small task")];
        let mut summary = String::new();
        m.trim(&mut history, &mut summary, &provider).await;
        assert_eq!(history.len(), 1);
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn trim_summarizes_middle_and_bounds_usage() {
        let m = manager();
        let provider: Arc<dyn LlmProvider> =
            Arc::new(MockProvider::with_completion_text("summary of earlier work"));
        // Plain-text turns are immune to tier-0 compression, so this history
        // drives the trim into tier 2: ~60 × 2 × ~5.7K tokens ≈ 680K.
        let mut history = vec![Message::user("original task")];
        for i in 0..60 {
            history.extend(text_turn(i, 20_000));
        }
        let mut summary = String::new();
        m.trim(&mut history, &mut summary, &provider).await;

        assert!(!summary.is_empty());
        assert!(summary.contains("summary of earlier work"));
        // First message preserved, middle replaced by the summary message.
        assert_eq!(history[0].text(), "original task");
        assert!(history.len() <= 1 + 1 + 18);
        assert!(history.iter().any(|msg| msg.text().contains("summary of earlier work")));
        // Structure still valid and usage bounded at 80%.
        let total = m.total_history_tokens(&history);
        assert!(total <= (200_000f64 * 0.80) as u64, "total {}", total);
        let mut check = history.clone();
        assert!(!m.repair(&mut check), "history should already be valid");
    }

    #[test]
    fn completion_signals() {
        assert!(HistoryManager::assistant_signals_completion(
            "The task is complete, all tests pass."
        ));
        assert!(HistoryManager::assistant_signals_completion(
            "Done — let me know if you need anything else."
        ));
        assert!(!HistoryManager::assistant_signals_completion(
            "Which database do you want me to target?"
        ));
    }

    #[test]
    fn context_loss_detection() {
        let m = manager();
        assert!(m.detect_context_loss_risk("Fix it please", "have summary"));
        assert!(!m.detect_context_loss_risk("Fix it please", ""));
        assert!(!m.detect_context_loss_risk("Fix the login bug in auth.rs", "have summary"));
    }
}
