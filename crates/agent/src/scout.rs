//! Scout: a bounded read-only sub-loop over the cheap model that gathers
//! codebase context before planning or building.

use crate::events::{AgentEvent, EventSink};
use crate::executor::{CodingAgent, GenerationPhase, collect_stream};
use crate::history::take_chars;
use codex::chat::{ContentBlock, Message};
use futures::future::join_all;
use log::warn;
use std::sync::Arc;

impl CodingAgent {
    /// Run the scout and return a codebase-context summary, or `None` when
    /// scouting is disabled or produced nothing. Safe tools only.
    pub(crate) async fn run_scout(
        &mut self,
        task: &str,
        sink: &Arc<dyn EventSink>,
    ) -> Option<String> {
        if !self.config.scout_enabled {
            return None;
        }

        self.emit(
            sink,
            AgentEvent::ScoutStart {
                content: "Scouting codebase...".to_string(),
            },
        )
        .await;

        let scout_system = crate::prompts::compose_system_prompt(
            crate::prompts::PromptPhase::Scout,
            self.backend.working_directory(),
            &self.registry.names(),
            &self.detected_language,
            None,
        );
        let scout_config = {
            let mut config = self.generation_config_for_phase(GenerationPhase::Scout, None);
            config.max_tokens = 8_192;
            config
        };
        let scout_model = self.config.scout_model.clone();
        let scout_tools = self.registry.safe_definitions();

        // Auto-context richness decides the iteration budget.
        let has_structure = task.contains("<project_structure>");
        let has_semantic = task.contains("<semantic_context>");
        let (user_content, max_iters) = if has_structure && has_semantic {
            (
                format!(
                    "You are a fast scout agent. Auto-context already includes the project \
                     structure and semantic search results. Your job: scan the auto-context \
                     below, then do ONE targeted read of the most critical file(s) for this \
                     task. Return a concise summary.\n\nIMPORTANT: Batch all tool calls in \
                     a single response. Finish in 1-2 turns MAX.\n\nTask: {}",
                    take_chars(task, 3000)
                ),
                2usize,
            )
        } else if has_structure || has_semantic {
            (
                format!(
                    "You are a fast scout agent. Some context is already injected (check \
                     the task below). Fill in what's missing — if you have structure but \
                     not semantic results, run semantic_retrieve; if you have semantic but \
                     not structure, run project_tree. Then read 1-3 key files.\n\nIMPORTANT: \
                     Batch ALL tool calls together in each response. Finish in 2-3 turns \
                     MAX.\n\nTask: {}",
                    take_chars(task, 3000)
                ),
                3usize,
            )
        } else {
            (
                format!(
                    "You are a fast scout agent. Quickly gather context about the \
                     codebase.\n\nTask: {}\n\nIMPORTANT: Call project_tree AND \
                     semantic_retrieve TOGETHER in your first response (they are \
                     independent — batch them). Then read 1-3 key files if needed. Return \
                     a concise context summary. Finish in 2-4 turns MAX — speed matters.",
                    take_chars(task, 3000)
                ),
                self.config.scout_max_iterations.min(6),
            )
        };

        let mut scout_messages = vec![Message::user(user_content)];
        let mut all_text: Vec<String> = Vec::new();

        for _iter in 0..max_iters {
            let stream = match self
                .provider
                .stream(
                    &scout_messages,
                    &scout_system,
                    Some(&scout_tools),
                    Some(&scout_model),
                    &scout_config,
                )
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("scout stream failed: {}", e);
                    break;
                }
            };

            // Scout streams run quiet — only scout_progress events surface.
            let null_sink: Arc<dyn EventSink> = Arc::new(crate::events::NullSink);
            let response =
                match collect_stream(stream, &null_sink, &self.cancelled, None).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("scout stream error: {}", e);
                        break;
                    }
                };
            if response.cancelled {
                break;
            }
            self.usage.add(&response.usage);

            if !response.text_blocks.is_empty() {
                all_text.push(response.text_blocks.join("\n\n"));
            }
            if response.tool_uses.is_empty() {
                break;
            }
            for call in &response.tool_uses {
                self.emit(
                    sink,
                    AgentEvent::ScoutProgress {
                        content: format!("Scouting: {}...", call.name),
                    },
                )
                .await;
            }
            scout_messages.push(Message::assistant(response.content.clone()));

            // Execute the scout's read-only tools concurrently.
            let ctx = self.tool_context();
            let futures: Vec<_> = response
                .tool_uses
                .iter()
                .map(|call| {
                    let registry = self.registry.clone();
                    let ctx = ctx.clone();
                    let call = call.clone();
                    async move {
                        let result = registry.execute(&call.name, call.input.clone(), &ctx).await;
                        (call.id, result)
                    }
                })
                .collect();
            let outcomes = join_all(futures).await;

            let mut tool_results: Vec<ContentBlock> = Vec::new();
            for (id, result) in outcomes {
                let mut text = result.text();
                if text.len() > 4_000 {
                    text = format!(
                        "{}\n... ({} chars truncated) ...",
                        take_chars(&text, 2_000),
                        text.len() - 2_000
                    );
                }
                tool_results.push(if result.success {
                    ContentBlock::tool_result(id, text)
                } else {
                    ContentBlock::error_result(id, text)
                });
            }
            scout_messages.push(Message::user(tool_results));
        }

        let context = all_text.join("\n\n").trim().to_string();
        if context.is_empty() {
            self.emit(
                sink,
                AgentEvent::ScoutEnd {
                    content: "Scout complete (no context)".to_string(),
                },
            )
            .await;
            None
        } else {
            self.emit(
                sink,
                AgentEvent::ScoutEnd {
                    content: "Scout complete".to_string(),
                },
            )
            .await;
            Some(context)
        }
    }

    /// Optional fast-model pass that turns the raw task into an output-spec
    /// plus constraints block.
    pub(crate) async fn refine_task(
        &mut self,
        task: &str,
        sink: &Arc<dyn EventSink>,
    ) -> Option<String> {
        if task.trim().is_empty() {
            return None;
        }
        self.emit(
            sink,
            AgentEvent::ScoutProgress {
                content: "Refining task into output spec and constraints...".to_string(),
            },
        )
        .await;

        const REFINE_SYSTEM: &str = "You are a coding task refiner. Given a user's raw task \
            description, produce a compact spec with sections: '## Output specification', \
            '## Constraints', '## Impact scope', '## Verification criteria', and '## Task' \
            (the original or lightly clarified task). Keep the whole response under 400 \
            words. If the request is already very clear and minimal, you may return it \
            with only a brief output spec and 'None' for constraints.";

        let config = codex::provider::GenerationConfig {
            max_tokens: 500,
            enable_thinking: false,
            thinking_budget: 0,
            ..codex::provider::GenerationConfig::default()
        };
        match self
            .provider
            .generate(
                &[Message::user(task.to_string())],
                REFINE_SYSTEM,
                None,
                Some(&self.config.scout_model),
                &config,
            )
            .await
        {
            Ok(completion) if !completion.content.trim().is_empty() => {
                Some(completion.content.trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                log::debug!("task refinement failed: {}", e);
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
    use codex::LlmProvider;
    use tempfile::TempDir;

    #[tokio::test]
    async fn scout_gathers_context_with_tools() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::empty());
        provider.push_stream(MockProvider::tool_turn(
            "Let me look at the tree.",
            &[("s1", "project_tree", serde_json::json!({}))],
        ));
        provider.push_stream(MockProvider::text_turn(
            "The project is a small Rust crate with src/main.rs.",
        ));

        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("src/main.rs", "fn main() {}").await.unwrap();
        let mut agent =
            CodingAgent::new(provider, backend, AgentConfig::default()).await;

        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let context = agent.run_scout("fix the main function", &dyn_sink).await;
        let context = context.unwrap();
        assert!(context.contains("small Rust crate"));

        let events = sink.events();
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ScoutStart { .. })));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ScoutProgress { .. })));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ScoutEnd { .. })));
    }

    #[tokio::test]
    async fn scout_disabled_returns_none() {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::empty());
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        let config = AgentConfig {
            scout_enabled: false,
            ..AgentConfig::default()
        };
        let mut agent = CodingAgent::new(provider, backend, config).await;
        let sink = CollectingSink::new();
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        assert!(agent.run_scout("task", &dyn_sink).await.is_none());
        assert!(sink.events().is_empty());
    }
}
