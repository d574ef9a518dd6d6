//! Intent classification: fast-model labeling with a heuristic fallback.

use codex::chat::Message;
use codex::provider::GenerationConfig;
use codex::LlmProvider;
use log::{info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Task complexity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Complex,
}

/// Classification of one user task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub scout: bool,
    pub plan: bool,
    pub question: bool,
    pub complexity: Complexity,
}

const CLASSIFY_SYSTEM: &str = r#"You are a task classifier for a coding agent. Analyze the user's message and return ONLY valid JSON:
{"scout": true/false, "plan": true/false, "question": true/false, "complexity": "trivial"|"simple"|"complex"}

Complexity: trivial = greetings, single commands, confirmations; simple = single-file edits, explanations, typo fixes; complex = multi-file changes, features, refactors, audits, migrations. Audit/review/analysis tasks are ALWAYS complex.

question = true ONLY for questions/explanations, not change requests. scout = true when codebase exploration helps (cheap — when in doubt, true). plan = true only for multi-file coordination; NEVER for questions or execution commands like "implement the plan" or "go ahead".

When uncertain: scout=true, plan=false, question=false, complexity="complex".
Return ONLY the JSON object, no explanation."#;

static CLASSIFY_CACHE: Lazy<Mutex<HashMap<String, Intent>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Classify a task with the fast model, caching by the lowercased first 200
/// chars; falls back to heuristics on any failure.
pub async fn classify_intent(
    task: &str,
    provider: Option<&Arc<dyn LlmProvider>>,
    fast_model: &str,
) -> Intent {
    let stripped = task.trim();
    if stripped.is_empty() {
        return Intent {
            scout: false,
            plan: false,
            question: false,
            complexity: Complexity::Trivial,
        };
    }

    let cache_key = crate::history::take_chars(stripped, 200).to_lowercase();
    if let Some(cached) = CLASSIFY_CACHE.lock().get(&cache_key) {
        return *cached;
    }

    let result = match provider {
        Some(provider) => match classify_with_model(stripped, provider, fast_model).await {
            Some(intent) => {
                info!("intent classification: {:?}", intent);
                intent
            }
            None => classify_fallback(stripped),
        },
        None => classify_fallback(stripped),
    };

    CLASSIFY_CACHE.lock().insert(cache_key, result);
    result
}

async fn classify_with_model(
    task: &str,
    provider: &Arc<dyn LlmProvider>,
    fast_model: &str,
) -> Option<Intent> {
    let config = GenerationConfig {
        max_tokens: 80,
        enable_thinking: false,
        thinking_budget: 0,
        ..GenerationConfig::default()
    };
    let completion = match provider
        .generate(
            &[Message::user(task.to_string())],
            CLASSIFY_SYSTEM,
            None,
            Some(fast_model),
            &config,
        )
        .await
    {
        Ok(c) => c,
        Err(e) => {
            warn!("intent classification failed ({}), using fallback", e);
            return None;
        }
    };

    let mut text = completion.content.trim().to_string();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }
    // Extract the first balanced JSON object in case of extra prose.
    if let Some(start) = text.find('{') {
        let mut depth = 0usize;
        let mut end = text.len();
        for (i, c) in text[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        end = start + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        text = text[start..end].to_string();
    }

    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    let complexity = match value.get("complexity").and_then(|v| v.as_str()) {
        Some("trivial") => Complexity::Trivial,
        Some("complex") => Complexity::Complex,
        _ => Complexity::Simple,
    };
    Some(Intent {
        scout: value.get("scout").and_then(|v| v.as_bool()).unwrap_or(true),
        plan: value.get("plan").and_then(|v| v.as_bool()).unwrap_or(false),
        question: value
            .get("question")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        complexity,
    })
}

/// Heuristic fallback when the model is unavailable.
pub fn classify_fallback(task: &str) -> Intent {
    let stripped = task
        .trim()
        .trim_end_matches(['!', '?', '.'])
        .to_lowercase();
    let words: Vec<&str> = stripped.split_whitespace().collect();
    if words.len() <= 2 {
        return Intent {
            scout: false,
            plan: false,
            question: false,
            complexity: Complexity::Trivial,
        };
    }

    const QUESTION_STARTERS: &[&str] = &[
        "what",
        "why",
        "how",
        "explain",
        "can you explain",
        "tell me",
        "describe",
        "is it",
        "are there",
        "do you",
        "could you",
        "would you",
        "hi",
        "hello",
        "hey",
    ];
    let is_question = task.trim().ends_with('?')
        || QUESTION_STARTERS.iter().any(|q| stripped.starts_with(q));
    if is_question {
        return Intent {
            scout: true,
            plan: false,
            question: true,
            complexity: Complexity::Simple,
        };
    }

    const EXECUTE_INDICATORS: &[&str] = &[
        "implement the plan",
        "implement it",
        "execute the plan",
        "execute it",
        "go ahead",
        "do it",
        "build it",
        "apply the plan",
        "apply the changes",
        "just implement",
        "just execute",
        "just do it",
    ];
    if EXECUTE_INDICATORS.iter().any(|kw| stripped.contains(kw)) {
        return Intent {
            scout: false,
            plan: false,
            question: false,
            complexity: Complexity::Complex,
        };
    }

    const COMPLEX_INDICATORS: &[&str] = &[
        "audit",
        "refactor",
        "review",
        "analyze",
        "analyse",
        "overhaul",
        "redesign",
        "end to end",
        "end-to-end",
        "codebase",
        "rip apart",
        "find all bugs",
        "security review",
        "architecture",
        "migrate",
        "migration",
        "deprecate",
        "backward compatible",
        "backward-compatible",
        "breaking change",
        "cross-service",
        "shared library",
        "api contract",
        "interface change",
        "upgrade",
        "downgrade",
        "rollback strategy",
    ];
    if COMPLEX_INDICATORS.iter().any(|kw| stripped.contains(kw)) {
        return Intent {
            scout: true,
            plan: true,
            question: false,
            complexity: Complexity::Complex,
        };
    }

    // Default to complex: over-allocating the main model is safer than
    // handing an audit to the fast one.
    Intent {
        scout: true,
        plan: false,
        question: false,
        complexity: Complexity::Complex,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockProvider;

    #[test]
    fn fallback_trivial_and_questions() {
        assert_eq!(classify_fallback("do it").complexity, Complexity::Trivial);
        let q = classify_fallback("What does this function do?");
        assert!(q.question);
        assert!(q.scout);
        assert!(!q.plan);
    }

    #[test]
    fn fallback_execute_and_complex() {
        let exec = classify_fallback("go ahead and implement it across the files");
        assert!(!exec.plan);
        assert_eq!(exec.complexity, Complexity::Complex);

        let audit = classify_fallback("do a full security review of the auth layer");
        assert!(audit.plan);
        assert!(audit.scout);
        assert_eq!(audit.complexity, Complexity::Complex);
    }

    #[tokio::test]
    async fn model_json_is_parsed_with_wrapping() {
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::with_completion_text(
            "```json\n{\"scout\": true, \"plan\": false, \"question\": false, \"complexity\": \"simple\"}\n```",
        ));
        let intent = classify_intent(
            "In src/app.py replace the string 'DEBUG=False' with 'DEBUG=True'.",
            Some(&provider),
            "fast",
        )
        .await;
        assert!(intent.scout);
        assert!(!intent.plan);
        assert_eq!(intent.complexity, Complexity::Simple);
    }

    #[tokio::test]
    async fn classification_is_cached() {
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::with_completion_text(
            "{\"scout\": false, \"plan\": true, \"question\": false, \"complexity\": \"complex\"}",
        ));
        let task = "unique task for cache test 98765";
        let first = classify_intent(task, Some(&provider), "fast").await;
        // Second call hits the cache even with no provider.
        let second = classify_intent(task, None, "fast").await;
        assert_eq!(first, second);
    }
}
