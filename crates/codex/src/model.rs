//! Static model capability table.
//!
//! Context-window and output limits keyed by model-id substring. The agent
//! scales all of its heuristic limits from these numbers, so an unknown model
//! falls back to the common 200K window rather than failing.

/// Context window in tokens for a model id.
pub fn context_window(model_id: &str) -> u64 {
    let id = model_id.to_lowercase();
    if id.contains("[1m]") || id.contains("-1m") {
        return 1_000_000;
    }
    if id.contains("claude") {
        return 200_000;
    }
    if id.contains("haiku") || id.contains("sonnet") || id.contains("opus") {
        return 200_000;
    }
    200_000
}

/// Default max output tokens for a model id.
pub fn default_max_tokens(model_id: &str) -> u32 {
    let id = model_id.to_lowercase();
    if id.contains("haiku") {
        return 8_192;
    }
    if id.contains("opus") {
        return 32_000;
    }
    64_000
}

/// Maximum output tokens a model can produce.
pub fn max_output_tokens(model_id: &str) -> u32 {
    let id = model_id.to_lowercase();
    if id.contains("haiku") {
        return 8_192;
    }
    128_000
}

/// Whether the model supports extended thinking.
pub fn supports_thinking(model_id: &str) -> bool {
    let id = model_id.to_lowercase();
    id.contains("sonnet") || id.contains("opus")
}

/// Whether the model supports adaptive (effort-based) thinking.
pub fn supports_adaptive_thinking(model_id: &str) -> bool {
    let id = model_id.to_lowercase();
    supports_thinking(model_id) && (id.contains("4-5") || id.contains("4-6"))
}

/// Upper bound on the thinking budget for a model.
pub fn thinking_max_budget(model_id: &str) -> u32 {
    max_output_tokens(model_id).saturating_sub(4_096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_lookup() {
        assert_eq!(context_window("us.anthropic.claude-opus-4-6-v1"), 200_000);
        assert_eq!(context_window("claude-sonnet-4-5[1m]"), 1_000_000);
        assert_eq!(context_window("something-unknown"), 200_000);
    }

    #[test]
    fn thinking_support() {
        assert!(supports_thinking("us.anthropic.claude-opus-4-6-v1"));
        assert!(!supports_thinking("us.anthropic.claude-haiku-4-5-v1"));
    }
}
