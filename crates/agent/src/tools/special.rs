//! Definitions for tools the executor handles inline.
//!
//! Todo/memory tools mutate [`crate::context::ContextState`], which only the
//! executor task may touch, and AskUserQuestion suspends on a caller
//! callback. They therefore never go through registry dispatch; only their
//! definitions live here.

use codex::ToolDefinition;
use serde_json::json;

pub const TODO_WRITE: &str = "TodoWrite";
pub const TODO_READ: &str = "TodoRead";
pub const MEMORY_WRITE: &str = "MemoryWrite";
pub const MEMORY_READ: &str = "MemoryRead";
pub const ASK_USER_QUESTION: &str = "AskUserQuestion";

/// True for tools that directly manipulate agent context state.
pub fn is_state_tool(name: &str) -> bool {
    matches!(name, TODO_WRITE | TODO_READ | MEMORY_WRITE | MEMORY_READ)
}

/// Definitions for the state-backed tools, always advertised to the model.
pub fn state_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            TODO_WRITE,
            "Replace the task checklist. Pass the full list each time; each item \
             has content and a status of pending, in_progress, or completed.",
            json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "content": {"type": "string"},
                                "status": {
                                    "type": "string",
                                    "enum": ["pending", "in_progress", "completed"]
                                }
                            },
                            "required": ["content", "status"]
                        }
                    }
                },
                "required": ["todos"]
            }),
        ),
        ToolDefinition::new(
            TODO_READ,
            "Read the current task checklist.",
            json!({"type": "object", "properties": {}}),
        ),
        ToolDefinition::new(
            MEMORY_WRITE,
            "Store a key/value fact for later recall (e.g. the project's test command).",
            json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                    "value": {"type": "string"}
                },
                "required": ["key", "value"]
            }),
        ),
        ToolDefinition::new(
            MEMORY_READ,
            "Recall a stored fact by key, or list all stored facts when no key is given.",
            json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"}
                }
            }),
        ),
    ]
}

/// Definition of the clarifying-question tool; only advertised when the
/// caller supplied a question callback.
pub fn ask_user_question_definition() -> ToolDefinition {
    ToolDefinition::new(
        ASK_USER_QUESTION,
        "Ask the user one clarifying question and wait for their answer. Use \
         sparingly, only when a wrong assumption would waste significant work.",
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "context": {
                    "type": "string",
                    "description": "Short background that helps the user answer"
                },
                "options": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional multiple-choice answers"
                }
            },
            "required": ["question"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tool_predicate() {
        assert!(is_state_tool(TODO_WRITE));
        assert!(is_state_tool(MEMORY_READ));
        assert!(!is_state_tool(ASK_USER_QUESTION));
        assert!(!is_state_tool("read_file"));
    }

    #[test]
    fn definitions_have_schemas() {
        for def in state_tool_definitions() {
            assert_eq!(def.input_schema["type"], "object");
        }
        let ask = ask_user_question_definition();
        assert_eq!(ask.name, ASK_USER_QUESTION);
    }
}
