//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token.
//! Session budgets and context windows are measured with these estimates.

use crate::engine::ToolDefinition;
use crate::session::Turn;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Estimate tokens for a single turn including per-turn overhead.
///
/// Each turn costs ~4 tokens of overhead for role name and delimiters.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    let overhead = 4;
    overhead + estimate_tokens(&turn.content)
}

/// Estimate tokens for a slice of turns.
pub fn estimate_turns_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn_tokens).sum()
}

/// Estimate tokens for a tool definition (serialized as JSON).
pub fn estimate_tool_tokens(tool: &ToolDefinition) -> usize {
    let json = serde_json::to_string(tool).unwrap_or_default();
    estimate_tokens(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn turn_includes_overhead() {
        let turn = Turn::user("test"); // 1 token + 4 overhead
        assert_eq!(estimate_turn_tokens(&turn), 5);
    }

    #[test]
    fn multiple_turns() {
        let turns = vec![Turn::user("hello"), Turn::assistant("world")];
        assert_eq!(estimate_turns_tokens(&turns), 12);
    }

    #[test]
    fn tool_definition_tokens() {
        let tool = ToolDefinition {
            name: "search_caselaw".into(),
            description: "Search the case law corpus".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        assert!(estimate_tool_tokens(&tool) > 0);
    }
}
