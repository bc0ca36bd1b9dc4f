//! Context summarization
//!
//! Best-effort, informational only: extracts a bounded structural summary
//! from a long conversation so a resumed task can re-orient without
//! replaying the full history.

use apex_store::{ConversationMessage, Role};
use serde::Serialize;

/// Keywords that mark a sentence as a decision
const DECISION_MARKERS: &[&str] = &["decided", "chosen", "implemented", "completed"];

/// Maximum key decisions captured
const MAX_KEY_DECISIONS: usize = 5;
/// Maximum length of the recent-messages excerpt
const MAX_RECENT_CHARS: usize = 1000;
/// How many trailing assistant messages feed the excerpt
const RECENT_MESSAGES: usize = 3;

/// Structured summary of a conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub conversation_length: usize,
    pub key_decisions: Vec<String>,
    pub recent_messages: String,
}

impl ContextSummary {
    /// Single-string rendering stored as the task's context summary hint
    pub fn render(&self) -> String {
        let mut out = format!("{} messages in conversation.", self.conversation_length);
        if !self.key_decisions.is_empty() {
            out.push_str(" Key decisions: ");
            out.push_str(&self.key_decisions.join(" | "));
            out.push('.');
        }
        if !self.recent_messages.is_empty() {
            out.push_str(" Recent: ");
            out.push_str(&self.recent_messages);
        }
        out
    }
}

/// Summarize a conversation history
pub fn summarize_context(history: &[ConversationMessage]) -> ContextSummary {
    let mut key_decisions = Vec::new();
    'outer: for message in history {
        let text = message.joined_text();
        for sentence in text.split('.') {
            let trimmed = sentence.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lower = trimmed.to_lowercase();
            if DECISION_MARKERS.iter().any(|m| lower.contains(m)) {
                key_decisions.push(trimmed.to_string());
                if key_decisions.len() >= MAX_KEY_DECISIONS {
                    break 'outer;
                }
            }
        }
    }

    let mut recent: Vec<String> = history
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .take(RECENT_MESSAGES)
        .map(ConversationMessage::joined_text)
        .collect();
    recent.reverse();
    let mut recent_messages = recent.join(" ");
    if recent_messages.len() > MAX_RECENT_CHARS {
        recent_messages.truncate(MAX_RECENT_CHARS);
    }

    ContextSummary {
        conversation_length: history.len(),
        key_decisions,
        recent_messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, text: &str) -> ConversationMessage {
        ConversationMessage::text(role, text)
    }

    #[test]
    fn test_summary_structure() {
        let history = vec![
            msg(Role::User, "please migrate the schema"),
            msg(
                Role::Assistant,
                "I decided to use additive migrations. Working on it now.",
            ),
            msg(Role::Assistant, "Implemented the column inspection pass."),
            msg(Role::User, "looks fine"),
            msg(Role::Assistant, "Tests completed successfully."),
        ];

        let summary = summarize_context(&history);
        assert_eq!(summary.conversation_length, 5);
        assert_eq!(summary.key_decisions.len(), 3);
        assert!(summary.key_decisions[0].contains("decided"));
        assert!(!summary.recent_messages.is_empty());
        assert!(summary.recent_messages.len() <= 1000);
    }

    #[test]
    fn test_key_decisions_capped_at_five() {
        let history: Vec<_> = (0..10)
            .map(|i| msg(Role::Assistant, &format!("We decided on option {}.", i)))
            .collect();
        let summary = summarize_context(&history);
        assert_eq!(summary.key_decisions.len(), 5);
    }

    #[test]
    fn test_recent_uses_last_three_assistant_messages() {
        let mut history = vec![msg(Role::Assistant, "oldest assistant line")];
        for i in 0..4 {
            history.push(msg(Role::User, &format!("user {}", i)));
            history.push(msg(Role::Assistant, &format!("assistant {}", i)));
        }
        let summary = summarize_context(&history);
        assert!(summary.recent_messages.contains("assistant 3"));
        assert!(summary.recent_messages.contains("assistant 1"));
        assert!(!summary.recent_messages.contains("oldest assistant line"));
    }

    #[test]
    fn test_recent_truncated_to_bound() {
        let long_text = "x".repeat(2000);
        let history = vec![msg(Role::Assistant, &long_text)];
        let summary = summarize_context(&history);
        assert_eq!(summary.recent_messages.len(), 1000);
    }

    #[test]
    fn test_empty_history() {
        let summary = summarize_context(&[]);
        assert_eq!(summary.conversation_length, 0);
        assert!(summary.key_decisions.is_empty());
        assert!(summary.recent_messages.is_empty());
    }

    #[test]
    fn test_render_mentions_counts() {
        let history = vec![msg(Role::Assistant, "Implemented the parser.")];
        let rendered = summarize_context(&history).render();
        assert!(rendered.contains("1 messages"));
        assert!(rendered.contains("Key decisions"));
    }
}
