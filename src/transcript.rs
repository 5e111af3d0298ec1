//! Transcript assembly for the live conversation
//!
//! Merges the stream of incremental transcript deltas from the service into
//! discrete, ordered chat messages for display.
//!
//! # Assembly Rules
//!
//! - A delta for a role with no open message starts a new in-progress message
//! - A delta for a role with an open message appends to its text
//! - A turn-complete signal closes that role's open message; once closed, a
//!   message is never mutated again
//! - The two roles are independent: a role switch leaves the other role's
//!   in-progress message open, so both may be open at the same time

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Speaker attribution for a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn slot(self) -> usize {
        match self {
            Role::User => 0,
            Role::Assistant => 1,
        }
    }
}

/// One message bubble in the conversation
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    /// False while the turn is still streaming in
    pub is_complete: bool,
    pub timestamp: DateTime<Utc>,
}

/// Assembles transcript deltas into an ordered, append-only message list
///
/// At most one message per role is incomplete at any time. The message list
/// only ever grows; completed messages are immutable.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    messages: Vec<ChatMessage>,
    /// Index into `messages` of the open (incomplete) message per role
    open: [Option<usize>; 2],
}

impl TranscriptAssembler {
    /// Create a new empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transcript delta from the service
    ///
    /// Empty text with `turn_complete` set is a bare turn-completion signal;
    /// empty text without it is ignored.
    pub fn apply_delta(&mut self, role: Role, text: &str, turn_complete: bool) {
        if !text.is_empty() {
            match self.open[role.slot()] {
                Some(idx) => self.messages[idx].text.push_str(text),
                None => {
                    self.messages.push(ChatMessage {
                        id: Uuid::new_v4(),
                        role,
                        text: text.to_string(),
                        is_complete: false,
                        timestamp: Utc::now(),
                    });
                    self.open[role.slot()] = Some(self.messages.len() - 1);
                }
            }
        }

        if turn_complete {
            self.complete_turn(role);
        }
    }

    /// Close the open message for a role, if any
    ///
    /// Subsequent deltas for the role start a new message. A turn-complete
    /// with no open message is a no-op.
    pub fn complete_turn(&mut self, role: Role) {
        if let Some(idx) = self.open[role.slot()].take() {
            self.messages[idx].is_complete = true;
            log::debug!(
                "Transcript: completed {:?} message ({} chars)",
                role,
                self.messages[idx].text.len()
            );
        }
    }

    /// Snapshot of the assembled messages in arrival order
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of assembled messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no messages have been assembled yet
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Discard all messages and open-turn tracking for a fresh session
    pub fn reset(&mut self) {
        self.messages.clear();
        self.open = [None, None];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate_into_one_message() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::User, "He", false);
        asm.apply_delta(Role::User, "llo", false);
        asm.apply_delta(Role::User, "", true);

        assert_eq!(asm.len(), 1);
        let msg = &asm.messages()[0];
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text, "Hello");
        assert!(msg.is_complete);
    }

    #[test]
    fn delta_after_completion_starts_new_message() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::Assistant, "First", true);
        asm.apply_delta(Role::Assistant, "Second", false);

        assert_eq!(asm.len(), 2);
        assert!(asm.messages()[0].is_complete);
        assert_eq!(asm.messages()[0].text, "First");
        assert!(!asm.messages()[1].is_complete);
        assert_eq!(asm.messages()[1].text, "Second");
    }

    #[test]
    fn roles_assemble_independently() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::User, "Hi", false);
        asm.apply_delta(Role::Assistant, "Hey", false);

        // Both open at once, neither closed by the role switch
        assert_eq!(asm.len(), 2);
        assert!(!asm.messages()[0].is_complete);
        assert!(!asm.messages()[1].is_complete);

        asm.apply_delta(Role::User, "", true);
        asm.apply_delta(Role::Assistant, "", true);

        let user_msg = &asm.messages()[0];
        let assistant_msg = &asm.messages()[1];
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.text, "Hi");
        assert!(user_msg.is_complete);
        assert_eq!(assistant_msg.role, Role::Assistant);
        assert_eq!(assistant_msg.text, "Hey");
        assert!(assistant_msg.is_complete);
    }

    #[test]
    fn at_most_one_open_message_per_role() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::User, "a", false);
        asm.apply_delta(Role::User, "b", false);
        asm.apply_delta(Role::Assistant, "c", false);
        asm.apply_delta(Role::Assistant, "d", false);

        for role in [Role::User, Role::Assistant] {
            let open = asm
                .messages()
                .iter()
                .filter(|m| m.role == role && !m.is_complete)
                .count();
            assert_eq!(open, 1, "{:?} should have exactly one open message", role);
        }
    }

    #[test]
    fn empty_delta_without_completion_is_ignored() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::User, "", false);
        assert!(asm.is_empty());
    }

    #[test]
    fn turn_complete_without_open_message_is_noop() {
        let mut asm = TranscriptAssembler::new();
        asm.complete_turn(Role::Assistant);
        assert!(asm.is_empty());
    }

    #[test]
    fn completed_message_is_not_reopened() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::User, "done", true);
        asm.apply_delta(Role::User, "next", false);
        asm.complete_turn(Role::User);

        assert_eq!(asm.messages()[0].text, "done");
        assert_eq!(asm.messages()[1].text, "next");
    }

    #[test]
    fn message_order_follows_arrival_order() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::Assistant, "one", true);
        asm.apply_delta(Role::User, "two", true);
        asm.apply_delta(Role::Assistant, "three", false);

        let texts: Vec<&str> = asm.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn reset_clears_messages_and_open_turns() {
        let mut asm = TranscriptAssembler::new();
        asm.apply_delta(Role::User, "stale", false);
        asm.reset();

        assert!(asm.is_empty());

        // A delta after reset starts fresh rather than appending
        asm.apply_delta(Role::User, "fresh", false);
        assert_eq!(asm.len(), 1);
        assert_eq!(asm.messages()[0].text, "fresh");
    }
}
