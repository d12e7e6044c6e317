//! Turn and History domain types.
//!
//! These are the core value objects of a chat session:
//! user sends a message → engine generates a reply → the pair is kept as a [`Turn`]
//! in a bounded [`History`] that feeds the next prompt.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// ChatML message-start marker; the role name follows it on the same line.
pub const IM_START: &str = "<|im_start|>";

/// ChatML message-end marker.
pub const IM_END: &str = "<|im_end|>";

/// The role of a message sender in a ChatML conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model's reply
    Assistant,
}

impl Role {
    /// All roles, in prompt order.
    pub const ALL: [Role; 3] = [Role::System, Role::User, Role::Assistant];

    /// The role name as it appears after a message-start marker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user message plus the assistant reply it produced.
///
/// Immutable once appended to a [`History`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

impl Turn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

/// Ordered conversation history, oldest turn first.
///
/// The history itself does not know its bound; callers trim it with the
/// session's configured `max_history_pairs` after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    turns: VecDeque<Turn>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn at the newest end.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
    }

    /// Drop turns from the oldest end until at most `max_pairs` remain.
    ///
    /// `max_pairs == 0` retains nothing. Returns how many turns were removed.
    pub fn trim(&mut self, max_pairs: usize) -> usize {
        let excess = self.turns.len().saturating_sub(max_pairs);
        self.turns.drain(..excess);
        excess
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Copy of the retained turns, oldest first.
    pub fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }
}

impl FromIterator<Turn> for History {
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        Self {
            turns: iter.into_iter().collect(),
        }
    }
}
