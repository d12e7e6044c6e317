//! ChatML prompt building and reply cleaning.
//!
//! Renders a system prompt, the retained history, and a new user message as:
//!
//! ```text
//! <|im_start|>system
//! {system}<|im_end|>
//! <|im_start|>user
//! {turn.user}<|im_end|>
//! <|im_start|>assistant
//! {turn.assistant}<|im_end|>
//! <|im_start|>user
//! {input}<|im_end|>
//! <|im_start|>assistant
//! ```
//!
//! # Determinism
//!
//! Building is pure: identical inputs always produce identical prompts.

use quill_core::message::{History, IM_END, IM_START, Role};
use tracing::debug;

/// Stateless prompt builder for ChatML models.
pub struct ContextBuilder;

impl ContextBuilder {
    /// Build the prompt for `user_input` given the retained history.
    ///
    /// Every turn in `history` is rendered, oldest first, as a user block
    /// followed by an assistant block. The final assistant block is left open
    /// for the model to complete.
    pub fn build(system_prompt: &str, history: &History, user_input: &str) -> String {
        let mut prompt = String::with_capacity(
            system_prompt.len()
                + user_input.len()
                + history
                    .iter()
                    .map(|t| t.user.len() + t.assistant.len() + 64)
                    .sum::<usize>()
                + 96,
        );

        push_block(&mut prompt, Role::System, system_prompt);
        for turn in history.iter() {
            push_block(&mut prompt, Role::User, &turn.user);
            push_block(&mut prompt, Role::Assistant, &turn.assistant);
        }
        push_block(&mut prompt, Role::User, user_input);
        push_open(&mut prompt, Role::Assistant);
        prompt
    }

    /// Strip ChatML markers from raw engine output and trim whitespace.
    ///
    /// Removes every `<|im_end|>` and every role-qualified `<|im_start|>`
    /// marker. Stripping repeats until nothing changes, so markers that only
    /// appear once an inner marker is removed are caught too and
    /// `clean(clean(x)) == clean(x)` for every input.
    pub fn clean(raw: &str) -> String {
        let start_markers = Role::ALL.map(|role| format!("{IM_START}{role}"));

        let mut text = raw.trim().to_string();
        loop {
            let mut stripped = text.replace(IM_END, "");
            for marker in &start_markers {
                stripped = stripped.replace(marker.as_str(), "");
            }
            let stripped = stripped.trim();
            if stripped == text {
                return text;
            }
            text = stripped.to_string();
        }
    }

    /// Drop turns from the oldest end until at most `max_pairs` remain.
    ///
    /// `max_pairs == 0` clears the history. Returns how many turns were removed.
    pub fn trim(history: &mut History, max_pairs: usize) -> usize {
        let removed = history.trim(max_pairs);
        if removed > 0 {
            debug!(removed, retained = history.len(), "Trimmed history");
        }
        removed
    }
}

fn push_open(prompt: &mut String, role: Role) {
    prompt.push_str(IM_START);
    prompt.push_str(role.as_str());
    prompt.push('\n');
}

fn push_block(prompt: &mut String, role: Role, content: &str) {
    push_open(prompt, role);
    prompt.push_str(content);
    prompt.push_str(IM_END);
    prompt.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::message::Turn;

    #[test]
    fn build_with_empty_history() {
        let prompt = ContextBuilder::build("S", &History::new(), "Hi");
        assert_eq!(
            prompt,
            "<|im_start|>system\nS<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn build_renders_every_turn_in_order() {
        let history: History = vec![Turn::new("q1", "a1"), Turn::new("q2", "a2")]
            .into_iter()
            .collect();
        let prompt = ContextBuilder::build("Be brief.", &history, "q3");

        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nq1<|im_end|>\n\
             <|im_start|>assistant\na1<|im_end|>\n\
             <|im_start|>user\nq2<|im_end|>\n\
             <|im_start|>assistant\na2<|im_end|>\n\
             <|im_start|>user\nq3<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn build_pair_count_matches_history() {
        for len in 0..5 {
            let history: History = (0..len)
                .map(|i| Turn::new(format!("u{i}"), format!("a{i}")))
                .collect();
            let prompt = ContextBuilder::build("sys", &history, "next");

            assert_eq!(prompt.matches("<|im_start|>user\n").count(), len + 1);
            assert_eq!(prompt.matches("<|im_start|>assistant\n").count(), len + 1);
            assert_eq!(prompt.matches(IM_END).count(), 2 * len + 2);
            assert!(prompt.ends_with("<|im_start|>assistant\n"));
        }
    }

    #[test]
    fn build_is_deterministic() {
        let history: History = vec![Turn::new("a", "b")].into_iter().collect();
        assert_eq!(
            ContextBuilder::build("s", &history, "c"),
            ContextBuilder::build("s", &history, "c")
        );
    }

    #[test]
    fn clean_strips_end_marker() {
        assert_eq!(ContextBuilder::clean("Hello<|im_end|>"), "Hello");
    }

    #[test]
    fn clean_strips_role_markers_and_whitespace() {
        let raw = "  <|im_start|>assistant\nSure thing.<|im_end|>\n<|im_start|>user\n ";
        assert_eq!(ContextBuilder::clean(raw), "Sure thing.");
    }

    #[test]
    fn clean_keeps_bare_start_marker() {
        assert_eq!(
            ContextBuilder::clean("see <|im_start|> here"),
            "see <|im_start|> here"
        );
    }

    #[test]
    fn clean_handles_reassembled_markers() {
        assert_eq!(ContextBuilder::clean("ok<|im_<|im_end|>end|>"), "ok");
        assert_eq!(
            ContextBuilder::clean("<|im_start|><|im_end|>user tail"),
            "tail"
        );
    }

    #[test]
    fn clean_is_idempotent() {
        let samples = [
            "",
            "   ",
            "plain text",
            "Hello<|im_end|>",
            "<|im_start|>system\nrules<|im_end|>",
            "a<|im_<|im_end|>end|>b",
            " <|im_start|><|im_start|>useruser  x ",
            "<|im_end|><|im_end|>  \n",
            "multi\nline\n<|im_end|>\n<|im_start|>assistant",
        ];
        for raw in samples {
            let once = ContextBuilder::clean(raw);
            assert_eq!(ContextBuilder::clean(&once), once, "input: {raw:?}");
        }
    }

    #[test]
    fn trim_keeps_newest_turns() {
        let mut history: History = (0..3).map(|i| Turn::new(format!("q{i}"), "a")).collect();
        assert_eq!(ContextBuilder::trim(&mut history, 1), 2);
        assert_eq!(history.turns()[0].user, "q2");

        assert_eq!(ContextBuilder::trim(&mut history, 0), 1);
        assert!(history.is_empty());
    }
}
