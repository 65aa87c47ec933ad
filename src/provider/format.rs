//! Provider formatting helpers.

use crate::types::{Message, Role};

/// Text of the synthetic first turn for vendors that require the
/// conversation to open with a user turn.
pub(crate) const LEADING_TURN_PLACEHOLDER: &str = "(continuing conversation)";

/// The two speakers of a strictly alternating wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Speaker {
    User,
    Model,
}

/// A vendor turn that can be merged with its neighbour.
pub(crate) trait AlternatingTurn: Sized {
    fn speaker(&self) -> Speaker;
    /// Append `next`'s content parts to this turn.
    fn absorb(&mut self, next: Self);
    fn placeholder_user() -> Self;
}

/// Merge adjacent same-speaker turns and open with a user turn.
pub(crate) fn alternate_turns<T: AlternatingTurn>(turns: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(turns.len() + 1);
    for turn in turns {
        match out.last_mut() {
            Some(last) if last.speaker() == turn.speaker() => last.absorb(turn),
            _ => out.push(turn),
        }
    }
    if out.first().map(AlternatingTurn::speaker) != Some(Speaker::User) {
        out.insert(0, T::placeholder_user());
    }
    out
}

/// Pull system messages out of the conversation, joined into one prompt.
pub(crate) fn split_system(messages: Vec<Message>) -> (Option<String>, Vec<Message>) {
    let (system, rest): (Vec<Message>, Vec<Message>) =
        messages.into_iter().partition(|m| m.role == Role::System);
    let system = system
        .iter()
        .map(Message::text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    ((!system.is_empty()).then_some(system), rest)
}

/// Tool result text; empty results are sent as an explicit marker.
pub(crate) fn tool_result_text(text: String) -> String {
    if text.is_empty() {
        "(no output)".to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Turn(Speaker, Vec<&'static str>);

    impl AlternatingTurn for Turn {
        fn speaker(&self) -> Speaker {
            self.0
        }
        fn absorb(&mut self, next: Self) {
            self.1.extend(next.1);
        }
        fn placeholder_user() -> Self {
            Turn(Speaker::User, vec![LEADING_TURN_PLACEHOLDER])
        }
    }

    #[test]
    fn three_users_merge_into_one() {
        let merged = alternate_turns(vec![
            Turn(Speaker::User, vec!["a"]),
            Turn(Speaker::User, vec!["b"]),
            Turn(Speaker::User, vec!["c"]),
        ]);
        assert_eq!(merged, vec![Turn(Speaker::User, vec!["a", "b", "c"])]);
    }

    #[test]
    fn model_first_gets_placeholder_user_turn() {
        let merged = alternate_turns(vec![
            Turn(Speaker::Model, vec!["x"]),
            Turn(Speaker::User, vec!["y"]),
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], Turn(Speaker::User, vec![LEADING_TURN_PLACEHOLDER]));
    }

    #[test]
    fn system_messages_are_joined_and_removed() {
        let (system, rest) = split_system(vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::system("use tools"),
        ]);
        assert_eq!(system.as_deref(), Some("be brief\n\nuse tools"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn empty_conversation_still_opens_with_user() {
        let merged: Vec<Turn> = alternate_turns(Vec::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0, Speaker::User);
    }
}
