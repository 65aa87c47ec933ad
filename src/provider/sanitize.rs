//! Transcript sanitation applied before any vendor request is built.

use std::collections::{HashMap, HashSet};

use crate::types::{ContentPart, Message, Role};

/// What the target wire can carry.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    /// The model accepts image parts at all.
    pub supports_images: bool,
    /// Tool results may carry image parts (false on OpenAI-style wires).
    pub images_in_tool_results: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            supports_images: true,
            images_in_tool_results: false,
        }
    }
}

/// Text that replaces an image part a vendor cannot accept.
pub fn image_placeholder(mime_type: &str) -> String {
    format!("[image omitted: {mime_type}]")
}

/// Drop orphan tool messages and degrade unsupported images, keeping order.
///
/// A tool message is an orphan unless its `tool_call_id` was emitted by an
/// earlier assistant message.
pub fn prepare_messages(messages: &[Message], options: PrepareOptions) -> Vec<Message> {
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if message.role == Role::Assistant {
            emitted.extend(message.tool_calls.iter().map(|call| call.id.as_str()));
        }
        if message.role == Role::Tool {
            let linked = message
                .tool_call_id
                .as_deref()
                .is_some_and(|id| emitted.contains(id));
            if !linked {
                tracing::debug!(
                    tool_call_id = ?message.tool_call_id,
                    "dropping orphan tool message"
                );
                continue;
            }
        }

        let images_ok = options.supports_images
            && (message.role != Role::Tool || options.images_in_tool_results);
        if !images_ok && message.has_images() {
            out.push(degrade_images(message));
        } else {
            out.push(message.clone());
        }
    }
    out
}

fn degrade_images(message: &Message) -> Message {
    let mut next = message.clone();
    next.content = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Image(image) => ContentPart::Text {
                text: image_placeholder(&image.mime_type),
            },
            other => other.clone(),
        })
        .collect();
    next
}

/// Pair every assistant tool call with a result directly after it.
///
/// Results inside the span following an assistant turn are reordered to call
/// order; calls without one get a synthetic error result. Strict vendors reject
/// requests where a call goes unanswered.
pub fn fill_missing_tool_results(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(message) = iter.next() {
        if message.role != Role::Assistant || message.tool_calls.is_empty() {
            out.push(message);
            continue;
        }

        let mut results: HashMap<String, Message> = HashMap::new();
        while let Some(next) = iter.next_if(|m| m.role == Role::Tool) {
            if let Some(id) = next.tool_call_id.clone() {
                results.entry(id).or_insert(next);
            }
        }

        let ids: Vec<String> = message.tool_calls.iter().map(|c| c.id.clone()).collect();
        out.push(message);
        for id in ids {
            match results.remove(&id) {
                Some(result) => out.push(result),
                None => out.push(Message::tool_error(
                    id,
                    "missing tool result in transcript; inserted synthetic error result",
                )),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn orphan_tool_messages_are_dropped() {
        let messages = vec![Message::user("hi"), Message::tool_result("missing-id", "x")];
        let prepared = prepare_messages(&messages, PrepareOptions::default());
        assert_eq!(prepared.len(), 1);
        assert!(prepared.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn linked_tool_messages_are_kept_in_order() {
        let messages = vec![
            Message::user("list"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "LS", "{}")]),
            Message::tool_result("c1", "a.txt"),
            Message::assistant("done"),
        ];
        let prepared = prepare_messages(&messages, PrepareOptions::default());
        let roles: Vec<Role> = prepared.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }

    #[test]
    fn result_before_its_call_is_an_orphan() {
        let messages = vec![
            Message::tool_result("c1", "early"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "LS", "{}")]),
        ];
        let prepared = prepare_messages(&messages, PrepareOptions::default());
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].role, Role::Assistant);
    }

    #[test]
    fn images_degrade_when_unsupported() {
        let messages = vec![Message::user_with_image("look", "aGk=", "image/png")];
        let prepared = prepare_messages(
            &messages,
            PrepareOptions {
                supports_images: false,
                images_in_tool_results: false,
            },
        );
        assert_eq!(prepared[0].text(), "look[image omitted: image/png]");
        assert!(!prepared[0].has_images());
    }

    #[test]
    fn missing_results_get_synthetic_errors_in_call_order() {
        let messages = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCall::new("a", "LS", "{}"),
                    ToolCall::new("b", "Read", "{}"),
                ],
            ),
            Message::tool_result("b", "contents"),
            Message::user("next"),
        ];
        let filled = fill_missing_tool_results(messages);
        assert_eq!(filled.len(), 4);
        assert_eq!(filled[1].tool_call_id.as_deref(), Some("a"));
        assert!(filled[1].is_error());
        assert_eq!(filled[2].tool_call_id.as_deref(), Some("b"));
        assert_eq!(filled[2].text(), "contents");
        assert_eq!(filled[3].role, Role::User);
    }
}
