//! Streaming types.

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::generation::{ChatResponse, FinishReason};
use super::message::ToolCall;
use super::usage::Usage;
use crate::error::SkiffError;

/// Finite, non-restartable sequence of chunks for one model turn.
pub type ChatStream = BoxStream<'static, Result<StreamChunk, SkiffError>>;

/// One incremental piece of a streamed model turn, in temporal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta {
        text: String,
    },
    /// Fragment of the tool call at `index`. `id` and `name` usually arrive
    /// once, on the first fragment; `arguments` fragments concatenate.
    ToolCallDelta {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    /// Counters observed so far. The last one seen in a turn is authoritative.
    Usage {
        usage: Usage,
    },
    /// Always the last chunk of a turn.
    Finish {
        reason: FinishReason,
    },
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Folds a chunk sequence into the equivalent [`ChatResponse`].
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { text } => self.text.push_str(text),
            StreamChunk::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let entry = self.tool_calls.entry(*index).or_default();
                if id.is_some() {
                    entry.id.clone_from(id);
                }
                if name.is_some() {
                    entry.name.clone_from(name);
                }
                entry.arguments.push_str(arguments);
            }
            StreamChunk::Usage { usage } => self.usage = Some(*usage),
            StreamChunk::Finish { reason } => self.finish_reason = Some(*reason),
        }
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Last usage report seen so far.
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish(self) -> ChatResponse {
        let tool_calls = self
            .tool_calls
            .into_values()
            .filter_map(|partial| {
                let Some(name) = partial.name else {
                    tracing::warn!("dropping streamed tool call without a name");
                    return None;
                };
                let id = partial
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                Some(ToolCall {
                    id,
                    name,
                    arguments: partial.arguments,
                })
            })
            .collect();
        ChatResponse {
            content: self.text,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_tool_calls_by_index_in_order() {
        let mut acc = StreamAccumulator::new();
        for chunk in [
            StreamChunk::ToolCallDelta {
                index: 1,
                id: Some("b".into()),
                name: Some("Read".into()),
                arguments: "{\"pa".into(),
            },
            StreamChunk::ToolCallDelta {
                index: 0,
                id: Some("a".into()),
                name: Some("LS".into()),
                arguments: "{}".into(),
            },
            StreamChunk::ToolCallDelta {
                index: 1,
                id: None,
                name: None,
                arguments: "th\":\"x\"}".into(),
            },
            StreamChunk::Finish {
                reason: FinishReason::ToolCalls,
            },
        ] {
            acc.push(&chunk);
        }
        let response = acc.finish();
        assert_eq!(
            response.tool_calls,
            vec![
                ToolCall::new("a", "LS", "{}"),
                ToolCall::new("b", "Read", "{\"path\":\"x\"}"),
            ]
        );
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn last_usage_observation_wins() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamChunk::Usage {
            usage: Usage::new(10, 0),
        });
        acc.push(&StreamChunk::TextDelta { text: "hi".into() });
        acc.push(&StreamChunk::Usage {
            usage: Usage::new(10, 4),
        });
        let response = acc.finish();
        assert_eq!(response.usage, Some(Usage::new(10, 4)));
        assert_eq!(response.content, "hi");
    }
}
