//! Shared streaming driver: transport bytes -> vendor parser -> chunks.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::http::{SseDecoder, SseEvent};
use crate::error::{Result, SkiffError};
use crate::types::{ChatStream, FinishReason, StreamChunk};

/// Translates one vendor event payload into canonical chunks.
pub(crate) trait StreamParser: Send + 'static {
    fn parse_event(&mut self, data: &str) -> Result<Vec<StreamChunk>>;
}

/// Holds back vendor finish reasons so exactly one `Finish` ends the turn,
/// after any usage the vendor reports late.
#[derive(Debug, Default)]
struct FinishGate {
    reason: Option<FinishReason>,
    saw_tool_calls: bool,
}

impl FinishGate {
    fn observe(&mut self, chunk: StreamChunk) -> Option<StreamChunk> {
        match chunk {
            StreamChunk::Finish { reason } => {
                self.reason = Some(reason);
                None
            }
            StreamChunk::ToolCallDelta { .. } => {
                self.saw_tool_calls = true;
                Some(chunk)
            }
            other => Some(other),
        }
    }

    fn finish(self) -> StreamChunk {
        let reason = match self.reason {
            Some(FinishReason::Stop) | None if self.saw_tool_calls => FinishReason::ToolCalls,
            Some(reason) => reason,
            None => FinishReason::Stop,
        };
        StreamChunk::Finish { reason }
    }
}

/// Drive an event-stream body through `parser`.
///
/// Transport errors and parser errors end the stream with that error and no
/// `Finish`. Cancellation ends it with [`SkiffError::Cancelled`].
pub(crate) fn drive<S, B, P>(bytes: S, mut parser: P, cancel: Option<CancellationToken>) -> ChatStream
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    P: StreamParser,
{
    let cancel = cancel.unwrap_or_default();
    let stream = async_stream::stream! {
        futures::pin_mut!(bytes);
        let mut decoder = SseDecoder::new();
        let mut gate = FinishGate::default();

        'transport: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = bytes.next() => Some(next),
            };
            let Some(next) = next else {
                yield Err(SkiffError::Cancelled);
                return;
            };
            let (events, ended) = match next {
                Some(Ok(chunk)) => (decoder.push(chunk.as_ref()), false),
                Some(Err(e)) => {
                    yield Err(SkiffError::Transport(e));
                    return;
                }
                None => (decoder.finish(), true),
            };

            for event in events {
                let data = match event {
                    SseEvent::Done => break 'transport,
                    SseEvent::Data(data) => data,
                };
                match parser.parse_event(&data) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if let Some(chunk) = gate.observe(chunk) {
                                yield Ok(chunk);
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if ended {
                break;
            }
        }

        yield Ok(gate.finish());
    };
    Box::pin(stream)
}

/// Decode a JSON event payload, naming the vendor on failure.
pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(vendor: &str, data: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| SkiffError::MalformedResponse(format!("{vendor} stream event: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;
    use futures::stream;

    /// Payload is either `text`, `tool`, `usage:N` or `finish`.
    struct Scripted;

    impl StreamParser for Scripted {
        fn parse_event(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
            Ok(match data {
                "tool" => vec![StreamChunk::ToolCallDelta {
                    index: 0,
                    id: Some("c".into()),
                    name: Some("LS".into()),
                    arguments: "{}".into(),
                }],
                "finish" => vec![StreamChunk::Finish {
                    reason: FinishReason::Stop,
                }],
                "bad" => return Err(SkiffError::MalformedResponse("bad".into())),
                other => match other.strip_prefix("usage:") {
                    Some(n) => vec![StreamChunk::Usage {
                        usage: Usage::new(1, n.parse().unwrap()),
                    }],
                    None => vec![StreamChunk::TextDelta { text: other.into() }],
                },
            })
        }
    }

    fn body(parts: &[&'static str]) -> impl Stream<Item = std::result::Result<Vec<u8>, reqwest::Error>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(p.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(stream: ChatStream) -> Vec<Result<StreamChunk>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn finish_is_emitted_once_after_late_usage() {
        let chunks = collect(drive(
            body(&["data: hi\n\n", "data: finish\n\n", "data: usage:3\n\n", "data: [DONE]\n\n"]),
            Scripted,
            None,
        ))
        .await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(
            chunks,
            vec![
                StreamChunk::TextDelta { text: "hi".into() },
                StreamChunk::Usage {
                    usage: Usage::new(1, 3)
                },
                StreamChunk::Finish {
                    reason: FinishReason::Stop
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_finish_is_synthesised_from_tool_calls() {
        let chunks = collect(drive(body(&["data: tool\n\n"]), Scripted, None)).await;
        assert_eq!(
            chunks.last().unwrap().as_ref().unwrap(),
            &StreamChunk::Finish {
                reason: FinishReason::ToolCalls
            }
        );
    }

    #[tokio::test]
    async fn parser_error_ends_stream_without_finish() {
        let chunks = collect(drive(body(&["data: a\n\ndata: bad\n\ndata: b\n\n"]), Scripted, None)).await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(SkiffError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn cancelled_token_ends_stream() {
        let token = CancellationToken::new();
        token.cancel();
        let chunks = collect(drive(body(&["data: a\n\n"]), Scripted, Some(token))).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(SkiffError::Cancelled)));
    }
}
