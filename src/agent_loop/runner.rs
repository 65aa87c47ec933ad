//! The agentic loop: model turns, tool approval and tool execution.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bon::Builder;
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SkiffError};
use crate::provider::{ChatRequest, ChatService, ToolDefinition};
use crate::tools::{ToolExecutionContext, ToolExecutor};
use crate::types::{ChatResponse, Message, StreamAccumulator, StreamChunk, ToolCall};

use super::approvals::{ApprovalDecision, ApprovalRequest, PermissionGate, PermissionMode};
use super::events::{EventSink, LoopEvent};
use super::session_log::{SessionEvent, SessionLog};
use super::types::{LoopResult, LoopState, LoopStats};

pub const DEFAULT_MAX_TURNS: usize = 25;

const CANCELLED_TOOL_RESULT: &str = "Tool call cancelled.";

/// Per-task knobs for an [`AgenticLoop`].
#[derive(Debug, Clone, Builder)]
pub struct LoopOptions {
    /// Model calls allowed before the task fails with `MaxTurnsExceeded`.
    #[builder(default = DEFAULT_MAX_TURNS)]
    pub max_turns: usize,
    #[builder(default = true)]
    pub stream: bool,
    #[builder(default)]
    pub permission_mode: PermissionMode,
    #[builder(into)]
    pub system_prompt: Option<String>,
    #[builder(default = PathBuf::from("."), into)]
    pub working_dir: PathBuf,
    #[builder(default = uuid::Uuid::new_v4().to_string(), into)]
    pub session_id: String,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Collaborators a loop is constructed with. Nothing here is global, so
/// independent loops can run side by side.
#[derive(Clone)]
pub struct LoopContext {
    pub chat: Arc<dyn ChatService>,
    pub tools: Arc<dyn ToolExecutor>,
    pub gate: Arc<dyn PermissionGate>,
    pub events: Arc<EventSink>,
    pub session_log: Option<Arc<dyn SessionLog>>,
}

impl LoopContext {
    pub fn new(
        chat: Arc<dyn ChatService>,
        tools: Arc<dyn ToolExecutor>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            chat,
            tools,
            gate,
            events: Arc::new(EventSink::disabled()),
            session_log: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn with_session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.session_log = Some(log);
        self
    }
}

enum Approval {
    Granted,
    Denied(String),
    Cancelled,
}

/// Drives one conversation to a terminal [`LoopState`].
///
/// The loop exclusively owns its message window. One model call is in
/// flight at a time and tool calls run one by one in request order.
pub struct AgenticLoop {
    ctx: LoopContext,
    options: LoopOptions,
    messages: Vec<Message>,
    state: LoopState,
    /// Tools the user approved with "remember" during this loop.
    remembered: HashSet<String>,
}

impl AgenticLoop {
    pub fn new(ctx: LoopContext, options: LoopOptions) -> Self {
        Self {
            ctx,
            options,
            messages: Vec::new(),
            state: LoopState::AwaitingModel,
            remembered: HashSet::new(),
        }
    }

    /// Seed the window with an earlier conversation, e.g. a replayed log.
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.options.session_id
    }

    /// Run `input` as a new user turn until the task reaches a terminal state.
    pub async fn run(&mut self, input: impl Into<String>, cancel: CancellationToken) -> LoopResult {
        let started = Instant::now();
        let mut stats = LoopStats::default();
        let mut partial = String::new();

        self.log(SessionEvent::Started {
            session_id: self.options.session_id.clone(),
            at: Utc::now(),
        });
        self.ctx.events.emit(LoopEvent::Started {
            session_id: self.options.session_id.clone(),
        });

        if self.messages.is_empty() {
            if let Some(system) = self.options.system_prompt.clone() {
                self.push(Message::system(system));
            }
        }
        self.push(Message::user(input));

        let tools = self.ctx.tools.definitions();
        let result = loop {
            match self.turn(&tools, &cancel, &mut stats, &mut partial).await {
                Ok(Some(text)) => break LoopResult::done(text, stats),
                Ok(None) => continue,
                Err(SkiffError::Cancelled) => break LoopResult::cancelled(partial.clone(), stats),
                Err(err) => {
                    tracing::warn!(session_id = %self.options.session_id, error = %err, "loop failed");
                    break LoopResult::failed(err, partial.clone(), stats);
                }
            }
        };
        self.finish(result, started)
    }

    /// One model call plus the tools it asked for. `Ok(Some(text))` ends the
    /// task; `Ok(None)` means another turn follows.
    async fn turn(
        &mut self,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        stats: &mut LoopStats,
        partial: &mut String,
    ) -> Result<Option<String>> {
        if cancel.is_cancelled() {
            return Err(SkiffError::Cancelled);
        }
        if stats.turns >= self.options.max_turns {
            return Err(SkiffError::MaxTurnsExceeded {
                max_turns: self.options.max_turns,
            });
        }

        stats.turns += 1;
        self.state = LoopState::AwaitingModel;
        self.ctx.events.emit(LoopEvent::TurnStarted { turn: stats.turns });
        tracing::debug!(turn = stats.turns, messages = self.messages.len(), "requesting model turn");

        partial.clear();
        let request = ChatRequest::new(self.messages.clone())
            .with_tools(tools.to_vec())
            .with_cancel(cancel.clone());
        let response = if self.options.stream {
            self.stream_turn(&request, cancel, partial, stats).await?
        } else {
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SkiffError::Cancelled),
                response = self.ctx.chat.chat(&request) => response?,
            };
            partial.push_str(&response.content);
            if !response.content.is_empty() {
                // Whole turns surface their text as a single delta.
                self.ctx.events.emit(LoopEvent::TextDelta {
                    text: response.content.clone(),
                });
            }
            response
        };

        self.state = LoopState::ModelResponded;
        let usage = response.usage.unwrap_or_default();
        stats.tokens.merge(&usage);
        self.ctx.events.emit(LoopEvent::TurnFinished {
            turn: stats.turns,
            usage,
        });

        let ChatResponse {
            content, tool_calls, ..
        } = response;
        if tool_calls.is_empty() {
            self.push(Message::assistant(content.clone()));
            return Ok(Some(content));
        }
        self.push(Message::assistant_with_tool_calls(content, tool_calls.clone()));

        for (index, call) in tool_calls.iter().enumerate() {
            if let Err(err) = self.handle_call(call, cancel, stats).await {
                // Every call still needs a result so the window stays valid.
                if err.is_cancelled() {
                    for skipped in &tool_calls[index..] {
                        self.push(Message::tool_error(&skipped.id, CANCELLED_TOOL_RESULT));
                    }
                }
                return Err(err);
            }
        }
        Ok(None)
    }

    /// Approve, execute and record one tool call. Only cancellation is
    /// returned as an error; nothing has been appended for `call` then.
    async fn handle_call(
        &mut self,
        call: &ToolCall,
        cancel: &CancellationToken,
        stats: &mut LoopStats,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SkiffError::Cancelled);
        }
        self.ctx.events.emit(LoopEvent::ToolCallStarted {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments_value(),
        });

        self.state = LoopState::AwaitingToolApproval;
        let (success, content, metadata) = match self.approve(call, cancel).await {
            Approval::Cancelled => return Err(SkiffError::Cancelled),
            Approval::Denied(reason) => {
                tracing::info!(tool = %call.name, "tool call denied");
                (false, reason, serde_json::Map::new())
            }
            Approval::Granted => {
                self.state = LoopState::ExecutingTools;
                stats.tool_calls += 1;
                let tool_ctx = ToolExecutionContext::new(&self.options.working_dir, cancel.clone())
                    .with_session(&self.options.session_id);
                match self.ctx.tools.execute(call, &tool_ctx).await {
                    Ok(outcome) => {
                        if let Some(usage) = &outcome.usage {
                            stats.tokens.merge(usage);
                        }
                        (outcome.success, outcome.content, outcome.metadata)
                    }
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        tracing::debug!(tool = %call.name, error = %err, "tool call failed");
                        (false, err.to_string(), serde_json::Map::new())
                    }
                }
            }
        };

        let mut message = if success {
            Message::tool_result(&call.id, content.clone())
        } else {
            Message::tool_error(&call.id, content.clone())
        };
        for (key, value) in metadata {
            message = message.with_metadata(key, value);
        }
        self.push(message);
        self.ctx.events.emit(LoopEvent::ToolCallFinished {
            id: call.id.clone(),
            name: call.name.clone(),
            success,
            content,
        });
        Ok(())
    }

    async fn approve(&mut self, call: &ToolCall, cancel: &CancellationToken) -> Approval {
        if self.remembered.contains(&call.name) {
            return Approval::Granted;
        }
        let read_only = self.ctx.tools.is_read_only(&call.name);
        match self.options.permission_mode.decide(read_only) {
            ApprovalDecision::Allow => Approval::Granted,
            ApprovalDecision::Deny => Approval::Denied(format!(
                "Permission denied: {} is not allowed in {} mode.",
                call.name, self.options.permission_mode
            )),
            ApprovalDecision::Ask => {
                let request = ApprovalRequest::for_call(&self.options.session_id, call);
                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.ctx.gate.cancel_pending(&self.options.session_id);
                        return Approval::Cancelled;
                    }
                    response = self.ctx.gate.request_approval(request) => response,
                };
                if !response.approved {
                    return Approval::Denied(format!(
                        "Permission denied: the user declined to run {}.",
                        call.name
                    ));
                }
                if response.remember {
                    self.remembered.insert(call.name.clone());
                }
                Approval::Granted
            }
        }
    }

    /// Consume one streamed turn. Text seen so far is mirrored into
    /// `partial`, and usage seen so far lands in `stats`, so a cancelled or
    /// failed turn can still report both.
    async fn stream_turn(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        partial: &mut String,
        stats: &mut LoopStats,
    ) -> Result<ChatResponse> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SkiffError::Cancelled),
            stream = self.ctx.chat.stream_chat(request) => stream?,
        };

        let mut acc = StreamAccumulator::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Some(Err(SkiffError::Cancelled)),
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    if let Some(usage) = acc.usage() {
                        stats.tokens.merge(&usage);
                    }
                    return Err(err);
                }
                None => break,
            };
            if let StreamChunk::TextDelta { text } = &chunk {
                partial.push_str(text);
                self.ctx
                    .events
                    .emit(LoopEvent::TextDelta { text: text.clone() });
            }
            acc.push(&chunk);
        }
        Ok(acc.finish())
    }

    fn push(&mut self, message: Message) {
        self.log(SessionEvent::Message {
            message: message.clone(),
        });
        self.messages.push(message);
    }

    fn log(&self, event: SessionEvent) {
        let Some(log) = &self.ctx.session_log else { return };
        if let Err(e) = log.append(&event) {
            tracing::warn!(error = %e, "failed to append session event");
        }
    }

    fn finish(&mut self, mut result: LoopResult, started: Instant) -> LoopResult {
        result.stats.duration = started.elapsed();
        self.state = result.state;
        self.log(SessionEvent::Finished {
            state: result.state,
            usage: result.stats.tokens,
            at: Utc::now(),
        });
        self.ctx.events.emit(LoopEvent::Finished {
            state: result.state,
            message: result.message.clone(),
        });
        tracing::info!(
            session_id = %self.options.session_id,
            state = %result.state,
            turns = result.stats.turns,
            tool_calls = result.stats.tool_calls,
            "loop finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = LoopOptions::default();
        assert_eq!(options.max_turns, DEFAULT_MAX_TURNS);
        assert!(options.stream);
        assert_eq!(options.permission_mode, PermissionMode::Ask);
        assert!(!options.session_id.is_empty());
    }

    #[test]
    fn builder_overrides() {
        let options = LoopOptions::builder()
            .max_turns(3)
            .stream(false)
            .system_prompt("be brief")
            .session_id("s1")
            .build();
        assert_eq!(options.max_turns, 3);
        assert_eq!(options.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(options.session_id, "s1");
    }
}
