//! Shared test helpers: a scripted chat service.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use skiff::config::{ChatConfig, ChatConfigUpdate};
use skiff::error::{Result, SkiffError};
use skiff::provider::{ChatRequest, ChatService};
use skiff::types::*;

/// One scripted model turn.
pub enum Step {
    Reply(ChatResponse),
    Fail(SkiffError),
    /// Stream `text` as deltas, then never finish.
    Stall(String),
    /// Stream `chunks`, then never finish.
    StallWith(Vec<StreamChunk>),
}

/// A chat service that replays scripted turns and records every request.
pub struct ScriptedChatService {
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<ChatResponse>,
    requests: Mutex<Vec<Vec<Message>>>,
    offered: Mutex<Vec<Vec<String>>>,
    config: Mutex<ChatConfig>,
}

impl ScriptedChatService {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
            config: Mutex::new(ChatConfig::new("scripted-model")),
        }
    }

    /// Answer every request with `response`.
    pub fn repeating(response: ChatResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// Tool names offered with each request.
    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_step(&self, request: &ChatRequest) -> Step {
        self.requests.lock().unwrap().push(request.messages.clone());
        self.offered
            .lock()
            .unwrap()
            .push(request.tools.iter().map(|t| t.name.clone()).collect());
        match self.steps.lock().unwrap().pop_front() {
            Some(step) => step,
            None => match &self.fallback {
                Some(response) => Step::Reply(response.clone()),
                None => Step::Fail(SkiffError::MalformedResponse("script exhausted".into())),
            },
        }
    }
}

pub fn usage(input: u32, output: u32) -> Usage {
    Usage::new(input, output)
}

pub fn text_reply(text: &str) -> Step {
    Step::Reply(ChatResponse::text(text).with_usage(usage(10, 5)))
}

pub fn tool_reply(id: &str, name: &str, args: serde_json::Value) -> Step {
    Step::Reply(tool_response(id, name, args))
}

pub fn tool_response(id: &str, name: &str, args: serde_json::Value) -> ChatResponse {
    ChatResponse::text("")
        .with_tool_calls(vec![ToolCall::new(id, name, args.to_string())])
        .with_usage(usage(10, 5))
}

/// Split a response into the chunk sequence a streaming adapter would emit.
pub fn chunks_of(response: &ChatResponse) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = response
        .content
        .split_inclusive(' ')
        .map(|piece| StreamChunk::TextDelta {
            text: piece.to_string(),
        })
        .collect();
    for (index, call) in response.tool_calls.iter().enumerate() {
        chunks.push(StreamChunk::ToolCallDelta {
            index,
            id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            arguments: call.arguments.clone(),
        });
    }
    if let Some(usage) = response.usage {
        chunks.push(StreamChunk::Usage { usage });
    }
    chunks.push(StreamChunk::Finish {
        reason: response.finish_reason.unwrap_or(FinishReason::Stop),
    });
    chunks
}

#[async_trait]
impl ChatService for ScriptedChatService {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        match self.next_step(request) {
            Step::Reply(response) => Ok(response),
            Step::Fail(err) => Err(err),
            Step::Stall(_) | Step::StallWith(_) => futures::future::pending().await,
        }
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        match self.next_step(request) {
            Step::Reply(response) => {
                Ok(futures::stream::iter(chunks_of(&response).into_iter().map(Ok)).boxed())
            }
            Step::Fail(err) => Err(err),
            Step::Stall(text) => {
                let head = futures::stream::iter(vec![Ok(StreamChunk::TextDelta { text })]);
                Ok(head.chain(futures::stream::pending()).boxed())
            }
            Step::StallWith(chunks) => {
                let head = futures::stream::iter(chunks.into_iter().map(Ok));
                Ok(head.chain(futures::stream::pending()).boxed())
            }
        }
    }

    fn config(&self) -> ChatConfig {
        self.config.lock().unwrap().clone()
    }

    fn update_config(&self, update: ChatConfigUpdate) {
        update.apply(&mut self.config.lock().unwrap());
    }
}
