//! Anthropic Messages API adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ChatConfig, ChatConfigUpdate};
use crate::error::{Result, SkiffError};
use crate::types::*;

use super::format::{
    alternate_turns, split_system, tool_result_text, AlternatingTurn, Speaker,
    LEADING_TURN_PLACEHOLDER,
};
use super::http::{anthropic_headers, build_client, read_json, send};
use super::sanitize::{fill_missing_tool_results, prepare_messages, PrepareOptions};
use super::schema::sanitize_tool_schema;
use super::stream::{drive, parse_payload, StreamParser};
use super::{ChatRequest, ChatService, SharedConfig, ToolDefinition};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicService {
    config: SharedConfig,
    client: reqwest::Client,
}

impl AnthropicService {
    pub fn new(config: ChatConfig) -> Result<Self> {
        Ok(Self::with_client(config, build_client()?))
    }

    pub fn with_client(config: ChatConfig, client: reqwest::Client) -> Self {
        Self {
            config: SharedConfig::new(config),
            client,
        }
    }

    async fn open(
        &self,
        config: &ChatConfig,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{}/messages", base.trim_end_matches('/'));
        let body = build_request_body(config, request, stream);
        debug!(
            provider = "anthropic",
            model = %config.model,
            stream,
            turns = body.messages.len(),
            "messages request"
        );
        let builder = self
            .client
            .post(&url)
            .headers(anthropic_headers(config.api_key_or_empty(), API_VERSION))
            .json(&body);
        send(builder, request.cancel.as_ref()).await
    }
}

#[async_trait]
impl ChatService for AnthropicService {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, false).await?;
        let data: MessagesResponse = read_json(response, request.cancel.as_ref()).await?;
        Ok(parse_response(data))
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, true).await?;
        Ok(drive(
            response.bytes_stream(),
            AnthropicStreamParser::default(),
            request.cancel.clone(),
        ))
    }

    fn config(&self) -> ChatConfig {
        self.config.snapshot()
    }

    fn update_config(&self, update: ChatConfigUpdate) {
        self.config.update(update);
    }
}

fn build_request_body<'a>(
    config: &'a ChatConfig,
    request: &ChatRequest,
    stream: bool,
) -> MessagesRequest<'a> {
    let prepared = prepare_messages(
        &request.messages,
        PrepareOptions {
            supports_images: config.supports_images,
            images_in_tool_results: false,
        },
    );
    let (system, rest) = split_system(fill_missing_tool_results(prepared));

    let turns = rest
        .iter()
        .map(to_anthropic_message)
        .filter(|m| !m.content.is_empty())
        .collect();

    MessagesRequest {
        model: &config.model,
        max_tokens: config.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages: alternate_turns(turns),
        system,
        tools: request.tools.iter().map(to_anthropic_tool).collect(),
        temperature: config.temperature,
        stream,
    }
}

fn to_anthropic_message(message: &Message) -> AnthropicMessage {
    match message.role {
        // Tool results travel as user turns.
        Role::Tool => AnthropicMessage {
            role: AnthropicRole::User,
            content: vec![Block::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: tool_result_text(message.text()),
                is_error: message.is_error(),
            }],
        },
        Role::Assistant => {
            let mut content = content_blocks(&message.content);
            content.extend(message.tool_calls.iter().map(|call| Block::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments_value(),
            }));
            AnthropicMessage {
                role: AnthropicRole::Assistant,
                content,
            }
        }
        Role::User | Role::System => AnthropicMessage {
            role: AnthropicRole::User,
            content: content_blocks(&message.content),
        },
    }
}

fn content_blocks(parts: &[ContentPart]) -> Vec<Block> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(Block::Text { text: text.clone() }),
            ContentPart::Image(image) => Some(Block::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: image.mime_type.clone(),
                    data: image.data.clone(),
                },
            }),
        })
        .collect()
}

fn to_anthropic_tool(tool: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: sanitize_tool_schema(&tool.parameters),
    }
}

fn parse_response(data: MessagesResponse) -> ChatResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in data.content {
        match block {
            ResponseBlock::Text { text } => content.push_str(&text),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id, name, input.to_string()));
            }
            ResponseBlock::Other => {}
        }
    }
    ChatResponse {
        content,
        tool_calls,
        usage: data.usage.map(|u| u.apply(Usage::default())),
        finish_reason: data.stop_reason.as_deref().map(parse_stop_reason),
    }
}

fn parse_stop_reason(s: &str) -> FinishReason {
    match s {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Typed Messages API event stream.
///
/// Usage arrives split: input counts on `message_start`, output counts on
/// `message_delta`. Both fold into one running snapshot.
#[derive(Default)]
struct AnthropicStreamParser {
    usage: Usage,
    /// Content block index -> tool call index.
    tool_indices: HashMap<usize, usize>,
}

impl AnthropicStreamParser {
    fn usage_chunk(&mut self, report: AnthropicUsage) -> StreamChunk {
        self.usage = report.apply(self.usage);
        StreamChunk::Usage { usage: self.usage }
    }
}

impl StreamParser for AnthropicStreamParser {
    fn parse_event(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let event: StreamEvent = parse_payload("anthropic", data)?;
        let chunks = match event {
            StreamEvent::MessageStart { message } => {
                message.usage.map(|u| vec![self.usage_chunk(u)]).unwrap_or_default()
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: StartBlock::ToolUse { id, name },
            } => {
                let tool_index = self.tool_indices.len();
                self.tool_indices.insert(index, tool_index);
                vec![StreamChunk::ToolCallDelta {
                    index: tool_index,
                    id: Some(id),
                    name: Some(name),
                    arguments: String::new(),
                }]
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![StreamChunk::TextDelta { text }]
                }
                BlockDelta::InputJsonDelta { partial_json } => match self.tool_indices.get(&index) {
                    Some(&tool_index) => vec![StreamChunk::ToolCallDelta {
                        index: tool_index,
                        id: None,
                        name: None,
                        arguments: partial_json,
                    }],
                    None => Vec::new(),
                },
                _ => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let mut chunks = Vec::new();
                if let Some(usage) = usage {
                    chunks.push(self.usage_chunk(usage));
                }
                if let Some(reason) = delta.stop_reason.as_deref() {
                    chunks.push(StreamChunk::Finish {
                        reason: parse_stop_reason(reason),
                    });
                }
                chunks
            }
            StreamEvent::Error { error } => return Err(stream_error(error)),
            StreamEvent::ContentBlockStart { .. }
            | StreamEvent::ContentBlockStop
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Unknown => Vec::new(),
        };
        Ok(chunks)
    }
}

fn stream_error(error: ErrorBody) -> SkiffError {
    match error.kind.as_str() {
        "authentication_error" => SkiffError::Authentication(error.message),
        "permission_error" => SkiffError::PermissionDenied(error.message),
        "rate_limit_error" => SkiffError::RateLimited {
            retry_after_ms: None,
        },
        "overloaded_error" => SkiffError::api(529, error.message),
        _ => SkiffError::Stream(format!("{}: {}", error.kind, error.message)),
    }
}

// Wire types (request)

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum AnthropicRole {
    User,
    Assistant,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: AnthropicRole,
    content: Vec<Block>,
}

impl AlternatingTurn for AnthropicMessage {
    fn speaker(&self) -> Speaker {
        match self.role {
            AnthropicRole::User => Speaker::User,
            AnthropicRole::Assistant => Speaker::Model,
        }
    }

    fn absorb(&mut self, next: Self) {
        self.content.extend(next.content);
    }

    fn placeholder_user() -> Self {
        Self {
            role: AnthropicRole::User,
            content: vec![Block::Text {
                text: LEADING_TURN_PLACEHOLDER.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// Wire types (response)

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}

impl AnthropicUsage {
    /// Overlay the fields present in this report onto `base`.
    fn apply(self, base: Usage) -> Usage {
        let mut usage = base;
        if let Some(v) = self.input_tokens {
            usage.input_tokens = v;
        }
        if let Some(v) = self.output_tokens {
            usage.output_tokens = v;
        }
        if self.cache_read_input_tokens.is_some() {
            usage.cache_read_tokens = self.cache_read_input_tokens;
        }
        usage.total_tokens = usage.input_tokens + usage.output_tokens;
        usage
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct StartMessage {
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}
