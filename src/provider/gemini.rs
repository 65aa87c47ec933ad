//! Google Gemini API adapter.

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
use super::http::{build_client, key_headers, read_json, send};
use super::sanitize::{fill_missing_tool_results, prepare_messages, PrepareOptions};
use super::schema::sanitize_tool_schema;
use super::stream::{drive, parse_payload, StreamParser};
use super::{ChatRequest, ChatService, SharedConfig, ToolDefinition};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiService {
    config: SharedConfig,
    client: reqwest::Client,
}

impl GeminiService {
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
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/models/{}:{}",
            base.trim_end_matches('/'),
            config.model,
            method
        );
        let body = build_generate_request(config, request);
        debug!(
            provider = "gemini",
            model = %config.model,
            stream,
            turns = body.contents.len(),
            "generateContent request"
        );
        let builder = self
            .client
            .post(&url)
            .headers(key_headers("x-goog-api-key", config.api_key_or_empty()))
            .json(&body);
        send(builder, request.cancel.as_ref()).await
    }
}

#[async_trait]
impl ChatService for GeminiService {
    fn provider_name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, false).await?;
        let data: GenerateContentResponse = read_json(response, request.cancel.as_ref()).await?;
        parse_generate_response(data)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, true).await?;
        Ok(drive(
            response.bytes_stream(),
            GeminiStreamParser::plain(),
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

/// Build the `generateContent` body shared with the Code Assist gateway.
pub(crate) fn build_generate_request(
    config: &ChatConfig,
    request: &ChatRequest,
) -> GenerateContentRequest {
    let prepared = prepare_messages(
        &request.messages,
        PrepareOptions {
            supports_images: config.supports_images,
            images_in_tool_results: false,
        },
    );
    let (system, rest) = split_system(fill_missing_tool_results(prepared));

    // functionResponse carries the function name, not the call id.
    let call_names: HashMap<&str, &str> = rest
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|call| (call.id.as_str(), call.name.as_str()))
        .collect();

    let contents = rest
        .iter()
        .map(|message| to_content(message, &call_names))
        .filter(|content| !content.parts.is_empty())
        .collect();

    let declarations: Vec<FunctionDeclaration> =
        request.tools.iter().map(to_declaration).collect();
    let tools = if declarations.is_empty() {
        Vec::new()
    } else {
        vec![GeminiTool {
            function_declarations: declarations,
        }]
    };

    let generation_config = (config.temperature.is_some() || config.max_output_tokens.is_some())
        .then_some(GenerationConfig {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        });

    GenerateContentRequest {
        contents: alternate_turns(contents),
        system_instruction: system.map(|text| Content {
            role: None,
            parts: vec![Part::Text(text)],
        }),
        tools,
        generation_config,
    }
}

fn to_content(message: &Message, call_names: &HashMap<&str, &str>) -> Content {
    match message.role {
        Role::Tool => {
            let id = message.tool_call_id.as_deref().unwrap_or_default();
            let name = call_names.get(id).copied().unwrap_or(id).to_string();
            let text = tool_result_text(message.text());
            let response = if message.is_error() {
                serde_json::json!({ "error": text })
            } else {
                serde_json::json!({ "content": text })
            };
            Content {
                role: Some(GeminiRole::User),
                parts: vec![Part::FunctionResponse(FunctionResponse { name, response })],
            }
        }
        Role::Assistant => {
            let mut parts = content_parts(&message.content);
            parts.extend(message.tool_calls.iter().map(|call| {
                Part::FunctionCall(FunctionCall {
                    name: call.name.clone(),
                    args: call.arguments_value(),
                })
            }));
            Content {
                role: Some(GeminiRole::Model),
                parts,
            }
        }
        Role::User | Role::System => Content {
            role: Some(GeminiRole::User),
            parts: content_parts(&message.content),
        },
    }
}

fn content_parts(parts: &[ContentPart]) -> Vec<Part> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(Part::Text(text.clone())),
            ContentPart::Image(image) => Some(Part::InlineData(InlineData {
                mime_type: image.mime_type.clone(),
                data: image.data.clone(),
            })),
        })
        .collect()
}

fn to_declaration(tool: &ToolDefinition) -> FunctionDeclaration {
    let parameters = sanitize_tool_schema(&tool.parameters);
    let has_properties = parameters
        .get("properties")
        .and_then(|p| p.as_object())
        .is_some_and(|p| !p.is_empty());
    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: has_properties.then_some(parameters),
    }
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Convert a `generateContent` reply.
pub(crate) fn parse_generate_response(data: GenerateContentResponse) -> Result<ChatResponse> {
    let usage = data.usage_metadata.map(Usage::from);
    let Some(candidate) = data.candidates.and_then(|c| c.into_iter().next()) else {
        if let Some(reason) = data.prompt_feedback.and_then(|f| f.block_reason) {
            debug!(block_reason = %reason, "prompt blocked");
            return Ok(ChatResponse {
                usage,
                finish_reason: Some(FinishReason::ContentFilter),
                ..Default::default()
            });
        }
        return Err(SkiffError::MalformedResponse(
            "response has no candidates".into(),
        ));
    };

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if part.thought.unwrap_or(false) {
            continue;
        }
        if let Some(text) = part.text {
            content.push_str(&text);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall::new(new_call_id(), call.name, call.args.to_string()));
        }
    }

    let mut finish_reason = candidate.finish_reason.as_deref().map(parse_finish_reason);
    if !tool_calls.is_empty() && finish_reason != Some(FinishReason::ContentFilter) {
        finish_reason = Some(FinishReason::ToolCalls);
    }

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        finish_reason,
    })
}

fn parse_finish_reason(s: &str) -> FinishReason {
    match s {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    }
}

/// `streamGenerateContent?alt=sse` payloads, optionally inside a
/// `{"response": ...}` envelope.
pub(crate) struct GeminiStreamParser {
    enveloped: bool,
    next_tool: usize,
}

impl GeminiStreamParser {
    pub(crate) fn plain() -> Self {
        Self {
            enveloped: false,
            next_tool: 0,
        }
    }

    pub(crate) fn enveloped() -> Self {
        Self {
            enveloped: true,
            next_tool: 0,
        }
    }
}

impl StreamParser for GeminiStreamParser {
    fn parse_event(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let event: GenerateContentResponse = if self.enveloped {
            parse_payload::<Envelope>("code-assist", data)?.response
        } else {
            parse_payload("gemini", data)?
        };

        let mut chunks = Vec::new();
        if let Some(candidate) = event.candidates.and_then(|c| c.into_iter().next()) {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if part.thought.unwrap_or(false) {
                    continue;
                }
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    chunks.push(StreamChunk::TextDelta { text });
                }
                if let Some(call) = part.function_call {
                    // Gemini sends each call whole.
                    chunks.push(StreamChunk::ToolCallDelta {
                        index: self.next_tool,
                        id: Some(new_call_id()),
                        name: Some(call.name),
                        arguments: call.args.to_string(),
                    });
                    self.next_tool += 1;
                }
            }
            if let Some(reason) = candidate.finish_reason.as_deref() {
                chunks.push(StreamChunk::Finish {
                    reason: parse_finish_reason(reason),
                });
            }
        } else if event.prompt_feedback.and_then(|f| f.block_reason).is_some() {
            chunks.push(StreamChunk::Finish {
                reason: FinishReason::ContentFilter,
            });
        }
        if let Some(usage) = event.usage_metadata {
            chunks.push(StreamChunk::Usage {
                usage: usage.into(),
            });
        }
        Ok(chunks)
    }
}

// Wire types (request)

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub(crate) contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum GeminiRole {
    User,
    Model,
}

#[derive(Debug, Serialize)]
pub(crate) struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<GeminiRole>,
    pub(crate) parts: Vec<Part>,
}

impl AlternatingTurn for Content {
    fn speaker(&self) -> Speaker {
        match self.role {
            Some(GeminiRole::Model) => Speaker::Model,
            _ => Speaker::User,
        }
    }

    fn absorb(&mut self, next: Self) {
        self.parts.extend(next.parts);
    }

    fn placeholder_user() -> Self {
        Self {
            role: Some(GeminiRole::User),
            parts: vec![Part::Text(LEADING_TURN_PLACEHOLDER.to_string())],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum Part {
    Text(String),
    InlineData(InlineData),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

// Wire types (response)

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

/// Code Assist wraps every reply in `{"response": ...}`.
#[derive(Deserialize)]
pub(crate) struct Envelope {
    pub(crate) response: GenerateContentResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<FunctionCall>,
    thought: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    total_token_count: Option<u32>,
    cached_content_token_count: Option<u32>,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        let mut usage = Usage::new(u.prompt_token_count, u.candidates_token_count);
        if let Some(total) = u.total_token_count {
            usage.total_tokens = total;
        }
        usage.cache_read_tokens = u.cached_content_token_count;
        usage
    }
}
