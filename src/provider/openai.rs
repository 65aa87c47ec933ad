//! OpenAI Chat Completions adapter.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ChatConfig, ChatConfigUpdate};
use crate::error::{Result, SkiffError};
use crate::types::*;

use super::format::{split_system, tool_result_text};
use super::http::{bearer_headers, build_client, key_headers, read_json, send};
use super::sanitize::{prepare_messages, PrepareOptions};
use super::schema::sanitize_tool_schema;
use super::stream::{drive, parse_payload, StreamParser};
use super::{ChatRequest, ChatService, SharedConfig, ToolDefinition};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Where requests go and how they authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
    OpenAi,
    /// Deployment-scoped URL, `api-version` query, `api-key` header.
    Azure,
}

pub struct OpenAiService {
    config: SharedConfig,
    client: reqwest::Client,
    flavor: Flavor,
}

impl OpenAiService {
    pub fn new(config: ChatConfig) -> Result<Self> {
        Ok(Self::with_client(config, build_client()?))
    }

    pub fn with_client(config: ChatConfig, client: reqwest::Client) -> Self {
        Self::with_flavor(config, client, Flavor::OpenAi)
    }

    pub(crate) fn with_flavor(config: ChatConfig, client: reqwest::Client, flavor: Flavor) -> Self {
        Self {
            config: SharedConfig::new(config),
            client,
            flavor,
        }
    }

    fn endpoint(&self, config: &ChatConfig) -> Result<String> {
        match self.flavor {
            Flavor::OpenAi => {
                let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
                Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
            }
            Flavor::Azure => {
                let endpoint = config.base_url.as_deref().ok_or_else(|| {
                    SkiffError::Configuration("Azure OpenAI needs an endpoint".into())
                })?;
                let deployment = config.deployment.as_deref().unwrap_or(&config.model);
                let api_version = config.api_version.as_deref().ok_or_else(|| {
                    SkiffError::Configuration("Azure OpenAI needs an api-version".into())
                })?;
                Ok(format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint.trim_end_matches('/'),
                    deployment,
                    api_version
                ))
            }
        }
    }

    fn headers(&self, config: &ChatConfig) -> HeaderMap {
        match self.flavor {
            Flavor::OpenAi => bearer_headers(config.api_key_or_empty()),
            Flavor::Azure => key_headers("api-key", config.api_key_or_empty()),
        }
    }

    async fn open(
        &self,
        config: &ChatConfig,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(config)?;
        let body = build_request_body(config, request, stream);
        debug!(
            provider = self.provider_name(),
            model = %config.model,
            stream,
            messages = body.messages.len(),
            "chat completion request"
        );
        let builder = self
            .client
            .post(&url)
            .headers(self.headers(config))
            .json(&body);
        send(builder, request.cancel.as_ref()).await
    }
}

#[async_trait]
impl ChatService for OpenAiService {
    fn provider_name(&self) -> &str {
        match self.flavor {
            Flavor::OpenAi => "openai",
            Flavor::Azure => "azure",
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, false).await?;
        let data: CompletionResponse = read_json(response, request.cancel.as_ref()).await?;
        parse_completion(data)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, true).await?;
        Ok(drive(
            response.bytes_stream(),
            OpenAiStreamParser,
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
) -> CompletionRequest<'a> {
    let prepared = prepare_messages(
        &request.messages,
        PrepareOptions {
            supports_images: config.supports_images,
            images_in_tool_results: false,
        },
    );
    let (system, rest) = split_system(prepared);

    let mut messages = Vec::with_capacity(rest.len() + 1);
    if let Some(content) = system {
        messages.push(WireMessage::System { content });
    }
    messages.extend(rest.iter().map(to_wire_message));

    CompletionRequest {
        model: &config.model,
        messages,
        tools: request.tools.iter().map(to_wire_tool).collect(),
        temperature: config.temperature,
        max_tokens: config.max_output_tokens,
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    }
}

fn to_wire_message(message: &Message) -> WireMessage {
    match message.role {
        Role::System => WireMessage::System {
            content: message.text(),
        },
        Role::User => {
            let only_text = message
                .content
                .iter()
                .all(|part| matches!(part, ContentPart::Text { .. }));
            let content = if only_text {
                WireContent::Text(message.text())
            } else {
                WireContent::Parts(message.content.iter().map(to_wire_part).collect())
            };
            WireMessage::User { content }
        }
        Role::Assistant => {
            let text = message.text();
            WireMessage::Assistant {
                content: (!text.is_empty()).then_some(text),
                tool_calls: message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: "function",
                        function: WireFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            }
        }
        Role::Tool => WireMessage::Tool {
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
            content: tool_result_text(message.text()),
        },
    }
}

fn to_wire_part(part: &ContentPart) -> WirePart {
    match part {
        ContentPart::Text { text } => WirePart::Text { text: text.clone() },
        ContentPart::Image(image) => WirePart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", image.mime_type, image.data),
            },
        },
    }
}

fn to_wire_tool(tool: &ToolDefinition) -> WireTool {
    WireTool {
        kind: "function",
        function: WireFunctionDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: sanitize_tool_schema(&tool.parameters),
        },
    }
}

fn parse_completion(data: CompletionResponse) -> Result<ChatResponse> {
    let choice = data
        .choices
        .and_then(|choices| choices.into_iter().next())
        .ok_or_else(|| SkiffError::MalformedResponse("response has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: data.usage.map(Usage::from),
        finish_reason: choice.finish_reason.as_deref().map(parse_finish_reason),
    })
}

fn parse_finish_reason(s: &str) -> FinishReason {
    match s {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Chat Completions `data:` payloads.
struct OpenAiStreamParser;

impl StreamParser for OpenAiStreamParser {
    fn parse_event(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let event: StreamEvent = parse_payload("openai", data)?;
        if let Some(error) = event.error {
            return Err(SkiffError::api(200, error.message));
        }

        let mut chunks = Vec::new();
        for choice in event.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                chunks.push(StreamChunk::TextDelta { text });
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                chunks.push(StreamChunk::ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                });
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                chunks.push(StreamChunk::Finish {
                    reason: parse_finish_reason(reason),
                });
            }
        }
        if let Some(usage) = event.usage {
            chunks.push(StreamChunk::Usage {
                usage: usage.into(),
            });
        }
        Ok(chunks)
    }
}

// Wire types (request)

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: WireContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<WireToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Wire types (response)

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChoiceToolCall>>,
}

#[derive(Deserialize)]
struct ChoiceToolCall {
    id: String,
    function: ChoiceFunction,
}

#[derive(Deserialize)]
struct ChoiceFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    total_tokens: Option<u32>,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u32>,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        let mut usage = Usage::new(u.prompt_tokens, u.completion_tokens);
        if let Some(total) = u.total_tokens {
            usage.total_tokens = total;
        }
        usage.cache_read_tokens = u.prompt_tokens_details.and_then(|d| d.cached_tokens);
        usage
    }
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ChatConfig {
        ChatConfig::builder().model("gpt-4o").api_key("sk").build()
    }

    #[test]
    fn request_body_inlines_system_and_pairs_tool_calls() {
        let config = config();
        let request = ChatRequest::new(vec![
            Message::user("list files"),
            Message::system("be brief"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "LS", "{\"path\":\".\"}")]),
            Message::tool_result("c1", "a.txt"),
            Message::tool_result("orphan", "x"),
        ]);
        let body = serde_json::to_value(build_request_body(&config, &request, false)).unwrap();
        assert_eq!(
            body["messages"],
            json!([
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "list files"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "LS", "arguments": "{\"path\":\".\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "a.txt"}
            ])
        );
        assert!(body.get("stream_options").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn streaming_body_requests_usage() {
        let config = config();
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let body = serde_json::to_value(build_request_body(&config, &request, true)).unwrap();
        assert_eq!(body["stream_options"], json!({"include_usage": true}));
    }

    #[test]
    fn images_become_data_urls() {
        let config = config();
        let request = ChatRequest::new(vec![Message::user_with_image("see", "aGk=", "image/png")]);
        let body = serde_json::to_value(build_request_body(&config, &request, false)).unwrap();
        assert_eq!(
            body["messages"][0]["content"][1],
            json!({"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}})
        );
    }

    #[test]
    fn missing_choices_is_malformed() {
        let data: CompletionResponse = serde_json::from_value(json!({"usage": null})).unwrap();
        assert!(matches!(
            parse_completion(data),
            Err(SkiffError::MalformedResponse(_))
        ));
    }

    #[test]
    fn stream_parser_emits_tool_call_fragments_and_usage() {
        let mut parser = OpenAiStreamParser;
        let chunks = parser
            .parse_event(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"LS","arguments":""}}]}}]}"#)
            .unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("LS".into()),
                arguments: String::new(),
            }]
        );
        let chunks = parser
            .parse_event(r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#)
            .unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::Usage {
                usage: Usage::new(5, 2)
            }]
        );
    }
}
