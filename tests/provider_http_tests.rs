//! Adapter behaviour against a local HTTP server.

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use skiff::config::ChatConfig;
use skiff::error::SkiffError;
use skiff::provider::anthropic::AnthropicService;
use skiff::provider::azure::AzureOpenAiService;
use skiff::provider::gemini::GeminiService;
use skiff::provider::openai::OpenAiService;
use skiff::provider::{ChatRequest, ChatService, ToolDefinition};
use skiff::types::{ChatResponse, FinishReason, Message, StreamAccumulator};

fn config(server: &MockServer, model: &str) -> ChatConfig {
    ChatConfig::builder()
        .model(model)
        .api_key("test-key")
        .base_url(server.uri())
        .build()
}

fn openai(server: &MockServer) -> OpenAiService {
    OpenAiService::with_client(config(server, "gpt-4o"), reqwest::Client::new())
}

fn hello() -> ChatRequest {
    ChatRequest::new(vec![Message::system("be brief"), Message::user("hi")])
}

fn sse(events: &[serde_json::Value], done: bool) -> String {
    let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

async fn collect(service: &dyn ChatService, request: &ChatRequest) -> ChatResponse {
    let mut stream = service.stream_chat(request).await.unwrap();
    let mut acc = StreamAccumulator::new();
    while let Some(chunk) = stream.next().await {
        acc.push(&chunk.unwrap());
    }
    acc.finish()
}

#[tokio::test]
async fn openai_chat_parses_text_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = openai(&server).chat(&hello()).await.unwrap();
    assert_eq!(response.content, "Hello there");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    let usage = response.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (7, 2));
}

#[tokio::test]
async fn openai_tool_calls_come_back_whole() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "tools": [{"type": "function", "function": {"name": "LS"}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "LS", "arguments": "{\"path\":\".\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let request = hello().with_tools(vec![ToolDefinition {
        name: "LS".into(),
        description: "List a directory".into(),
        parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
    }]);
    let response = openai(&server).chat(&request).await.unwrap();
    assert_eq!(response.content, "");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_1");
    assert_eq!(response.tool_calls[0].arguments_value(), json!({"path": "."}));
    assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
}

#[tokio::test]
async fn openai_stream_matches_whole_response() {
    let server = MockServer::start().await;
    let body = sse(
        &[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello "}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "there"}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 2}}),
        ],
        true,
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let service = openai(&server);
    let response = collect(&service, &hello()).await;
    assert_eq!(response.content, "Hello there");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.unwrap().total_tokens, 9);
}

#[tokio::test]
async fn openai_stream_assembles_tool_call_fragments() {
    let server = MockServer::start().await;
    let body = sse(
        &[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "Read", "arguments": "{\"pa"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "th\":\"a.txt\"}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ],
        true,
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let service = openai(&server);
    let response = collect(&service, &hello()).await;
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "Read");
    assert_eq!(response.tool_calls[0].arguments_value(), json!({"path": "a.txt"}));
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let service = openai(&server);
    let err = service.chat(&hello()).await.unwrap_err();
    assert!(matches!(err, SkiffError::Authentication(ref m) if m == "bad key"));
    assert!(err.is_fatal());

    let err = service.chat(&hello()).await.unwrap_err();
    assert!(matches!(
        err,
        SkiffError::RateLimited {
            retry_after_ms: Some(3000)
        }
    ));
    assert!(err.is_retryable());

    let err = service.chat(&hello()).await.unwrap_err();
    assert!(matches!(err, SkiffError::Api { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_choices_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"usage": null})))
        .mount(&server)
        .await;

    let err = openai(&server).chat(&hello()).await.unwrap_err();
    assert!(matches!(err, SkiffError::MalformedResponse(_)));
}

#[tokio::test]
async fn azure_uses_deployment_url_and_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/prod-gpt/chat/completions"))
        .and(query_param("api-version", "2024-10-21"))
        .and(header("api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"content": "azure ok"}, "finish_reason": "stop"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = ChatConfig::builder()
        .model("gpt-4o")
        .api_key("test-key")
        .base_url(server.uri())
        .deployment("prod-gpt")
        .api_version("2024-10-21")
        .build();
    let service = AzureOpenAiService::with_client(config, reqwest::Client::new());
    assert_eq!(service.provider_name(), "azure");
    let response = service.chat(&hello()).await.unwrap();
    assert_eq!(response.content, "azure ok");
}

#[tokio::test]
async fn azure_without_api_version_is_a_configuration_error() {
    let server = MockServer::start().await;
    let service = AzureOpenAiService::with_client(config(&server, "gpt-4o"), reqwest::Client::new());
    let err = service.chat(&hello()).await.unwrap_err();
    assert!(matches!(err, SkiffError::Configuration(_)));
}

#[tokio::test]
async fn anthropic_lifts_system_prompt_and_reads_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .and(body_partial_json(json!({
            "system": "be brief",
            "messages": [{"role": "user"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "toolu_1", "name": "LS", "input": {"path": "."}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = AnthropicService::with_client(
        config(&server, "claude-sonnet-4-20250514"),
        reqwest::Client::new(),
    );
    let response = service.chat(&hello()).await.unwrap();
    assert_eq!(response.content, "Checking.");
    assert_eq!(response.tool_calls[0].name, "LS");
    assert_eq!(response.tool_calls[0].arguments_value(), json!({"path": "."}));
    assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(response.usage.unwrap().total_tokens, 16);
}

#[tokio::test]
async fn anthropic_stream_text() {
    let server = MockServer::start().await;
    let body = sse(
        &[
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 5, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi "}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "there"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 3}}),
            json!({"type": "message_stop"}),
        ],
        false,
    );
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let service = AnthropicService::with_client(
        config(&server, "claude-sonnet-4-20250514"),
        reqwest::Client::new(),
    );
    let response = collect(&service, &hello()).await;
    assert_eq!(response.content, "Hi there");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn gemini_generate_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello from Gemini"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 3, "totalTokenCount": 7}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = GeminiService::with_client(config(&server, "gemini-2.5-flash"), reqwest::Client::new());
    let response = service.chat(&hello()).await.unwrap();
    assert_eq!(response.content, "Hello from Gemini");
    assert_eq!(response.usage.unwrap().total_tokens, 7);
}

#[tokio::test]
async fn gemini_stream_uses_sse_endpoint() {
    let server = MockServer::start().await;
    let body = sse(
        &[
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]}),
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}, "finishReason": "STOP"}],
                   "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}}),
        ],
        false,
    );
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let service = GeminiService::with_client(config(&server, "gemini-2.5-flash"), reqwest::Client::new());
    let response = collect(&service, &hello()).await;
    assert_eq!(response.content, "Hello");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn cancelled_request_returns_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_secs(30))
                .set_body_json(json!({"choices": []})),
        )
        .mount(&server)
        .await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let request = hello().with_cancel(cancel.clone());
    let service = openai(&server);
    let call = service.chat(&request);
    cancel.cancel();
    let err = call.await.unwrap_err();
    assert!(err.is_cancelled());
}
