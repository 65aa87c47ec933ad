//! Code Assist gateway: project discovery and the request envelope.

use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use skiff::config::{ChatConfig, ChatConfigUpdate};
use skiff::error::SkiffError;
use skiff::provider::code_assist::CodeAssistService;
use skiff::provider::{ChatRequest, ChatService};
use skiff::types::Message;

const GENERATE: &str = "/v1internal:generateContent";
const LOAD: &str = "/v1internal:loadCodeAssist";
const ONBOARD: &str = "/v1internal:onboardUser";

fn service(server: &MockServer, project: Option<&str>) -> CodeAssistService {
    let config = ChatConfig::builder()
        .model("gemini-2.5-pro")
        .api_key("oauth-token")
        .base_url(server.uri())
        .maybe_project_id(project.map(str::to_string))
        .build();
    CodeAssistService::with_client(config, reqwest::Client::new())
}

fn reply(text: &str) -> Value {
    json!({
        "response": {
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        }
    })
}

fn hi() -> ChatRequest {
    ChatRequest::new(vec![Message::user("hi")])
}

async fn generate_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == GENERATE)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn discovered_project_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOAD))
        .and(header("authorization", "Bearer oauth-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cloudaicompanionProject": "proj-1",
            "currentTier": {"id": "free-tier"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE))
        .and(body_partial_json(json!({
            "model": "gemini-2.5-pro",
            "project": "proj-1",
            "request": {"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("hello")))
        .expect(2)
        .mount(&server)
        .await;

    let service = service(&server, None);
    for _ in 0..2 {
        let response = service.chat(&hi()).await.unwrap();
        assert_eq!(response.content, "hello");
    }
}

#[tokio::test]
async fn onboarding_uses_the_default_tier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOAD))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "allowedTiers": [
                {"id": "legacy-tier"},
                {"id": "standard-tier", "isDefault": true}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ONBOARD))
        .and(body_partial_json(json!({"tierId": "standard-tier"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "done": true,
            "response": {"cloudaicompanionProject": {"id": "proj-onboarded"}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE))
        .and(body_partial_json(json!({"project": "proj-onboarded"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let response = service(&server, None).chat(&hi()).await.unwrap();
    assert_eq!(response.content, "ok");
}

#[tokio::test]
async fn failed_discovery_sends_requests_without_a_project() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOAD))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("still works")))
        .expect(2)
        .mount(&server)
        .await;

    let service = service(&server, None);
    for _ in 0..2 {
        let response = service.chat(&hi()).await.unwrap();
        assert_eq!(response.content, "still works");
    }

    let bodies = generate_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    for body in bodies {
        assert!(body.get("project").is_none(), "unexpected project in {body}");
        assert_eq!(body["model"], "gemini-2.5-pro");
    }
}

#[tokio::test]
async fn configured_project_skips_discovery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOAD))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE))
        .and(body_partial_json(json!({"project": "my-project"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("configured")))
        .expect(1)
        .mount(&server)
        .await;

    let response = service(&server, Some("my-project")).chat(&hi()).await.unwrap();
    assert_eq!(response.content, "configured");
}

#[tokio::test]
async fn rejected_token_is_not_cached_as_no_project() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOAD))
        .and(header("authorization", "Bearer oauth-token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(LOAD))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cloudaicompanionProject": "proj-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE))
        .and(body_partial_json(json!({"project": "proj-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("recovered")))
        .expect(1)
        .mount(&server)
        .await;

    let service = service(&server, None);
    let err = service.chat(&hi()).await.unwrap_err();
    assert!(matches!(err, SkiffError::Authentication(_)), "{err:?}");

    service.update_config(ChatConfigUpdate {
        api_key: Some("fresh-token".into()),
        ..Default::default()
    });
    let response = service.chat(&hi()).await.unwrap();
    assert_eq!(response.content, "recovered");
}
