//! Gemini through the Code Assist gateway (delegated OAuth).
//!
//! The gateway serves the Gemini wire format wrapped in
//! `{model, project, request}` / `{response}` envelopes and needs a backing
//! Cloud project. When none is configured, the project is discovered on first
//! use (`loadCodeAssist`, then `onboardUser`) and cached for the adapter's
//! lifetime. Discovery failure is tolerated: requests go out without a project.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ChatConfig, ChatConfigUpdate};
use crate::error::{Result, SkiffError};
use crate::types::{ChatResponse, ChatStream};

use super::gemini::{
    build_generate_request, parse_generate_response, Envelope, GeminiStreamParser,
    GenerateContentRequest,
};
use super::http::{bearer_headers, build_client, read_json, send};
use super::stream::drive;
use super::{ChatRequest, ChatService, SharedConfig};

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const API_PATH: &str = "v1internal";
const DEFAULT_TIER: &str = "free-tier";

pub struct CodeAssistService {
    config: SharedConfig,
    client: reqwest::Client,
    project: OnceCell<String>,
}

impl CodeAssistService {
    pub fn new(config: ChatConfig) -> Result<Self> {
        Ok(Self::with_client(config, build_client()?))
    }

    pub fn with_client(config: ChatConfig, client: reqwest::Client) -> Self {
        Self {
            config: SharedConfig::new(config),
            client,
            project: OnceCell::new(),
        }
    }

    fn url(config: &ChatConfig, method: &str) -> String {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/{API_PATH}:{method}", base.trim_end_matches('/'))
    }

    /// Configured project, else the cached discovery result. Transient
    /// discovery failures are cached as "no project"; auth failures and
    /// cancellation propagate.
    async fn project(
        &self,
        config: &ChatConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        if let Some(project) = config.project_id.as_deref().filter(|p| !p.is_empty()) {
            return Ok(project.to_string());
        }
        let project = self
            .project
            .get_or_try_init(|| async {
                match self.discover(config, cancel).await {
                    Ok(project) => Ok(project),
                    // Left uncached so a refreshed token or a retry can discover again.
                    Err(e @ (SkiffError::Cancelled | SkiffError::Authentication(_))) => Err(e),
                    Err(e) => {
                        warn!(error = %e, "project discovery failed, continuing without a project");
                        Ok(String::new())
                    }
                }
            })
            .await?;
        Ok(project.clone())
    }

    async fn discover(
        &self,
        config: &ChatConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let headers = bearer_headers(config.api_key_or_empty());

        let load = self
            .client
            .post(Self::url(config, "loadCodeAssist"))
            .headers(headers.clone())
            .json(&LoadRequest {
                metadata: ClientMetadata::default(),
            });
        let loaded: LoadResponse = read_json(send(load, cancel).await?, cancel).await?;
        if let Some(project) = loaded.cloudaicompanion_project.filter(|p| !p.is_empty()) {
            debug!(project = %project, "code assist project loaded");
            return Ok(project);
        }

        let tier = loaded
            .allowed_tiers
            .iter()
            .find(|tier| tier.is_default)
            .or(loaded.current_tier.as_ref())
            .map(|tier| tier.id.clone())
            .unwrap_or_else(|| DEFAULT_TIER.to_string());

        let onboard = self
            .client
            .post(Self::url(config, "onboardUser"))
            .headers(headers)
            .json(&OnboardRequest {
                tier_id: tier,
                metadata: ClientMetadata::default(),
            });
        let onboarded: OnboardResponse = read_json(send(onboard, cancel).await?, cancel).await?;
        let project = onboarded
            .response
            .and_then(|r| r.cloudaicompanion_project)
            .map(|p| p.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SkiffError::MalformedResponse("onboarding returned no project".into()))?;
        debug!(project = %project, "code assist project onboarded");
        Ok(project)
    }

    async fn open(
        &self,
        config: &ChatConfig,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let cancel = request.cancel.as_ref();
        let project = self.project(config, cancel).await?;
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let body = GatewayRequest {
            model: &config.model,
            project,
            request: build_generate_request(config, request),
        };
        debug!(
            provider = "code-assist",
            model = %config.model,
            stream,
            "gateway request"
        );
        let builder = self
            .client
            .post(Self::url(config, method))
            .headers(bearer_headers(config.api_key_or_empty()))
            .json(&body);
        send(builder, cancel).await
    }
}

#[async_trait]
impl ChatService for CodeAssistService {
    fn provider_name(&self) -> &str {
        "code-assist"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, false).await?;
        let envelope: Envelope = read_json(response, request.cancel.as_ref()).await?;
        parse_generate_response(envelope.response)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let config = self.config.snapshot();
        let response = self.open(&config, request, true).await?;
        Ok(drive(
            response.bytes_stream(),
            GeminiStreamParser::enveloped(),
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

#[derive(Serialize)]
struct GatewayRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "String::is_empty")]
    project: String,
    request: GenerateContentRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMetadata {
    ide_type: &'static str,
    platform: &'static str,
    plugin_type: &'static str,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            ide_type: "IDE_UNSPECIFIED",
            platform: "PLATFORM_UNSPECIFIED",
            plugin_type: "GEMINI",
        }
    }
}

#[derive(Serialize)]
struct LoadRequest {
    metadata: ClientMetadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadResponse {
    cloudaicompanion_project: Option<String>,
    current_tier: Option<Tier>,
    #[serde(default)]
    allowed_tiers: Vec<Tier>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tier {
    id: String,
    #[serde(default)]
    is_default: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OnboardRequest {
    tier_id: String,
    metadata: ClientMetadata,
}

#[derive(Deserialize)]
struct OnboardResponse {
    response: Option<OnboardResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardResult {
    cloudaicompanion_project: Option<ProjectRef>,
}

#[derive(Deserialize)]
struct ProjectRef {
    id: String,
}
