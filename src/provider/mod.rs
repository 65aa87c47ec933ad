//! Chat service contract and vendor adapters.

pub mod format;
pub mod http;
pub mod retry;
pub mod sanitize;
pub mod schema;
pub(crate) mod stream;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "azure")]
pub mod azure;

#[cfg(feature = "anthropic")]
pub mod anthropic;

#[cfg(feature = "gemini")]
pub mod gemini;

#[cfg(feature = "code-assist")]
pub mod code_assist;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::config::{ChatConfig, ChatConfigUpdate};
use crate::error::{Result, SkiffError};
use crate::types::{ChatResponse, ChatStream, Message};

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// One model request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Empty means the model is offered no tools.
    pub tools: Vec<ToolDefinition>,
    pub cancel: Option<CancellationToken>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Vendor-neutral chat contract every adapter implements.
///
/// Adapters never retry; compose [`retry::RetryingChatService`] for that.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Provider name (e.g., "openai", "gemini").
    fn provider_name(&self) -> &str;

    /// Complete one model turn.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Stream one model turn. The stream ends with exactly one `Finish`
    /// chunk unless it ends with an error.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream>;

    /// Snapshot of the current configuration.
    fn config(&self) -> ChatConfig;

    /// Apply a partial update; takes effect from the next request.
    fn update_config(&self, update: ChatConfigUpdate);
}

/// Hot-swappable config that adapters snapshot per request.
#[derive(Debug)]
pub(crate) struct SharedConfig(RwLock<ChatConfig>);

impl SharedConfig {
    pub(crate) fn new(config: ChatConfig) -> Self {
        Self(RwLock::new(config))
    }

    pub(crate) fn snapshot(&self) -> ChatConfig {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn update(&self, update: ChatConfigUpdate) {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        update.apply(&mut guard);
    }
}

/// Supported vendor families.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ProviderKind {
    #[default]
    #[strum(serialize = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
    CodeAssist,
    Azure,
}

impl ProviderKind {
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi | Self::Azure => "gpt-4o",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Gemini | Self::CodeAssist => "gemini-2.5-pro",
        }
    }

    /// Environment variable holding this provider's credential.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::CodeAssist => "GOOGLE_OAUTH_ACCESS_TOKEN",
            Self::Azure => "AZURE_OPENAI_API_KEY",
        }
    }
}

/// Create the adapter for `kind`.
#[allow(unreachable_patterns)]
pub fn create_chat_service(kind: ProviderKind, config: ChatConfig) -> Result<Arc<dyn ChatService>> {
    tracing::debug!(provider = %kind, model = %config.model, "creating chat service");
    match kind {
        #[cfg(feature = "openai")]
        ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiService::new(config)?)),
        #[cfg(feature = "anthropic")]
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicService::new(config)?)),
        #[cfg(feature = "gemini")]
        ProviderKind::Gemini => Ok(Arc::new(gemini::GeminiService::new(config)?)),
        #[cfg(feature = "code-assist")]
        ProviderKind::CodeAssist => Ok(Arc::new(code_assist::CodeAssistService::new(config)?)),
        #[cfg(feature = "azure")]
        ProviderKind::Azure => Ok(Arc::new(azure::AzureOpenAiService::new(config)?)),
        other => Err(SkiffError::Configuration(format!(
            "provider '{other}' is not compiled in"
        ))),
    }
}
