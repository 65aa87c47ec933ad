//! Azure OpenAI adapter.

use async_trait::async_trait;

use crate::config::{ChatConfig, ChatConfigUpdate};
use crate::error::Result;
use crate::types::{ChatResponse, ChatStream};

use super::http::build_client;
use super::openai::{Flavor, OpenAiService};
use super::{ChatRequest, ChatService};

/// Azure OpenAI Service: the OpenAI wire format behind a deployment-scoped URL.
///
/// `base_url` is the resource endpoint (e.g. `https://myresource.openai.azure.com`),
/// `deployment` the deployment name (falls back to `model`) and `api_version`
/// the required `api-version` query value.
pub struct AzureOpenAiService {
    inner: OpenAiService,
}

impl AzureOpenAiService {
    pub fn new(config: ChatConfig) -> Result<Self> {
        Ok(Self::with_client(config, build_client()?))
    }

    pub fn with_client(config: ChatConfig, client: reqwest::Client) -> Self {
        Self {
            inner: OpenAiService::with_flavor(config, client, Flavor::Azure),
        }
    }
}

#[async_trait]
impl ChatService for AzureOpenAiService {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.inner.chat(request).await
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        self.inner.stream_chat(request).await
    }

    fn config(&self) -> ChatConfig {
        self.inner.config()
    }

    fn update_config(&self, update: ChatConfigUpdate) {
        self.inner.update_config(update);
    }
}
