//! Caller-side retry decorator for any [`ChatService`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ChatConfig, ChatConfigUpdate};
use crate::error::Result;
use crate::types::{ChatResponse, ChatStream};
use crate::util::retry::RetryPolicy;

use super::{ChatRequest, ChatService};

/// Retries retryable failures of `chat` and of opening a stream.
///
/// A stream that fails after it started is not replayed; its consumer has
/// already seen partial output.
pub struct RetryingChatService {
    inner: Arc<dyn ChatService>,
    policy: RetryPolicy,
}

impl RetryingChatService {
    pub fn new(inner: Arc<dyn ChatService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ChatService for RetryingChatService {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.policy
            .execute(request.cancel.as_ref(), || self.inner.chat(request))
            .await
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        self.policy
            .execute(request.cancel.as_ref(), || self.inner.stream_chat(request))
            .await
    }

    fn config(&self) -> ChatConfig {
        self.inner.config()
    }

    fn update_config(&self, update: ChatConfigUpdate) {
        self.inner.update_config(update);
    }
}
