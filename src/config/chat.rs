//! Per-request model configuration.

use std::fmt;

use bon::Builder;

/// Settings an adapter sends with every request.
///
/// Immutable for the duration of a request; adapters snapshot it at request
/// start, so [`ChatConfigUpdate`]s only affect later requests.
#[derive(Clone, Builder, PartialEq)]
pub struct ChatConfig {
    #[builder(into)]
    pub model: String,
    #[builder(into)]
    pub api_key: Option<String>,
    #[builder(into)]
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    /// Backing project for gateway-style vendors.
    #[builder(into)]
    pub project_id: Option<String>,
    /// Azure `api-version` query parameter.
    #[builder(into)]
    pub api_version: Option<String>,
    /// Azure deployment name.
    #[builder(into)]
    pub deployment: Option<String>,
    #[builder(default = true)]
    pub supports_images: bool,
}

impl ChatConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self::builder().model(model).build()
    }

    pub(crate) fn api_key_or_empty(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| ".."))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_input_tokens", &self.max_input_tokens)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("project_id", &self.project_id)
            .field("api_version", &self.api_version)
            .field("deployment", &self.deployment)
            .field("supports_images", &self.supports_images)
            .finish()
    }
}

/// Partial update applied between requests. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ChatConfigUpdate {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub project_id: Option<String>,
    pub api_version: Option<String>,
    pub deployment: Option<String>,
    pub supports_images: Option<bool>,
}

impl ChatConfigUpdate {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }

    pub fn apply(self, config: &mut ChatConfig) {
        if let Some(v) = self.model {
            config.model = v;
        }
        if let Some(v) = self.api_key {
            config.api_key = Some(v);
        }
        if let Some(v) = self.base_url {
            config.base_url = Some(v);
        }
        if let Some(v) = self.temperature {
            config.temperature = Some(v);
        }
        if let Some(v) = self.max_input_tokens {
            config.max_input_tokens = Some(v);
        }
        if let Some(v) = self.max_output_tokens {
            config.max_output_tokens = Some(v);
        }
        if let Some(v) = self.project_id {
            config.project_id = Some(v);
        }
        if let Some(v) = self.api_version {
            config.api_version = Some(v);
        }
        if let Some(v) = self.deployment {
            config.deployment = Some(v);
        }
        if let Some(v) = self.supports_images {
            config.supports_images = v;
        }
    }
}
