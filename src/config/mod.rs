//! Configuration system (layered: defaults < file < env < flags).

pub mod chat;

pub use chat::{ChatConfig, ChatConfigUpdate};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_loop::{PermissionMode, DEFAULT_MAX_TURNS};
use crate::error::{Result, SkiffError};
use crate::provider::ProviderKind;

const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Credentials and endpoint overrides for one provider.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub project_id: Option<String>,
    pub api_version: Option<String>,
    pub deployment: Option<String>,
    pub supports_images: Option<bool>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| ".."))
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("api_version", &self.api_version)
            .field("deployment", &self.deployment)
            .field("supports_images", &self.supports_images)
            .finish()
    }
}

/// Application configuration.
///
/// Resolution order, later wins:
/// 1. Built-in defaults
/// 2. `config.toml` (platform config dir, or an explicit path)
/// 3. Environment variables (a `.env` file is loaded first if present)
/// 4. CLI flags, applied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkiffConfig {
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub max_turns: usize,
    pub permission_mode: PermissionMode,
    pub stream: bool,
    /// Caller-side retries around each model request. Adapters never retry.
    pub max_retries: u32,
    /// Keyed by provider name (`openai`, `code-assist`, ...).
    pub providers: HashMap<String, ProviderSettings>,
}

impl Default for SkiffConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: None,
            temperature: None,
            max_input_tokens: None,
            max_output_tokens: None,
            max_turns: DEFAULT_MAX_TURNS,
            permission_mode: PermissionMode::Ask,
            stream: true,
            max_retries: 0,
            providers: HashMap::new(),
        }
    }
}

impl SkiffConfig {
    /// Platform config file location (`~/.config/skiff/config.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "skiff", "skiff")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SkiffError::Configuration(format!("config.toml: {e}")))
    }

    /// Load the file layer. An explicit path must exist; the default path is optional.
    pub fn from_file(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                Self::from_toml_str(&text)
            }
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(err) => Err(SkiffError::Configuration(format!(
                "cannot read {}: {err}",
                path.display()
            ))),
        }
    }

    /// File layer followed by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = lookup("SKIFF_PROVIDER") {
            self.provider = provider.parse().map_err(|_| {
                SkiffError::Configuration(format!("unknown SKIFF_PROVIDER '{provider}'"))
            })?;
        }
        if let Some(model) = lookup("SKIFF_MODEL") {
            self.model = Some(model);
        }

        let key_mappings = [
            ("OPENAI_API_KEY", ProviderKind::OpenAi),
            ("ANTHROPIC_API_KEY", ProviderKind::Anthropic),
            ("GOOGLE_API_KEY", ProviderKind::Gemini),
            ("GEMINI_API_KEY", ProviderKind::Gemini),
            ("GOOGLE_OAUTH_ACCESS_TOKEN", ProviderKind::CodeAssist),
            ("AZURE_OPENAI_API_KEY", ProviderKind::Azure),
        ];
        for (var, kind) in key_mappings {
            if let Some(key) = lookup(var) {
                self.settings_mut(kind).api_key = Some(key);
            }
        }

        let url_mappings = [
            ("OPENAI_BASE_URL", ProviderKind::OpenAi),
            ("ANTHROPIC_BASE_URL", ProviderKind::Anthropic),
            ("GEMINI_BASE_URL", ProviderKind::Gemini),
            ("CODE_ASSIST_BASE_URL", ProviderKind::CodeAssist),
            ("AZURE_OPENAI_ENDPOINT", ProviderKind::Azure),
        ];
        for (var, kind) in url_mappings {
            if let Some(url) = lookup(var) {
                self.settings_mut(kind).base_url = Some(url);
            }
        }

        if let Some(project) = lookup("GOOGLE_CLOUD_PROJECT") {
            self.settings_mut(ProviderKind::CodeAssist).project_id = Some(project);
        }
        if let Some(deployment) = lookup("AZURE_OPENAI_DEPLOYMENT") {
            self.settings_mut(ProviderKind::Azure).deployment = Some(deployment);
        }
        if let Some(version) = lookup("AZURE_OPENAI_API_VERSION") {
            self.settings_mut(ProviderKind::Azure).api_version = Some(version);
        }
        Ok(())
    }

    pub fn settings(&self, kind: ProviderKind) -> ProviderSettings {
        self.providers
            .get(&kind.to_string())
            .cloned()
            .unwrap_or_default()
    }

    fn settings_mut(&mut self, kind: ProviderKind) -> &mut ProviderSettings {
        self.providers.entry(kind.to_string()).or_default()
    }

    /// Resolve the [`ChatConfig`] for the selected provider.
    pub fn chat_config(&self) -> Result<ChatConfig> {
        let kind = self.provider;
        let settings = self.settings(kind);

        let api_key = settings.api_key.clone().ok_or_else(|| {
            SkiffError::Authentication(format!("Missing {}", kind.api_key_env()))
        })?;

        let (deployment, api_version) = if kind == ProviderKind::Azure {
            if settings.base_url.is_none() {
                return Err(SkiffError::Configuration(
                    "Missing AZURE_OPENAI_ENDPOINT".into(),
                ));
            }
            let deployment = settings
                .deployment
                .clone()
                .or_else(|| self.model.clone())
                .ok_or_else(|| {
                    SkiffError::Configuration("Missing AZURE_OPENAI_DEPLOYMENT".into())
                })?;
            let version = settings
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());
            (Some(deployment), Some(version))
        } else {
            (None, settings.api_version.clone())
        };

        let model = self
            .model
            .clone()
            .or_else(|| deployment.clone())
            .unwrap_or_else(|| kind.default_model().to_string());

        Ok(ChatConfig::builder()
            .model(model)
            .api_key(api_key)
            .maybe_base_url(settings.base_url)
            .maybe_temperature(self.temperature)
            .maybe_max_input_tokens(self.max_input_tokens)
            .maybe_max_output_tokens(self.max_output_tokens)
            .maybe_project_id(settings.project_id)
            .maybe_api_version(api_version)
            .maybe_deployment(deployment)
            .supports_images(settings.supports_images.unwrap_or(true))
            .build())
    }
}
