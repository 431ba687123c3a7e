use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use triage_types::{ChatMessage, ModelInfo, ModelResponse, ProviderInfo, ToolSchema};

mod openai;

pub use openai::{parse_retry_after_body, parse_retry_after_header, OpenAICompatibleProvider};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide whether to call tools.
    #[default]
    Auto,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: Some(0.2),
            max_output_tokens: Some(4096),
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
        }
    }
}

impl GenerateOptions {
    /// Same options with tool advertisement removed.
    pub fn without_tools(&self) -> Self {
        Self {
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("request cancelled")]
    Cancelled,
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("{message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient { .. })
    }

    /// Provider-supplied delay hint, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::Transient { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Model-invocation capability consumed by the engine.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ProviderError>;
}

struct KnownProvider {
    id: &'static str,
    name: &'static str,
    url: &'static str,
    model: &'static str,
    needs_key: bool,
}

/// OpenAI-compatible endpoints that can be enabled by a `providers.<id>` entry.
const KNOWN_PROVIDERS: [KnownProvider; 4] = [
    KnownProvider {
        id: "openai",
        name: "OpenAI",
        url: "https://api.openai.com/v1",
        model: "gpt-4o-mini",
        needs_key: true,
    },
    KnownProvider {
        id: "ollama",
        name: "Ollama",
        url: "http://127.0.0.1:11434/v1",
        model: "llama3.1:8b",
        needs_key: false,
    },
    KnownProvider {
        id: "openrouter",
        name: "OpenRouter",
        url: "https://openrouter.ai/api/v1",
        model: "openai/gpt-4o-mini",
        needs_key: true,
    },
    KnownProvider {
        id: "azure",
        name: "Azure OpenAI-Compatible",
        url: "https://example.openai.azure.com/openai/deployments/default",
        model: "gpt-4o-mini",
        needs_key: true,
    },
];

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ModelClient>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let mut providers: Vec<Arc<dyn ModelClient>> = KNOWN_PROVIDERS
            .iter()
            .filter_map(|known| build_provider(&config, known))
            .collect();
        if providers.is_empty() {
            providers.push(Arc::new(LocalEchoProvider));
        }
        Self {
            providers,
            default_provider: config.default_provider,
        }
    }

    /// Explicit id, then the configured default, then the first configured provider.
    pub fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn ModelClient>> {
        let find = |id: &str| self.providers.iter().find(|p| p.info().id == id).cloned();

        if let Some(id) = provider_id {
            return find(id).ok_or_else(|| {
                let available = self
                    .providers
                    .iter()
                    .map(|p| p.info().id)
                    .collect::<Vec<_>>();
                anyhow::anyhow!(
                    "provider `{}` is not configured. configured providers: {}",
                    id,
                    available.join(", ")
                )
            });
        }
        if let Some(provider) = self.default_provider.as_deref().and_then(find) {
            return Ok(provider);
        }
        self.providers
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No provider configured."))
    }
}

fn build_provider(config: &ProvidersConfig, known: &KnownProvider) -> Option<Arc<dyn ModelClient>> {
    let entry = config.providers.get(known.id)?;
    let api_key = if known.needs_key {
        entry
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .map(str::to_string)
            .or_else(|| env_api_key_for_provider(known.id))
    } else {
        None
    };
    Some(Arc::new(OpenAICompatibleProvider::new(
        known.id,
        known.name,
        entry.url.as_deref().unwrap_or(known.url),
        api_key,
        entry.default_model.as_deref().unwrap_or(known.model),
    )))
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "azure" => Some("AZURE_OPENAI_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Fallback used when no provider is configured; answers without tools.
struct LocalEchoProvider;

#[async_trait]
impl ModelClient for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<ModelResponse, ProviderError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == triage_types::ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ModelResponse::text(format!("Echo: {last_user}")))
    }
}
