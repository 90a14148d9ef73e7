//! LLM integration for mailroom.
//!
//! Supports these backends:
//! - **OpenAI / Anthropic**: direct API access via rig-core, bridged to
//!   `LlmProvider` by `RigAdapter`.
//! - **OpenAI-compatible**: any `/chat/completions` server at a configurable
//!   base URL (OpenRouter by default, or self-hosted).
//!
//! The enrichment layer only sees the `LlmProvider` trait, so tests
//! substitute stubs.

pub mod openai_compat;
pub mod provider;
mod rig_adapter;

pub use openai_compat::OpenAiCompatProvider;
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::config::parse_or;
use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
    OpenAiCompat,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenAiCompat => "openai_compat",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-sonnet-latest",
            Self::OpenAi => "gpt-4o",
            Self::OpenAiCompat => "qwen/qwen3-32b",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "openai_compat" | "openrouter" => Ok(Self::OpenAiCompat),
            other => Err(format!(
                "expected anthropic|openai|openai_compat, got '{other}'"
            )),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    /// Only used by the OpenAI-compatible backend.
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("LLM_API_KEY")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_KEY".into()))?;
        let backend = parse_or(&lookup, "LLM_BACKEND", LlmBackend::OpenAiCompat)?;

        Ok(Self {
            backend,
            base_url: lookup("LLM_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            api_key: SecretString::from(api_key),
            model: lookup("LLM_MODEL").unwrap_or_else(|| backend.default_model().into()),
            timeout: Duration::from_secs(parse_or(&lookup, "LLM_TIMEOUT_SECS", 60)?),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
        LlmBackend::OpenAiCompat => create_openai_compat_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!(backend = "anthropic", model = %config.model, "Using LLM provider");
    Ok(Arc::new(
        RigAdapter::new(model, &config.model).with_timeout(config.timeout),
    ))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!(backend = "openai", model = %config.model, "Using LLM provider");
    Ok(Arc::new(
        RigAdapter::new(model, &config.model).with_timeout(config.timeout),
    ))
}

fn create_openai_compat_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiCompatProvider::new(
        &config.base_url,
        config.api_key.clone(),
        &config.model,
        config.timeout,
    )?;
    tracing::info!(
        backend = "openai_compat",
        base_url = %config.base_url,
        model = %config.model,
        "Using LLM provider"
    );
    Ok(Arc::new(provider))
}
