// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Language model providers.
//!
//! Implementations of the [`Provider`](crate::types::Provider) trait:
//!
//! - [`anthropic::AnthropicProvider`] - Claude models via the Messages API
//! - [`openai::OpenAIProvider`] - OpenAI, Ollama, and OpenAI-compatible APIs
//!
//! The adapter is chosen once, at construction time, from a [`ProviderType`].
//!
//! ```rust,ignore
//! use agentfleet::providers::{create_provider, ProviderType};
//! use agentfleet::types::ProviderConfig;
//!
//! let config = ProviderConfig::new("your-api-key", "gpt-4o");
//! let provider = create_provider(ProviderType::OpenAI, config)?;
//! ```

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;

use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::types::{BoxedProvider, ProviderConfig};

/// Supported provider types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// Anthropic Claude models
    Anthropic,
    /// OpenAI GPT models
    OpenAI,
    /// Ollama local models
    Ollama,
    /// Any OpenAI-compatible API
    OpenAICompatible,
}

impl ProviderType {
    /// Get the default model for this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAI => "gpt-4o",
            Self::Ollama => "llama3.2",
            Self::OpenAICompatible => "gpt-4o",
        }
    }

    /// Get the default base URL for this provider.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAI => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
            Self::OpenAICompatible => "https://api.openai.com/v1",
        }
    }

    /// Environment variable holding the API key, if this provider uses one.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAI | Self::OpenAICompatible => Some("OPENAI_API_KEY"),
            Self::Ollama => None,
        }
    }

    /// Check if this provider requires an API key.
    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::Anthropic | Self::OpenAI)
    }
}

/// Error type for parsing a provider type from a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseProviderTypeError;

impl std::fmt::Display for ParseProviderTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid provider type")
    }
}

impl std::error::Error for ParseProviderTypeError {}

impl std::str::FromStr for ProviderType {
    type Err = ParseProviderTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "openai-compatible" | "openai_compatible" => Ok(Self::OpenAICompatible),
            _ => Err(ParseProviderTypeError),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "Anthropic"),
            Self::OpenAI => write!(f, "OpenAI"),
            Self::Ollama => write!(f, "Ollama"),
            Self::OpenAICompatible => write!(f, "OpenAI-Compatible"),
        }
    }
}

/// Create a provider instance from type and configuration.
///
/// # Errors
///
/// Returns [`ProviderError::NotConfigured`] when a required API key or base
/// URL is missing.
pub fn create_provider(
    provider_type: ProviderType,
    config: ProviderConfig,
) -> Result<BoxedProvider, ProviderError> {
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| provider_type.default_model().to_string());

    let base_url = match (&config.base_url, provider_type) {
        (Some(url), _) => url.clone(),
        (None, ProviderType::OpenAICompatible) => {
            return Err(ProviderError::NotConfigured(
                "base_url required for OpenAI-Compatible".to_string(),
            ))
        }
        (None, other) => other.default_base_url().to_string(),
    };

    if provider_type.requires_api_key() && config.api_key.is_none() {
        return Err(ProviderError::NotConfigured(format!(
            "API key required for {}",
            provider_type
        )));
    }

    match provider_type {
        ProviderType::Anthropic => {
            let api_key = config.api_key.clone().unwrap_or_default();
            Ok(Box::new(AnthropicProvider::new(api_key, model, base_url, &config)?))
        }
        ProviderType::OpenAI | ProviderType::OpenAICompatible => Ok(Box::new(
            OpenAIProvider::new(config.api_key.clone(), model, base_url, &config)?,
        )),
        // Ollama doesn't need an API key
        ProviderType::Ollama => Ok(Box::new(OpenAIProvider::new(None, model, base_url, &config)?)),
    }
}

/// Create a provider from the `provider` section of the fleet config.
///
/// API keys come from the environment (`ANTHROPIC_API_KEY`,
/// `OPENAI_API_KEY`), never from config files.
pub fn create_provider_from_settings(
    settings: &ProviderSettings,
) -> Result<BoxedProvider, ProviderError> {
    let provider_type: ProviderType = settings.provider.parse().map_err(|_| {
        ProviderError::NotConfigured(format!("Unknown provider: {}", settings.provider))
    })?;

    let config = ProviderConfig {
        api_key: provider_type
            .api_key_env()
            .and_then(|var| std::env::var(var).ok()),
        base_url: settings.base_url.clone(),
        model: settings.model.clone(),
        max_tokens: settings.max_tokens,
        ..Default::default()
    };

    create_provider(provider_type, config)
}
