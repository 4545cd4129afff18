// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent definitions and the single-turn agent executor.
//!
//! An [`AgentConfig`] describes an agent the orchestrator can route to. An
//! [`Agent`] binds a config to a provider and answers every user message it
//! reads from a channel with one provider call.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentfleet::agent::{Agent, AgentConfig};
//! use agentfleet::channel::{ChannelMessage, MemoryChannel, ProxyChannel};
//!
//! let agent = Agent::new(AgentConfig::new("coder", "Writes and fixes code"), provider);
//! let proxy = ProxyChannel::new("coder", ChannelMessage::user("fix the bug"), output);
//! agent.run(&proxy).await?;
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{Channel, ChannelMessage, ChannelRole};
use crate::error::{ConfigError, Result};
use crate::types::{Message, SharedProvider};

/// Orchestrator-side description of an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Unique name; also the `@name` used for manual addressing.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Generated from name and description when empty.
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl AgentConfig {
    /// Create a config with a name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    /// Set an explicit system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The system prompt to send, generating one if none is configured.
    pub fn effective_system_prompt(&self) -> String {
        if !self.system_prompt.trim().is_empty() {
            return self.system_prompt.clone();
        }
        let mut prompt = format!("You are {}, an AI agent.", self.name);
        if !self.description.is_empty() {
            prompt.push_str(&format!(" Your role: {}.", self.description.trim_end_matches('.')));
        }
        if !self.tools.is_empty() {
            prompt.push_str(&format!(" Tools available to you: {}.", self.tools.join(", ")));
        }
        prompt.push_str(" Answer the user's request directly and concisely.");
        prompt
    }

    /// Load an agent definition from a JSON or YAML file.
    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        if config.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                message: format!("agent definition {} has no name", path.display()),
            });
        }
        Ok(config)
    }
}

/// Single-turn executor for one agent.
pub struct Agent {
    config: AgentConfig,
    provider: SharedProvider,
}

impl Agent {
    /// Bind a config to a provider.
    pub fn new(config: AgentConfig, provider: SharedProvider) -> Self {
        Self { config, provider }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Read user messages from `channel` until it closes, replying to each.
    ///
    /// The first provider or channel failure ends the run with that error.
    pub async fn run(&self, channel: &dyn Channel) -> Result<()> {
        let system_prompt = self.config.effective_system_prompt();

        while let Some(msg) = channel.receive().await {
            if msg.role != ChannelRole::User {
                continue;
            }

            debug!(
                agent = %self.config.name,
                model = self.config.model.as_deref().unwrap_or(self.provider.model()),
                chars = msg.content.len(),
                "Agent turn"
            );

            let response = self
                .provider
                .chat(&[Message::user(msg.content)], None, Some(&system_prompt))
                .await?;

            channel
                .send(ChannelMessage::assistant(&self.config.name, response.content))
                .await?;
        }

        Ok(())
    }
}
