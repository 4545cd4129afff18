// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message router - decides which agent handles a user message.
//!
//! Routing is a strict priority chain; the first satisfied step wins:
//!
//! 1. Manual `@name` addressing (when allowed). An unknown name is an error,
//!    never a fall-through.
//! 2. `@all` broadcast: every registered agent.
//! 3. Mode `disabled`: default agent, else any agent.
//! 4. Mode `rules`/`hybrid`: first rule whose pattern matches the content.
//! 5. Mode `ai`/`hybrid`: ask the provider to pick an agent by name.
//! 6. Default agent.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentfleet::router::{parse_message, Router, RoutingConfig, RoutingTable};
//!
//! let mut table = RoutingTable::new();
//! table.register_agent(AgentConfig::new("coder", "Writes code"));
//! table.add_rule(RoutingRule::new("bug|error", "coder"))?;
//!
//! let router = Router::new(RoutingConfig::default(), None);
//! let targets = router.route(&parse_message("fix this bug"), &table, &cancel).await?;
//! assert_eq!(targets, vec!["coder"]);
//! ```

mod parse;

pub use parse::{parse_message, ParsedMessage, BROADCAST_NAME};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::AgentConfig;
use crate::error::RouteError;
use crate::types::{Message, SharedProvider};

/// Token limit for the classification call. Providers used for routing
/// should be built with this `max_tokens`.
pub const CLASSIFY_MAX_TOKENS: u32 = 50;

const CLASSIFY_SYSTEM_PROMPT: &str =
    "You are a message router. Reply with exactly one agent name from the list and nothing else.";

// ============================================================================
// Configuration
// ============================================================================

/// Which automatic routing steps are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// No automatic routing; default or any agent.
    Disabled,
    /// Pattern rules only.
    Rules,
    /// AI classification only.
    Ai,
    /// Rules first, then AI.
    #[default]
    Hybrid,
}

impl RoutingMode {
    fn uses_rules(self) -> bool {
        matches!(self, Self::Rules | Self::Hybrid)
    }

    fn uses_ai(self) -> bool {
        matches!(self, Self::Ai | Self::Hybrid)
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Rules => "rules",
            Self::Ai => "ai",
            Self::Hybrid => "hybrid",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "rules" => Ok(Self::Rules),
            "ai" => Ok(Self::Ai),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!("Unknown routing mode: {}", s)),
        }
    }
}

/// A pattern rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Regular expression, matched case-insensitively against the content.
    #[serde(rename = "match")]
    pub pattern: String,
    /// Agent name to route to.
    pub agent: String,
}

impl RoutingRule {
    pub fn new(pattern: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            agent: agent.into(),
        }
    }
}

/// Router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default = "default_allow_manual")]
    pub allow_manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

fn default_allow_manual() -> bool {
    true
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            allow_manual: true,
            default_agent: None,
            rules: Vec::new(),
        }
    }
}

// ============================================================================
// Routing table
// ============================================================================

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RoutingRule,
    regex: Regex,
}

/// Registered agents and ordered rules.
///
/// Rules may name agents that are not registered; removing an agent prunes
/// the rules that target it.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    agents: BTreeMap<String, AgentConfig>,
    rules: Vec<CompiledRule>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an agent by name.
    pub fn register_agent(&mut self, config: AgentConfig) {
        self.agents.insert(config.name.clone(), config);
    }

    /// Remove an agent and every rule targeting it. Returns whether the
    /// agent was registered.
    pub fn unregister_agent(&mut self, name: &str) -> bool {
        let removed = self.agents.remove(name).is_some();
        self.rules.retain(|r| r.rule.agent != name);
        removed
    }

    /// Append a rule. The pattern is compiled now; nothing is inserted when
    /// it is invalid.
    pub fn add_rule(&mut self, rule: RoutingRule) -> Result<(), RouteError> {
        let regex = RegexBuilder::new(&rule.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| RouteError::InvalidPattern {
                pattern: rule.pattern.clone(),
                message: e.to_string(),
            })?;
        self.rules.push(CompiledRule { rule, regex });
        Ok(())
    }

    /// Look up an agent.
    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }

    /// Registered agents in name order.
    pub fn agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.values()
    }

    /// Registered agent names in sorted order.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }

    fn match_rule(&self, content: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.regex.is_match(content))
            .map(|r| r.rule.agent.as_str())
    }
}

// ============================================================================
// Router
// ============================================================================

/// Applies the routing chain.
pub struct Router {
    config: RoutingConfig,
    provider: Option<SharedProvider>,
}

impl Router {
    /// Create a router. Without a provider the AI step always abstains.
    pub fn new(config: RoutingConfig, provider: Option<SharedProvider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Resolve the agents that should handle `parsed`.
    pub async fn route(
        &self,
        parsed: &ParsedMessage,
        table: &RoutingTable,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RouteError> {
        // 1. Manual addressing
        if self.config.allow_manual {
            if let Some(name) = &parsed.target_agent {
                if table.agents.contains_key(name) {
                    return Ok(vec![name.clone()]);
                }
                return Err(RouteError::AgentNotFound(name.clone()));
            }
        }

        // 2. Broadcast
        if parsed.target_all {
            return Ok(table.agent_names());
        }

        // 3. Routing disabled
        if self.config.mode == RoutingMode::Disabled {
            if let Some(default) = &self.config.default_agent {
                return Ok(vec![default.clone()]);
            }
            return table
                .agents
                .keys()
                .next()
                .map(|name| vec![name.clone()])
                .ok_or(RouteError::NoAgentsAvailable);
        }

        // 4. Pattern rules
        if self.config.mode.uses_rules() {
            if let Some(agent) = table.match_rule(&parsed.content) {
                debug!(agent, "Routed by rule");
                return Ok(vec![agent.to_string()]);
            }
        }

        // 5. AI classification
        if self.config.mode.uses_ai() {
            if let Some(agent) = self.classify(&parsed.content, table, cancel).await {
                debug!(agent = %agent, "Routed by classification");
                return Ok(vec![agent]);
            }
        }

        // 6. Default
        self.config
            .default_agent
            .clone()
            .map(|name| vec![name])
            .ok_or(RouteError::CouldNotRoute)
    }

    /// Ask the provider to pick one registered agent. `None` is an abstention.
    async fn classify(
        &self,
        content: &str,
        table: &RoutingTable,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let provider = self.provider.as_ref()?;
        if table.agents.is_empty() {
            return None;
        }

        let messages = [Message::user(classification_prompt(content, table))];
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = provider.chat(&messages, None, Some(CLASSIFY_SYSTEM_PROMPT)) => result,
        };

        match result {
            Ok(response) => {
                // Same normalization as `@name` addressing.
                let name = response.content.trim().to_lowercase();
                if table.agents.contains_key(&name) {
                    Some(name)
                } else {
                    debug!(reply = %name, "Classifier named no registered agent");
                    None
                }
            }
            Err(e) => {
                warn!(error = %e, provider = provider.name(), "Routing classification failed");
                None
            }
        }
    }
}

fn classification_prompt(content: &str, table: &RoutingTable) -> String {
    let mut prompt = String::from(
        "Choose the agent best suited to handle the message below.\n\nAvailable agents:\n",
    );
    for agent in table.agents.values() {
        if agent.description.is_empty() {
            prompt.push_str(&format!("- {}\n", agent.name));
        } else {
            prompt.push_str(&format!("- {}: {}\n", agent.name, agent.description));
        }
    }
    prompt.push_str(&format!(
        "\nMessage:\n{}\n\nRespond with only the agent name.",
        content
    ));
    prompt
}
