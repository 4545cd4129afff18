// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::router::RoutingConfig;
use crate::store::LeaderElection;

/// Default controller listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7450";

/// Default leader lease TTL in seconds.
pub const DEFAULT_LEADER_TTL_SECS: u64 = 15;

/// Default heartbeat silence before a node is marked disconnected.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 30;

/// Default interval between dispatch passes.
pub const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 2;

/// Default node heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// LLM provider selection as written in config files.
///
/// API keys are never read from config; they come from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Provider type (anthropic, openai, ollama, openai-compatible).
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: None,
            base_url: None,
            max_tokens: None,
        }
    }
}

/// Node-side settings for `agentfleet node`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Display name; defaults to the host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stable id to reuse across reconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Controller address to dial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    /// Registration token. Carried on the wire but not verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One configuration file as found on disk. Every field is optional so
/// files can be layered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election: Option<LeaderElection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<AgentConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeSettings>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    pub data_dir: PathBuf,
    pub listen: String,
    pub controller_id: String,
    pub leader_election: LeaderElection,
    pub leader_ttl_secs: u64,
    pub node_timeout_secs: u64,
    pub dispatch_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub routing: RoutingConfig,
    pub agents: Vec<AgentConfig>,
    pub provider: ProviderSettings,
    pub node: NodeSettings,
}

impl FleetConfig {
    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: super::loader::default_data_dir(),
            listen: DEFAULT_LISTEN.to_string(),
            controller_id: default_controller_id(),
            leader_election: LeaderElection::default(),
            leader_ttl_secs: DEFAULT_LEADER_TTL_SECS,
            node_timeout_secs: DEFAULT_NODE_TIMEOUT_SECS,
            dispatch_interval_secs: DEFAULT_DISPATCH_INTERVAL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            routing: RoutingConfig::default(),
            agents: Vec::new(),
            provider: ProviderSettings::default(),
            node: NodeSettings::default(),
        }
    }
}

/// Host name, or `localhost` when it cannot be determined.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_controller_id() -> String {
    format!("controller-{}", host_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutingMode;

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.listen, "127.0.0.1:7450");
        assert_eq!(config.leader_ttl(), Duration::from_secs(15));
        assert_eq!(config.node_timeout(), Duration::from_secs(30));
        assert_eq!(config.dispatch_interval(), Duration::from_secs(2));
        assert_eq!(config.routing.mode, RoutingMode::Hybrid);
        assert!(config.routing.allow_manual);
        assert_eq!(config.leader_election, LeaderElection::AlwaysLeader);
        assert!(config.controller_id.starts_with("controller-"));
    }

    #[test]
    fn test_file_parses_camel_case() {
        let json = r#"{
            "dataDir": "/tmp/fleet",
            "leaderElection": "lease",
            "leaderTtlSecs": 9,
            "routing": {
                "mode": "rules",
                "defaultAgent": "writer",
                "rules": [{"match": "bug", "agent": "coder"}]
            },
            "agents": [{"name": "coder", "description": "Writes code"}],
            "provider": {"provider": "ollama", "baseUrl": "http://gpu:11434/v1"}
        }"#;
        let file: FleetConfigFile = serde_json::from_str(json).unwrap();

        assert_eq!(file.data_dir, Some(PathBuf::from("/tmp/fleet")));
        assert_eq!(file.leader_election, Some(LeaderElection::Lease));
        let routing = file.routing.unwrap();
        assert_eq!(routing.mode, RoutingMode::Rules);
        assert!(routing.allow_manual);
        assert_eq!(routing.rules[0].agent, "coder");
        assert_eq!(file.agents.unwrap()[0].name, "coder");
        assert_eq!(
            file.provider.unwrap().base_url.as_deref(),
            Some("http://gpu:11434/v1")
        );
    }

    #[test]
    fn test_empty_file_is_valid() {
        let file: FleetConfigFile = serde_json::from_str("{}").unwrap();
        assert!(file.listen.is_none());
        assert!(file.routing.is_none());
    }
}
