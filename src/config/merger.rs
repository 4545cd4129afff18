// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use crate::agent::AgentConfig;
use crate::store::LeaderElection;

use super::types::{FleetConfig, FleetConfigFile};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub data_dir: Option<PathBuf>,
    pub listen: Option<String>,
    pub controller_id: Option<String>,
    pub leader_election: Option<LeaderElection>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Default configuration values.
pub fn default_config() -> FleetConfig {
    FleetConfig::default()
}

/// Merge configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Workspace config (agentfleet.json and friends)
/// 3. Global config (~/.agentfleet/config.json)
/// 4. Default values
pub fn merge_config(
    global: Option<FleetConfigFile>,
    workspace: Option<FleetConfigFile>,
    cli: CliOptions,
) -> FleetConfig {
    let mut result = default_config();

    if let Some(config) = global {
        apply_file_config(&mut result, config);
    }

    if let Some(config) = workspace {
        apply_file_config(&mut result, config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_file_config(result: &mut FleetConfig, config: FleetConfigFile) {
    if let Some(data_dir) = config.data_dir {
        result.data_dir = data_dir;
    }
    if let Some(listen) = config.listen {
        result.listen = listen;
    }
    if let Some(id) = config.controller_id {
        result.controller_id = id;
    }
    if let Some(election) = config.leader_election {
        result.leader_election = election;
    }
    if let Some(ttl) = config.leader_ttl_secs {
        result.leader_ttl_secs = ttl;
    }
    if let Some(timeout) = config.node_timeout_secs {
        result.node_timeout_secs = timeout;
    }
    if let Some(interval) = config.dispatch_interval_secs {
        result.dispatch_interval_secs = interval;
    }
    if let Some(interval) = config.heartbeat_interval_secs {
        result.heartbeat_interval_secs = interval;
    }

    // A routing block replaces the lower layer's routing wholesale; rule
    // order matters, so rules are never interleaved across files.
    if let Some(routing) = config.routing {
        result.routing = routing;
    }

    if let Some(agents) = config.agents {
        merge_agents(&mut result.agents, agents);
    }

    if let Some(provider) = config.provider {
        result.provider = provider;
    }

    if let Some(node) = config.node {
        if node.name.is_some() {
            result.node.name = node.name;
        }
        if node.id.is_some() {
            result.node.id = node.id;
        }
        if node.controller.is_some() {
            result.node.controller = node.controller;
        }
        if node.token.is_some() {
            result.node.token = node.token;
        }
        result.node.labels.extend(node.labels);
    }
}

/// Agents are keyed by name: a later layer replaces an agent of the same
/// name in place and appends new ones.
fn merge_agents(agents: &mut Vec<AgentConfig>, overrides: Vec<AgentConfig>) {
    for agent in overrides {
        match agents.iter_mut().find(|a| a.name == agent.name) {
            Some(existing) => *existing = agent,
            None => agents.push(agent),
        }
    }
}

fn apply_cli_options(result: &mut FleetConfig, cli: &CliOptions) {
    if let Some(ref data_dir) = cli.data_dir {
        result.data_dir = data_dir.clone();
    }
    if let Some(ref listen) = cli.listen {
        result.listen = listen.clone();
    }
    if let Some(ref id) = cli.controller_id {
        result.controller_id = id.clone();
    }
    if let Some(election) = cli.leader_election {
        result.leader_election = election;
    }
    if let Some(ref provider) = cli.provider {
        result.provider.provider = provider.clone();
    }
    if cli.model.is_some() {
        result.provider.model = cli.model.clone();
    }
    if cli.base_url.is_some() {
        result.provider.base_url = cli.base_url.clone();
    }
}
