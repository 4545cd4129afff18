// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for agentfleet.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.agentfleet/config.json
//! - Workspace config: agentfleet.json, agentfleet.yaml, or .agentfleet/config.json
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    default_data_dir, get_global_config_dir, get_global_config_path, init_config,
    load_agent_definitions, load_config_file, load_global_config, load_workspace_config,
    AGENTS_DIR, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    host_name, FleetConfig, FleetConfigFile, NodeSettings, ProviderSettings, DEFAULT_LISTEN,
};

use std::collections::HashSet;
use std::path::Path;

use crate::error::ConfigError;
use crate::providers::ProviderType;

/// Load, merge and validate all configuration sources for `root`.
///
/// Agent definition files under [`AGENTS_DIR`] are appended after the
/// merged `agents` list; an inline agent with the same name wins.
pub fn load_config(root: &Path, cli_options: CliOptions) -> Result<FleetConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(root)?;

    let mut config = merge_config(global, workspace, cli_options);
    for agent in load_agent_definitions(root)? {
        if !config.agents.iter().any(|a| a.name == agent.name) {
            config.agents.push(agent);
        }
    }
    validate(&config)?;
    Ok(config)
}

/// Reject values the runtime cannot work with.
pub fn validate(config: &FleetConfig) -> Result<(), ConfigError> {
    for (field, value) in [
        ("leaderTtlSecs", config.leader_ttl_secs),
        ("nodeTimeoutSecs", config.node_timeout_secs),
        ("dispatchIntervalSecs", config.dispatch_interval_secs),
        ("heartbeatIntervalSecs", config.heartbeat_interval_secs),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be greater than zero"));
        }
    }

    if config.listen.trim().is_empty() {
        return Err(invalid("listen", "must not be empty"));
    }

    if config.provider.provider.parse::<ProviderType>().is_err() {
        return Err(invalid(
            "provider.provider",
            format!("unknown provider '{}'", config.provider.provider),
        ));
    }

    let mut seen = HashSet::new();
    for agent in &config.agents {
        if agent.name.trim().is_empty() {
            return Err(invalid("agents", "agent name must not be empty"));
        }
        if !seen.insert(agent.name.as_str()) {
            return Err(invalid("agents", format!("duplicate agent '{}'", agent.name)));
        }
    }

    for rule in &config.routing.rules {
        if let Err(e) = regex::RegexBuilder::new(&rule.pattern)
            .case_insensitive(true)
            .build()
        {
            return Err(invalid("routing.rules", format!("{}: {}", rule.pattern, e)));
        }
    }

    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}
