// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in the working
//! directory and the user's home directory.

use std::path::{Path, PathBuf};

use crate::agent::AgentConfig;
use crate::error::ConfigError;

use super::types::FleetConfigFile;

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &["agentfleet.json", "agentfleet.yaml", ".agentfleet/config.json"];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".agentfleet";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Data directory name under the global config directory.
pub const DATA_DIR: &str = "data";

/// Directory of per-agent definition files, relative to the workspace.
pub const AGENTS_DIR: &str = ".agentfleet/agents";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Default store directory, `~/.agentfleet/data`.
///
/// Falls back to a relative `.agentfleet/data` when there is no home
/// directory.
pub fn default_data_dir() -> PathBuf {
    get_global_config_dir()
        .unwrap_or_else(|| PathBuf::from(GLOBAL_CONFIG_DIR))
        .join(DATA_DIR)
}

/// Load global configuration from ~/.agentfleet/config.json.
pub fn load_global_config() -> Result<Option<FleetConfigFile>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration from `root`.
///
/// The first file of [`CONFIG_FILES`] that exists wins.
pub fn load_workspace_config(root: &Path) -> Result<Option<FleetConfigFile>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<FleetConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Load every agent definition (`*.json`, `*.yaml`, `*.yml`) under
/// `root/.agentfleet/agents`, in file name order.
pub fn load_agent_definitions(root: &Path) -> Result<Vec<AgentConfig>, ConfigError> {
    let dir = root.join(AGENTS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    paths.iter().map(|path| AgentConfig::load(path)).collect()
}

/// Write `config` as pretty JSON to `root/agentfleet.json`.
pub fn init_config(root: &Path, config: Option<FleetConfigFile>) -> Result<PathBuf, ConfigError> {
    let config = config.unwrap_or_default();
    let path = root.join(CONFIG_FILES[0]);

    let content = serde_json::to_string_pretty(&config)?;
    std::fs::write(&path, content)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES.len(), 3);
        assert_eq!(CONFIG_FILES[0], "agentfleet.json");
    }

    #[test]
    fn test_default_data_dir() {
        let dir = default_data_dir();
        assert!(dir.ends_with(".agentfleet/data"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_workspace_config_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("agentfleet.json"),
            r#"{"listen": "0.0.0.0:9000", "leaderTtlSecs": 30}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.leader_ttl_secs, Some(30));
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("agentfleet.yaml"),
            "routing:\n  mode: ai\nagents:\n  - name: coder\n    description: Writes code\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.agents.unwrap()[0].name, "coder");
        assert!(config.routing.is_some());
    }

    #[test]
    fn test_json_wins_over_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("agentfleet.json"), r#"{"listen": "json"}"#).unwrap();
        std::fs::write(temp.path().join("agentfleet.yaml"), "listen: yaml\n").unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.listen.as_deref(), Some("json"));
    }

    #[test]
    fn test_nested_config_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".agentfleet")).unwrap();
        std::fs::write(
            temp.path().join(".agentfleet/config.json"),
            r#"{"controllerId": "ctl-a"}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.controller_id.as_deref(), Some("ctl-a"));
    }

    #[test]
    fn test_malformed_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("agentfleet.json"), "{not json").unwrap();

        let result = load_workspace_config(temp.path());
        assert!(matches!(result, Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_load_agent_definitions() {
        let temp = TempDir::new().unwrap();
        assert!(load_agent_definitions(temp.path()).unwrap().is_empty());

        let dir = temp.path().join(AGENTS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b-reviewer.yaml"), "name: reviewer\ndescription: Reviews diffs\n").unwrap();
        std::fs::write(dir.join("a-coder.json"), r#"{"name": "coder", "model": "fast"}"#).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let agents = load_agent_definitions(temp.path()).unwrap();
        let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["coder", "reviewer"]);
        assert_eq!(agents[0].model.as_deref(), Some("fast"));
    }

    #[test]
    fn test_init_config() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), None).unwrap();

        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), "agentfleet.json");
        assert!(load_config_file(&path).is_ok());
    }
}
