// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the agentfleet control plane.
//!
//! This module provides strongly-typed errors for different parts of the application,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation.

use thiserror::Error;

use crate::store::types::TaskStatus;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API error: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl ProviderError {
    /// Create an API error with status code.
    pub fn api(message: impl Into<String>, status_code: u16) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create an API error without status code.
    pub fn api_message(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: None,
        }
    }
}

/// Errors returned by a [`Store`](crate::store::Store) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Persisting or loading a collection failed.
    ///
    /// For the file store the in-memory view already reflects the mutation
    /// when this is returned from a `save_*`/`delete_*` call.
    #[error("Store IO error: {0}")]
    Io(String),

    /// A persisted document could not be (de)serialized.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// The caller does not hold the leader lease.
    #[error("Not the leader: {0}")]
    NotLeader(String),

    /// Another process holds the lease lock right now.
    #[error("Leader lease lock is busy")]
    LeaseBusy,
}

impl StoreError {
    /// Build a not-found error for an entity kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors produced while routing a user message to an agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Manual addressing named an agent that is not registered.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// Routing is disabled and there is neither a default nor any agent.
    #[error("no agents available")]
    NoAgentsAvailable,

    /// Every routing mode abstained and no default agent is configured.
    #[error("could not route message")]
    CouldNotRoute,

    /// A routing rule pattern failed to compile.
    #[error("invalid routing pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Errors from the task state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_api() {
        let err = ProviderError::api("Bad request", 400);
        match err {
            ProviderError::ApiError { message, status_code } => {
                assert_eq!(message, "Bad request");
                assert_eq!(status_code, Some(400));
            }
            _ => panic!("Expected ApiError"),
        }
    }

    #[test]
    fn test_store_not_found_display() {
        let err = StoreError::not_found("node", "n-1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "node not found: n-1");
    }

    #[test]
    fn test_store_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: StoreError = io_err.into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_route_error_display() {
        let err = RouteError::AgentNotFound("ghost".to_string());
        assert_eq!(err.to_string(), "agent not found: ghost");
        assert_eq!(RouteError::CouldNotRoute.to_string(), "could not route message");
    }

    #[test]
    fn test_task_error_display() {
        let err = TaskError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid task transition: completed -> running");
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let json_err = result.unwrap_err();
        let config_err: ConfigError = json_err.into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }
}
