// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire message envelope exchanged between controller and nodes.
//!
//! Every message is a single flat JSON object with a `type` discriminator.
//! Only the fields relevant to the type are populated; everything else is
//! omitted from the serialized form rather than written as `null`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::types::TaskStatus;

/// Discriminator for [`WireMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Node -> controller: announce the node.
    Register,
    /// Controller -> node: registration accepted, carries the node id.
    RegisterAck,
    /// Node -> controller: liveness.
    Heartbeat,
    /// Node -> controller: an agent is running on this node.
    AgentRegister,
    /// Node -> controller: an agent went away.
    AgentUnregister,
    /// Controller -> node: run a task.
    Task,
    /// Node -> controller: task progress or outcome.
    TaskResult,
    /// Either direction: something went wrong.
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Register => "register",
            Self::RegisterAck => "register_ack",
            Self::Heartbeat => "heartbeat",
            Self::AgentRegister => "agent_register",
            Self::AgentUnregister => "agent_unregister",
            Self::Task => "task",
            Self::TaskResult => "task_result",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Flat tagged envelope for controller/node traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,

    // --- registration ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    // --- agent ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,

    // --- task ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    // --- error ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireMessage {
    /// Create a message of the given type with every optional group empty.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            node_name: None,
            node_id: None,
            token: None,
            labels: None,
            version: None,
            agent_id: None,
            agent_name: None,
            cluster: None,
            namespace: None,
            description: None,
            model: None,
            skills: None,
            task_id: None,
            agent: None,
            prompt: None,
            result: None,
            status: None,
            error: None,
        }
    }

    /// Create a registration message.
    pub fn register(node_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            node_name: Some(node_name.into()),
            version: Some(version.into()),
            ..Self::new(MessageType::Register)
        }
    }

    /// Create a registration acknowledgement.
    pub fn register_ack(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::new(MessageType::RegisterAck)
        }
    }

    /// Create a heartbeat.
    pub fn heartbeat(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::new(MessageType::Heartbeat)
        }
    }

    /// Create an agent announcement.
    pub fn agent_register(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            ..Self::new(MessageType::AgentRegister)
        }
    }

    /// Create an agent removal notice.
    pub fn agent_unregister(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::new(MessageType::AgentUnregister)
        }
    }

    /// Create a task dispatch.
    pub fn task(
        task_id: impl Into<String>,
        agent: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Some(task_id.into()),
            agent: Some(agent.into()),
            prompt: Some(prompt.into()),
            ..Self::new(MessageType::Task)
        }
    }

    /// Create a task progress/outcome report.
    pub fn task_result(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: Some(task_id.into()),
            status: Some(status),
            ..Self::new(MessageType::TaskResult)
        }
    }

    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(MessageType::Error)
        }
    }

    /// Set the node id.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the registration token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set node labels.
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Set the agent id.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the task result text.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Set the error text.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Check if this is an error message.
    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }
}
