// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Entities persisted by the state store.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Free-form key/value annotations on a task.
pub type Metadata = HashMap<String, String>;

// ============================================================================
// Node
// ============================================================================

/// Connection state of a node as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Ready,
    NotReady,
    Disconnected,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NotReady => write!(f, "not-ready"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Capacity and usage snapshot reported by a node.
///
/// Placement decisions are not made from this yet; it is carried so a
/// scheduler can read it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub max_agents: u32,
    pub running_jobs: u32,
}

/// A worker machine hosting agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub status: NodeStatus,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    pub last_seen: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub version: String,
}

impl Node {
    /// Create a ready node seen just now.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            address: String::new(),
            labels: HashMap::new(),
            status: NodeStatus::Ready,
            agent_ids: Vec::new(),
            resources: Resources::default(),
            last_seen: now,
            joined_at: now,
            version: String::new(),
        }
    }

    /// Record activity from the node.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.status = NodeStatus::Ready;
    }

    /// Add an agent id if not already listed.
    pub fn attach_agent(&mut self, agent_id: &str) {
        if !self.agent_ids.iter().any(|id| id == agent_id) {
            self.agent_ids.push(agent_id.to_string());
        }
    }

    /// Remove an agent id.
    pub fn detach_agent(&mut self, agent_id: &str) {
        self.agent_ids.retain(|id| id != agent_id);
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Lifecycle state of a controller-side agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Stopped,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// An agent hosted on a node.
///
/// `node_id` must reference an existing [`Node`] for the fleet to be
/// consistent. Stores do not check this; callers do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub node_id: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    /// Create a running agent on `node_id`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            node_id: node_id.into(),
            cluster: String::new(),
            namespace: String::new(),
            description: String::new(),
            model: String::new(),
            skills: Vec::new(),
            status: AgentStatus::Running,
            system_prompt: String::new(),
            created_at: now,
            last_active: now,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// How a task came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Message,
    Cron,
    Manual,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Cron => write!(f, "cron"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Pending, Failed)
                | (Dispatched, Running)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work addressed to one agent on one node.
///
/// `agent_name` and `node_id` are copies of the referenced agent's fields.
/// Whoever re-assigns a task must update them together with `agent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub agent_id: String,
    pub agent_name: String,
    pub node_id: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: i32,
    /// Execution timeout in seconds; zero means none.
    #[serde(default)]
    pub timeout_secs: u64,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Task {
    /// Create a pending task for `agent`.
    pub fn new(task_type: TaskType, agent: &Agent, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            node_id: agent.node_id.clone(),
            prompt: prompt.into(),
            priority: 0,
            timeout_secs: 0,
            status: TaskStatus::Pending,
            result: String::new(),
            error: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            metadata: Metadata::new(),
        }
    }

    /// Move to `to`, stamping `started_at` / `finished_at`.
    ///
    /// A task that jumps from `dispatched` straight to a terminal state gets
    /// `started_at` equal to its finish time. The task is left untouched when
    /// the transition is not allowed.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        if to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
            if self.started_at.is_none() && self.status == TaskStatus::Dispatched {
                self.started_at = Some(now);
            }
        }
        self.status = to;
        Ok(())
    }

    /// Mark the task failed with `error`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        self.error = error.into();
        Ok(())
    }

    /// Mark the task completed with `result`.
    pub fn complete(&mut self, result: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Completed)?;
        self.result = result.into();
        Ok(())
    }
}
