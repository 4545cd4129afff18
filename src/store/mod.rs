// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pluggable state store for nodes, agents and tasks.
//!
//! [`Store`] is the contract every backend satisfies: keyed CRUD over three
//! collections, leader election, and a prefix-scoped change feed.
//! [`FileStore`] is the single-process reference backend.
//!
//! # Contract
//!
//! - `get_*` fails with [`StoreError::NotFound`] when the id is absent.
//! - `save_*` is an upsert keyed by id.
//! - `delete_*` of an absent id succeeds without effect.
//! - `list_*` returns an unordered snapshot; an empty store yields an empty
//!   vector.
//! - Referential integrity (an agent's `node_id` naming a real node) is the
//!   caller's job.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentfleet::store::{FileStore, LeaderElection, Store};
//!
//! let store = FileStore::open("/var/lib/agentfleet", LeaderElection::Lease).await?;
//! if store.try_become_leader("ctrl-1", Duration::from_secs(15)).await? {
//!     // authoritative
//! }
//! ```

pub mod file;
mod lease;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;

pub use file::FileStore;
pub use lease::LeaseRecord;
pub use types::{
    Agent, AgentStatus, Metadata, Node, NodeStatus, Resources, Task, TaskStatus, TaskType,
};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key prefix for node watch events.
pub const NODES_PREFIX: &str = "nodes/";
/// Key prefix for agent watch events.
pub const AGENTS_PREFIX: &str = "agents/";
/// Key prefix for task watch events.
pub const TASKS_PREFIX: &str = "tasks/";

/// How a store decides who leads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderElection {
    /// Every caller is granted leadership. Only valid when exactly one
    /// controller runs against the store; there is no mutual exclusion
    /// between processes.
    #[default]
    #[serde(alias = "always")]
    AlwaysLeader,
    /// Lease with TTL, renewal and a fencing token.
    Lease,
}

/// Kind of change reported by [`Store::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventType {
    Put,
    Delete,
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventType,
    pub key: String,
    /// Entity JSON for puts; empty for deletes.
    pub value: String,
}

/// Lazy stream of [`WatchEvent`]s. Cannot be restarted once it ends.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// A stream that has already ended.
    pub fn closed() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { rx }
    }

    /// Next event, or `None` once the backend stops producing.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

/// Capability set every state backend implements.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_node(&self, id: &str) -> StoreResult<Node>;
    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;
    async fn save_node(&self, node: &Node) -> StoreResult<()>;
    async fn delete_node(&self, id: &str) -> StoreResult<()>;

    async fn get_agent(&self, id: &str) -> StoreResult<Agent>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
    async fn list_agents_by_node(&self, node_id: &str) -> StoreResult<Vec<Agent>>;
    async fn save_agent(&self, agent: &Agent) -> StoreResult<()>;
    async fn delete_agent(&self, id: &str) -> StoreResult<()>;

    async fn get_task(&self, id: &str) -> StoreResult<Task>;
    async fn list_pending_tasks(&self) -> StoreResult<Vec<Task>>;
    async fn save_task(&self, task: &Task) -> StoreResult<()>;
    async fn delete_task(&self, id: &str) -> StoreResult<()>;

    /// Try to take leadership for `ttl`. `Ok(false)` means someone else holds it.
    async fn try_become_leader(&self, controller_id: &str, ttl: Duration) -> StoreResult<bool>;

    /// Extend leadership. Fails unless `controller_id` currently holds it.
    async fn renew_leadership(&self, controller_id: &str, ttl: Duration) -> StoreResult<()>;

    /// Current leader id, empty when nobody leads.
    async fn get_leader(&self) -> StoreResult<String>;

    /// Change feed for keys under `prefix`.
    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream>;

    /// Release resources. For file-backed stores this is the final flush.
    async fn close(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_stream_ends_immediately() {
        let mut stream = WatchStream::closed();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_leader_election_parses_short_name() {
        let mode: LeaderElection = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(mode, LeaderElection::AlwaysLeader);
        let mode: LeaderElection = serde_json::from_str("\"lease\"").unwrap();
        assert_eq!(mode, LeaderElection::Lease);
    }

    #[test]
    fn test_watch_event_serialization() {
        let event = WatchEvent {
            kind: WatchEventType::Delete,
            key: "tasks/t1".to_string(),
            value: String::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"delete\""));
    }
}
