// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed reference store.
//!
//! Each collection is kept in memory and mirrored to one JSON array file
//! (`nodes.json`, `agents.json`, `tasks.json`) that is rewritten in full on
//! every mutation. A single [`RwLock`] covers the maps, the files, the
//! leader state and the watcher list: reads share it, writes hold it
//! exclusively across the in-memory change and the file write.
//!
//! The in-memory change happens first. If the write then fails the error is
//! returned and the two views stay diverged until the next successful write
//! of that collection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::StoreError;

use super::lease::{self, LeaseRecord};
use super::types::{Agent, Node, Task, TaskStatus};
use super::{
    LeaderElection, Store, StoreResult, WatchEvent, WatchEventType, WatchStream, AGENTS_PREFIX,
    NODES_PREFIX, TASKS_PREFIX,
};

const NODES_FILE: &str = "nodes.json";
const AGENTS_FILE: &str = "agents.json";
const TASKS_FILE: &str = "tasks.json";

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    agents: HashMap<String, Agent>,
    tasks: HashMap<String, Task>,
    /// Holder in always-leader mode.
    leader: String,
    watchers: Vec<Watcher>,
    closed: bool,
}

impl State {
    fn notify(&mut self, kind: WatchEventType, key: String, value: String) {
        let event = WatchEvent { kind, key, value };
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }
}

/// Single-process store persisted as JSON files in one directory.
pub struct FileStore {
    dir: PathBuf,
    election: LeaderElection,
    state: RwLock<State>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>, election: LeaderElection) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let nodes: Vec<Node> = load_collection(&dir.join(NODES_FILE)).await?;
        let agents: Vec<Agent> = load_collection(&dir.join(AGENTS_FILE)).await?;
        let tasks: Vec<Task> = load_collection(&dir.join(TASKS_FILE)).await?;

        info!(
            dir = %dir.display(),
            nodes = nodes.len(),
            agents = agents.len(),
            tasks = tasks.len(),
            election = ?election,
            "Opened file store"
        );

        let state = State {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            ..State::default()
        };

        Ok(Self {
            dir,
            election,
            state: RwLock::new(state),
        })
    }

    /// Directory holding the collection files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Leader election mode this store was opened with.
    pub fn election(&self) -> LeaderElection {
        self.election
    }

    /// Every task, in no particular order.
    pub async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.values().cloned().collect())
    }

    /// Tasks addressed to one agent.
    pub async fn list_tasks_by_agent(&self, agent_id: &str) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect())
    }

    /// Fencing token of the current lease; zero in always-leader mode or
    /// when no lease was ever granted.
    pub async fn current_fencing_token(&self) -> StoreResult<u64> {
        match self.election {
            LeaderElection::AlwaysLeader => Ok(0),
            LeaderElection::Lease => {
                let _state = self.state.read().await;
                Ok(self
                    .read_lease()
                    .await?
                    .map(|r| r.fencing_token)
                    .unwrap_or(0))
            }
        }
    }

    async fn read_lease(&self) -> StoreResult<Option<LeaseRecord>> {
        let dir = self.dir.clone();
        blocking(move || lease::current(&dir)).await
    }

    async fn write_file<T: Serialize>(&self, name: &str, items: &HashMap<String, T>) -> StoreResult<()> {
        let mut entries: Vec<(&String, &T)> = items.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let values: Vec<&T> = entries.into_iter().map(|(_, v)| v).collect();

        let json = serde_json::to_vec_pretty(&values)?;
        tokio::fs::write(self.dir.join(name), json).await?;
        Ok(())
    }
}

async fn load_collection<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(format!("lease task failed: {}", e)))?
}

fn entity_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[async_trait]
impl Store for FileStore {
    // ========================================================================
    // Nodes
    // ========================================================================

    async fn get_node(&self, id: &str) -> StoreResult<Node> {
        let state = self.state.read().await;
        state
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let state = self.state.read().await;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn save_node(&self, node: &Node) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.nodes.insert(node.id.clone(), node.clone());
        self.write_file(NODES_FILE, &state.nodes).await?;
        state.notify(
            WatchEventType::Put,
            format!("{}{}", NODES_PREFIX, node.id),
            entity_json(node),
        );
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.nodes.remove(id).is_none() {
            return Ok(());
        }
        self.write_file(NODES_FILE, &state.nodes).await?;
        state.notify(
            WatchEventType::Delete,
            format!("{}{}", NODES_PREFIX, id),
            String::new(),
        );
        Ok(())
    }

    // ========================================================================
    // Agents
    // ========================================================================

    async fn get_agent(&self, id: &str) -> StoreResult<Agent> {
        let state = self.state.read().await;
        state
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("agent", id))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let state = self.state.read().await;
        Ok(state.agents.values().cloned().collect())
    }

    async fn list_agents_by_node(&self, node_id: &str) -> StoreResult<Vec<Agent>> {
        let state = self.state.read().await;
        Ok(state
            .agents
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn save_agent(&self, agent: &Agent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.agents.insert(agent.id.clone(), agent.clone());
        self.write_file(AGENTS_FILE, &state.agents).await?;
        state.notify(
            WatchEventType::Put,
            format!("{}{}", AGENTS_PREFIX, agent.id),
            entity_json(agent),
        );
        Ok(())
    }

    async fn delete_agent(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.agents.remove(id).is_none() {
            return Ok(());
        }
        self.write_file(AGENTS_FILE, &state.agents).await?;
        state.notify(
            WatchEventType::Delete,
            format!("{}{}", AGENTS_PREFIX, id),
            String::new(),
        );
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    async fn get_task(&self, id: &str) -> StoreResult<Task> {
        let state = self.state.read().await;
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn list_pending_tasks(&self) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn save_task(&self, task: &Task) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id.clone(), task.clone());
        self.write_file(TASKS_FILE, &state.tasks).await?;
        state.notify(
            WatchEventType::Put,
            format!("{}{}", TASKS_PREFIX, task.id),
            entity_json(task),
        );
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.tasks.remove(id).is_none() {
            return Ok(());
        }
        self.write_file(TASKS_FILE, &state.tasks).await?;
        state.notify(
            WatchEventType::Delete,
            format!("{}{}", TASKS_PREFIX, id),
            String::new(),
        );
        Ok(())
    }

    // ========================================================================
    // Leadership
    // ========================================================================

    async fn try_become_leader(&self, controller_id: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match self.election {
            LeaderElection::AlwaysLeader => {
                state.leader = controller_id.to_string();
                Ok(true)
            }
            LeaderElection::Lease => {
                let dir = self.dir.clone();
                let holder = controller_id.to_string();
                match blocking(move || lease::acquire(&dir, &holder, ttl)).await {
                    Ok(Some(record)) => {
                        debug!(
                            holder = %record.holder,
                            fencing_token = record.fencing_token,
                            "Lease granted"
                        );
                        Ok(true)
                    }
                    Ok(None) => Ok(false),
                    Err(StoreError::LeaseBusy) => {
                        debug!(controller_id, "Lease lock contended");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn renew_leadership(&self, controller_id: &str, ttl: Duration) -> StoreResult<()> {
        let _state = self.state.write().await;
        match self.election {
            LeaderElection::AlwaysLeader => Ok(()),
            LeaderElection::Lease => {
                let dir = self.dir.clone();
                let holder = controller_id.to_string();
                blocking(move || lease::renew(&dir, &holder, ttl)).await?;
                Ok(())
            }
        }
    }

    async fn get_leader(&self) -> StoreResult<String> {
        let state = self.state.read().await;
        match self.election {
            LeaderElection::AlwaysLeader => Ok(state.leader.clone()),
            LeaderElection::Lease => {
                let now = chrono::Utc::now();
                Ok(self
                    .read_lease()
                    .await?
                    .filter(|r| r.is_live(now))
                    .map(|r| r.holder)
                    .unwrap_or_default())
            }
        }
    }

    // ========================================================================
    // Watch / lifecycle
    // ========================================================================

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut state = self.state.write().await;
        if state.closed {
            return Ok(WatchStream::closed());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        debug!(prefix, watchers = state.watchers.len(), "Watch registered");
        Ok(WatchStream::new(rx))
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.watchers.clear();

        let flushed = async {
            self.write_file(NODES_FILE, &state.nodes).await?;
            self.write_file(AGENTS_FILE, &state.agents).await?;
            self.write_file(TASKS_FILE, &state.tasks).await
        }
        .await;

        match &flushed {
            Ok(()) => info!(dir = %self.dir.display(), "Closed file store"),
            Err(e) => warn!(error = %e, "Final flush of file store failed"),
        }
        flushed
    }
}
