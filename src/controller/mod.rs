// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fleet controller.
//!
//! Accepts node connections speaking the [wire protocol](crate::wire),
//! persists nodes, agents and tasks through a [`Store`], and dispatches
//! pending tasks to connected nodes.
//!
//! # Architecture
//!
//! ```text
//!   TcpListener ──► one reader task per connection ──► Store
//!                              │
//!                              ▼
//!                   connections: node id ─► Encoder (mutex)
//!                              ▲
//!   maintenance loop (leader only): dispatch_pending + reap_stale_nodes
//!   leadership loop: try_become_leader / renew_leadership every ttl/3
//! ```
//!
//! Only the leader dispatches and reaps. Connections are served by every
//! instance so nodes can report to any controller.

mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::error::{StoreError, TaskError};
use crate::store::{NodeStatus, Store, Task, TaskStatus, TaskType};
use crate::wire::{Encoder, WireError, WireMessage};

/// Errors raised by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("node not connected: {0}")]
    NodeNotConnected(String),
}

/// Runtime settings for a [`Controller`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub listen: String,
    pub controller_id: String,
    pub leader_ttl: Duration,
    pub node_timeout: Duration,
    pub dispatch_interval: Duration,
}

impl From<&FleetConfig> for ControllerConfig {
    fn from(config: &FleetConfig) -> Self {
        Self {
            listen: config.listen.clone(),
            controller_id: config.controller_id.clone(),
            leader_ttl: config.leader_ttl(),
            node_timeout: config.node_timeout(),
            dispatch_interval: config.dispatch_interval(),
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one node connection.
struct Connection {
    address: String,
    encoder: Mutex<Encoder<BoxedWriter>>,
}

impl Connection {
    async fn send(&self, msg: &WireMessage) -> Result<(), WireError> {
        self.encoder.lock().await.encode(msg).await
    }
}

/// The control-plane server.
pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn Store>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    leader: AtomicBool,
}

impl Controller {
    pub fn new(config: ControllerConfig, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            connections: RwLock::new(HashMap::new()),
            leader: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Whether this instance currently holds leadership.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Ids of nodes with a live connection to this instance.
    pub async fn connected_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ControllerError> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already-bound listener until `cancel` fires.
    ///
    /// Runs the accept loop, the leadership loop and the maintenance loop.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!(
            address = %listener.local_addr()?,
            controller = %self.config.controller_id,
            "Controller listening"
        );

        let leadership = tokio::spawn(Arc::clone(&self).leadership_loop(cancel.clone()));
        let maintenance = tokio::spawn(Arc::clone(&self).maintenance_loop(cancel.clone()));

        let result = Arc::clone(&self).accept_loop(listener, cancel.clone()).await;

        cancel.cancel();
        let _ = leadership.await;
        let _ = maintenance.await;
        self.connections.write().await.clear();
        info!("Controller stopped");
        result
    }

    /// Create a pending task for `agent_id`.
    ///
    /// `agent_name` and `node_id` are copied from the agent record.
    pub async fn create_task(
        &self,
        agent_id: &str,
        prompt: &str,
        task_type: TaskType,
    ) -> Result<Task, ControllerError> {
        let agent = self.store.get_agent(agent_id).await?;
        let task = Task::new(task_type, &agent, prompt);
        self.store.save_task(&task).await?;
        info!(task = %task.id, agent = %agent.name, node = %agent.node_id, "Created task");
        Ok(task)
    }

    /// Send every pending task whose node is connected.
    ///
    /// Sent tasks move to `dispatched`; a failed send marks the task
    /// `failed`. Tasks for absent nodes stay pending. Returns how many tasks
    /// were sent.
    pub async fn dispatch_pending(&self) -> Result<usize, ControllerError> {
        let mut pending = self.store.list_pending_tasks().await?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut sent = 0;
        for mut task in pending {
            let Some(conn) = self.connection(&task.node_id).await else {
                continue;
            };

            // Saved before sending: the node may report back before send returns.
            task.transition(TaskStatus::Dispatched)?;
            self.store.save_task(&task).await?;

            let msg = WireMessage::task(&task.id, &task.agent_name, &task.prompt);
            match conn.send(&msg).await {
                Ok(()) => {
                    debug!(task = %task.id, node = %task.node_id, "Dispatched task");
                    sent += 1;
                }
                Err(e) => {
                    warn!(task = %task.id, node = %task.node_id, error = %e, "Dispatch failed");
                    task.fail(e.to_string())?;
                    self.store.save_task(&task).await?;
                }
            }
        }
        Ok(sent)
    }

    /// Mark nodes silent for longer than the node timeout as disconnected.
    ///
    /// Returns the ids of nodes that changed.
    pub async fn reap_stale_nodes(&self) -> Result<Vec<String>, ControllerError> {
        let Ok(timeout) = chrono::Duration::from_std(self.config.node_timeout) else {
            return Ok(Vec::new());
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(timeout) else {
            return Ok(Vec::new());
        };

        let mut reaped = Vec::new();
        for mut node in self.store.list_nodes().await? {
            if node.status == NodeStatus::Disconnected || node.last_seen >= cutoff {
                continue;
            }
            node.status = NodeStatus::Disconnected;
            self.store.save_node(&node).await?;
            info!(node = %node.id, name = %node.name, "Node timed out");
            reaped.push(node.id);
        }
        Ok(reaped)
    }

    async fn connection(&self, node_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(node_id).cloned()
    }

    /// Send `msg` to a connected node.
    pub async fn send_to(&self, node_id: &str, msg: &WireMessage) -> Result<(), ControllerError> {
        let conn = self
            .connection(node_id)
            .await
            .ok_or_else(|| ControllerError::NodeNotConnected(node_id.to_string()))?;
        conn.send(msg).await?;
        Ok(())
    }

    /// Acquire and hold leadership until cancelled.
    async fn leadership_loop(self: Arc<Self>, cancel: CancellationToken) {
        let ttl = self.config.leader_ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));
        let id = self.config.controller_id.clone();

        loop {
            if self.is_leader() {
                if let Err(e) = self.store.renew_leadership(&id, ttl).await {
                    warn!(controller = %id, error = %e, "Lost leadership");
                    self.leader.store(false, Ordering::SeqCst);
                }
            } else {
                match self.store.try_become_leader(&id, ttl).await {
                    Ok(true) => {
                        info!(controller = %id, "Acquired leadership");
                        self.leader.store(true, Ordering::SeqCst);
                    }
                    Ok(false) => debug!(controller = %id, "Leadership held elsewhere"),
                    Err(e) => error!(controller = %id, error = %e, "Leader election failed"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        self.leader.store(false, Ordering::SeqCst);
    }

    /// Dispatch and reap on a fixed interval while leader.
    async fn maintenance_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_leader() {
                continue;
            }
            if let Err(e) = self.dispatch_pending().await {
                error!(error = %e, "Dispatch pass failed");
            }
            if let Err(e) = self.reap_stale_nodes().await {
                error!(error = %e, "Reaper pass failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Agent, FileStore, LeaderElection, Node};
    use tempfile::TempDir;

    fn config() -> ControllerConfig {
        ControllerConfig {
            listen: "127.0.0.1:0".to_string(),
            controller_id: "ctl-test".to_string(),
            leader_ttl: Duration::from_secs(3),
            node_timeout: Duration::from_secs(30),
            dispatch_interval: Duration::from_millis(50),
        }
    }

    async fn controller(temp: &TempDir) -> Arc<Controller> {
        let store = FileStore::open(temp.path(), LeaderElection::AlwaysLeader)
            .await
            .unwrap();
        Controller::new(config(), Arc::new(store))
    }

    #[test]
    fn test_config_from_fleet_config() {
        let fleet = FleetConfig {
            leader_ttl_secs: 9,
            ..Default::default()
        };
        let config = ControllerConfig::from(&fleet);
        assert_eq!(config.leader_ttl, Duration::from_secs(9));
        assert_eq!(config.listen, fleet.listen);
    }

    #[tokio::test]
    async fn test_create_task_denormalizes_agent() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;
        ctl.store()
            .save_agent(&Agent::new("a1", "coder", "n1"))
            .await
            .unwrap();

        let task = ctl.create_task("a1", "fix it", TaskType::Manual).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.agent_name, "coder");
        assert_eq!(task.node_id, "n1");
        assert_eq!(ctl.store().get_task(&task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_create_task_unknown_agent() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;
        let result = ctl.create_task("ghost", "hi", TaskType::Message).await;
        assert!(matches!(result, Err(ControllerError::Store(e)) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_dispatch_skips_unconnected_nodes() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;
        ctl.store()
            .save_agent(&Agent::new("a1", "coder", "offline"))
            .await
            .unwrap();
        let task = ctl.create_task("a1", "hi", TaskType::Message).await.unwrap();

        assert_eq!(ctl.dispatch_pending().await.unwrap(), 0);
        let stored = ctl.store().get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    /// Writer whose peer has gone away.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_send_failure_fails_task() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;
        ctl.store()
            .save_agent(&Agent::new("a1", "coder", "n1"))
            .await
            .unwrap();
        ctl.connections.write().await.insert(
            "n1".to_string(),
            Arc::new(Connection {
                address: "gone".to_string(),
                encoder: Mutex::new(Encoder::new(Box::new(BrokenPipe) as BoxedWriter)),
            }),
        );
        let task = ctl.create_task("a1", "hi", TaskType::Message).await.unwrap();

        assert_eq!(ctl.dispatch_pending().await.unwrap(), 0);

        let stored = ctl.store().get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(!stored.error.is_empty());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_reaper_marks_silent_nodes() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;

        let mut stale = Node::new("old", "old");
        stale.last_seen = Utc::now() - chrono::Duration::seconds(120);
        ctl.store().save_node(&stale).await.unwrap();
        ctl.store().save_node(&Node::new("fresh", "fresh")).await.unwrap();

        assert_eq!(ctl.reap_stale_nodes().await.unwrap(), vec!["old".to_string()]);
        assert_eq!(
            ctl.store().get_node("old").await.unwrap().status,
            NodeStatus::Disconnected
        );
        assert_eq!(
            ctl.store().get_node("fresh").await.unwrap().status,
            NodeStatus::Ready
        );

        // Already disconnected nodes are left alone.
        assert!(ctl.reap_stale_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leadership_loop_acquires_and_releases() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&ctl).leadership_loop(cancel.clone()));
        for _ in 0..50 {
            if ctl.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctl.is_leader());
        assert_eq!(ctl.store().get_leader().await.unwrap(), "ctl-test");

        cancel.cancel();
        handle.await.unwrap();
        assert!(!ctl.is_leader());
    }

    #[tokio::test]
    async fn test_send_to_unknown_node() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp).await;
        let result = ctl.send_to("ghost", &WireMessage::heartbeat("x")).await;
        assert!(matches!(result, Err(ControllerError::NodeNotConnected(_))));
    }
}
