// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Connection handling.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{Agent, AgentStatus, Node, NodeStatus, TaskStatus, TaskType};
use crate::wire::{Decoder, Encoder, MessageType, WireError, WireMessage};

use super::{BoxedWriter, Connection, Controller, ControllerError};

impl Controller {
    pub(super) async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ControllerError> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            debug!(peer = %peer, "Accepted connection");

            let controller = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                controller
                    .handle_connection(stream, peer.to_string(), cancel)
                    .await;
            });
        }
    }

    /// Serve one peer until it disconnects or `cancel` fires.
    pub async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        address: String,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut decoder = Decoder::new(read_half);
        let conn = Arc::new(Connection {
            address,
            encoder: Mutex::new(Encoder::new(Box::new(write_half) as BoxedWriter)),
        });

        let first: WireMessage = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            msg = decoder.decode::<WireMessage>() => match msg {
                Ok(msg) => msg,
                Err(WireError::StreamClosed) => return,
                Err(e) => {
                    reject(&conn, format!("invalid first message: {}", e)).await;
                    return;
                }
            },
        };

        let node_id = match first.kind {
            MessageType::Register => match self.register_node(&first, &conn.address).await {
                Ok(node_id) => node_id,
                Err(e) => {
                    reject(&conn, e.to_string()).await;
                    return;
                }
            },
            MessageType::Task => {
                self.handle_submission(&first, &conn).await;
                return;
            }
            other => {
                reject(&conn, format!("first message must be register, got {}", other)).await;
                return;
            }
        };

        self.connections
            .write()
            .await
            .insert(node_id.clone(), Arc::clone(&conn));

        if let Err(e) = conn.send(&WireMessage::register_ack(&node_id)).await {
            warn!(node = %node_id, error = %e, "Failed to acknowledge registration");
        } else {
            self.read_loop(&node_id, &conn, &mut decoder, &cancel).await;
        }

        self.disconnect(&node_id, &conn).await;
    }

    async fn read_loop<R>(
        &self,
        node_id: &str,
        conn: &Connection,
        decoder: &mut Decoder<R>,
        cancel: &CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                msg = decoder.decode::<WireMessage>() => msg,
            };

            match next {
                Ok(msg) => {
                    let kind = msg.kind;
                    if let Err(e) = self.handle_message(node_id, msg).await {
                        debug!(node = %node_id, kind = %kind, error = %e, "Rejected message");
                        if let Err(e) = conn.send(&WireMessage::error(e.to_string())).await {
                            warn!(node = %node_id, error = %e, "Failed to send error");
                            return;
                        }
                    }
                }
                Err(WireError::StreamClosed) => {
                    info!(node = %node_id, "Node disconnected");
                    return;
                }
                Err(WireError::Malformed(e)) => {
                    warn!(node = %node_id, error = %e, "Malformed message");
                    let reply = WireMessage::error(format!("malformed message: {}", e));
                    if conn.send(&reply).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(node = %node_id, error = %e, "Connection failed");
                    return;
                }
            }
        }
    }

    /// Upsert the node for a `register` message and return its id.
    async fn register_node(&self, msg: &WireMessage, address: &str) -> Result<String, ControllerError> {
        let name = msg
            .node_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ControllerError::Protocol("register requires node_name".to_string()))?;
        let node_id = msg
            .node_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut node = match self.store.get_node(&node_id).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => Node::new(&node_id, &name),
            Err(e) => return Err(e.into()),
        };
        node.name = name;
        node.address = address.to_string();
        if let Some(labels) = &msg.labels {
            node.labels = labels.clone();
        }
        if let Some(version) = &msg.version {
            node.version = version.clone();
        }
        node.touch();
        self.store.save_node(&node).await?;

        info!(node = %node_id, name = %node.name, address = %address, "Node registered");
        Ok(node_id)
    }

    /// Apply one message from a registered node.
    pub(super) async fn handle_message(
        &self,
        node_id: &str,
        msg: WireMessage,
    ) -> Result<(), ControllerError> {
        let mut node = match self.store.get_node(node_id).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => Node::new(node_id, node_id),
            Err(e) => return Err(e.into()),
        };
        node.touch();

        let result = match msg.kind {
            MessageType::Heartbeat => Ok(()),
            MessageType::AgentRegister => self.register_agent(&mut node, &msg).await,
            MessageType::AgentUnregister => self.unregister_agent(&mut node, &msg).await,
            MessageType::TaskResult => self.apply_task_result(node_id, &msg).await,
            MessageType::Error => {
                warn!(node = %node_id, error = msg.error.as_deref().unwrap_or_default(), "Node reported error");
                Ok(())
            }
            other => Err(ControllerError::Protocol(format!(
                "unexpected message type {}",
                other
            ))),
        };

        // last_seen moves even when the message itself is rejected.
        self.store.save_node(&node).await?;
        result
    }

    async fn register_agent(&self, node: &mut Node, msg: &WireMessage) -> Result<(), ControllerError> {
        let node_id = node.id.clone();
        let name = msg
            .agent_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ControllerError::Protocol("agent_register requires agent_name".to_string()))?;
        let agent_id = msg
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut agent = match self.store.get_agent(&agent_id).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => Agent::new(&agent_id, &name, &node_id),
            Err(e) => return Err(e.into()),
        };
        if agent.node_id != node_id {
            self.detach_from_previous_node(&agent.node_id, &agent_id).await?;
        }
        agent.name = name;
        agent.node_id = node_id.clone();
        agent.status = AgentStatus::Running;
        agent.last_active = Utc::now();
        if let Some(cluster) = &msg.cluster {
            agent.cluster = cluster.clone();
        }
        if let Some(namespace) = &msg.namespace {
            agent.namespace = namespace.clone();
        }
        if let Some(description) = &msg.description {
            agent.description = description.clone();
        }
        if let Some(model) = &msg.model {
            agent.model = model.clone();
        }
        if let Some(skills) = &msg.skills {
            agent.skills = skills.clone();
        }
        self.store.save_agent(&agent).await?;

        node.attach_agent(&agent_id);

        info!(node = %node_id, agent = %agent_id, name = %agent.name, "Agent registered");
        Ok(())
    }

    async fn unregister_agent(&self, node: &mut Node, msg: &WireMessage) -> Result<(), ControllerError> {
        let agent_id = msg.agent_id.as_deref().ok_or_else(|| {
            ControllerError::Protocol("agent_unregister requires agent_id".to_string())
        })?;
        match self.store.get_agent(agent_id).await {
            Ok(agent) if agent.node_id != node.id => {
                return Err(ControllerError::Protocol(format!(
                    "agent {} belongs to node {}",
                    agent_id, agent.node_id
                )));
            }
            Ok(_) => self.store.delete_agent(agent_id).await?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        node.detach_agent(agent_id);

        info!(node = %node.id, agent = %agent_id, "Agent unregistered");
        Ok(())
    }

    async fn apply_task_result(&self, node_id: &str, msg: &WireMessage) -> Result<(), ControllerError> {
        let task_id = msg
            .task_id
            .as_deref()
            .ok_or_else(|| ControllerError::Protocol("task_result requires task_id".to_string()))?;
        let status = msg
            .status
            .ok_or_else(|| ControllerError::Protocol("task_result requires status".to_string()))?;

        let mut task = self.store.get_task(task_id).await?;
        if task.node_id != node_id {
            return Err(ControllerError::Protocol(format!(
                "task {} is assigned to node {}",
                task_id, task.node_id
            )));
        }
        match status {
            TaskStatus::Running => task.transition(TaskStatus::Running)?,
            TaskStatus::Completed => task.complete(msg.result.clone().unwrap_or_default())?,
            TaskStatus::Failed => task.fail(msg.error.clone().unwrap_or_default())?,
            other => {
                return Err(ControllerError::Protocol(format!(
                    "nodes cannot report status {}",
                    other
                )))
            }
        }
        self.store.save_task(&task).await?;

        debug!(task = %task.id, status = %task.status, "Task updated");
        Ok(())
    }

    /// Drop `agent_id` from the node that hosted it before it moved.
    async fn detach_from_previous_node(&self, previous: &str, agent_id: &str) -> Result<(), ControllerError> {
        match self.store.get_node(previous).await {
            Ok(mut node) => {
                node.detach_agent(agent_id);
                self.store.save_node(&node).await?;
                debug!(node = %previous, agent = %agent_id, "Agent moved off node");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Answer a one-shot `task` submission and close.
    async fn handle_submission(&self, msg: &WireMessage, conn: &Connection) {
        let reply = match self.submit(msg).await {
            Ok(task_id) => WireMessage::task_result(task_id, TaskStatus::Pending),
            Err(e) => WireMessage::error(e.to_string()),
        };
        if let Err(e) = conn.send(&reply).await {
            warn!(peer = %conn.address, error = %e, "Failed to answer submission");
        }
        let _ = conn.encoder.lock().await.shutdown().await;
    }

    async fn submit(&self, msg: &WireMessage) -> Result<String, ControllerError> {
        let agent = msg
            .agent
            .as_deref()
            .ok_or_else(|| ControllerError::Protocol("task requires agent".to_string()))?;
        let prompt = msg
            .prompt
            .as_deref()
            .ok_or_else(|| ControllerError::Protocol("task requires prompt".to_string()))?;

        let agent_id = self.resolve_agent(agent).await?;
        let task = self.create_task(&agent_id, prompt, TaskType::Manual).await?;
        Ok(task.id)
    }

    /// Resolve an agent id, falling back to a running agent with that name.
    async fn resolve_agent(&self, agent: &str) -> Result<String, ControllerError> {
        match self.store.get_agent(agent).await {
            Ok(found) => return Ok(found.id),
            Err(e) if !e.is_not_found() => return Err(e.into()),
            Err(_) => {}
        }

        let mut candidates: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.name == agent && a.status == AgentStatus::Running)
            .collect();
        candidates.sort_by(|a, b| b.last_active.cmp(&a.last_active));

        candidates
            .into_iter()
            .next()
            .map(|a| a.id)
            .ok_or_else(|| crate::error::StoreError::not_found("agent", agent).into())
    }

    /// Drop the connection and mark its node disconnected, unless the node
    /// already reconnected on a newer connection.
    async fn disconnect(&self, node_id: &str, conn: &Arc<Connection>) {
        {
            let mut connections = self.connections.write().await;
            match connections.get(node_id) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(node_id);
                }
                _ => return,
            }
        }

        match self.store.get_node(node_id).await {
            Ok(mut node) => {
                node.status = NodeStatus::Disconnected;
                if let Err(e) = self.store.save_node(&node).await {
                    warn!(node = %node_id, error = %e, "Failed to mark node disconnected");
                }
            }
            Err(e) => warn!(node = %node_id, error = %e, "Disconnected node missing from store"),
        }
    }
}

async fn reject(conn: &Connection, message: String) {
    warn!(peer = %conn.address, error = %message, "Rejecting connection");
    let mut encoder = conn.encoder.lock().await;
    let _ = encoder.encode(&WireMessage::error(message)).await;
    let _ = encoder.shutdown().await;
}
