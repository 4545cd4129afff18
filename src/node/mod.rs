// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Node side of the wire protocol.
//!
//! A [`NodeClient`] registers with the controller, announces its agents,
//! sends heartbeats and runs each `task` it receives through a
//! [`TaskHandler`], reporting `running` and then `completed` or `failed`.
//!
//! ```rust,ignore
//! use agentfleet::node::{AgentTaskHandler, NodeClient, NodeConfig};
//!
//! let handler = Arc::new(AgentTaskHandler::new(agents.clone(), provider));
//! let client = NodeClient::new(NodeConfig::new("worker-1", "127.0.0.1:7450"), handler);
//! client.run(cancel).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentConfig};
use crate::channel::{Channel, ChannelMessage, ChannelRole, MemoryChannel, ProxyChannel};
use crate::config::FleetConfig;
use crate::store::TaskStatus;
use crate::types::SharedProvider;
use crate::wire::{framed, Encoder, MessageType, WireError, WireMessage};

/// Errors raised by the node client.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// The controller answered registration with an error.
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("unexpected {0} message during registration")]
    UnexpectedMessage(MessageType),
}

/// A task as delivered to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task_id: String,
    /// Agent name the task is addressed to.
    pub agent: String,
    pub prompt: String,
}

/// Executes tasks on behalf of a node.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run `task` and return its result text.
    async fn handle(&self, task: &TaskAssignment) -> anyhow::Result<String>;
}

/// Runs tasks through the node's configured agents and a shared provider.
pub struct AgentTaskHandler {
    agents: HashMap<String, AgentConfig>,
    provider: SharedProvider,
}

impl AgentTaskHandler {
    pub fn new(agents: Vec<AgentConfig>, provider: SharedProvider) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
            provider,
        }
    }
}

#[async_trait]
impl TaskHandler for AgentTaskHandler {
    async fn handle(&self, task: &TaskAssignment) -> anyhow::Result<String> {
        let config = self
            .agents
            .get(&task.agent)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("agent not hosted on this node: {}", task.agent))?;

        let (output, mut replies) = MemoryChannel::new(format!("task-{}", task.task_id));
        let proxy = ProxyChannel::new(
            &task.agent,
            ChannelMessage::user(&task.prompt),
            Arc::new(output),
        );

        let outcome = Agent::new(config, Arc::clone(&self.provider)).run(&proxy).await;
        proxy.stop().await?;
        outcome?;

        let mut result = Vec::new();
        while let Some(msg) = replies.try_recv() {
            if msg.role == ChannelRole::Assistant {
                result.push(msg.content);
            }
        }
        Ok(result.join("\n"))
    }
}

/// Connection settings for a [`NodeClient`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    /// Reuse this id across reconnects; the controller assigns one if unset.
    pub node_id: Option<String>,
    pub controller: String,
    pub token: Option<String>,
    pub labels: HashMap<String, String>,
    pub agents: Vec<AgentConfig>,
    pub heartbeat_interval: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, controller: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_id: None,
            controller: controller.into(),
            token: None,
            labels: HashMap::new(),
            agents: Vec::new(),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    pub fn with_agents(mut self, agents: Vec<AgentConfig>) -> Self {
        self.agents = agents;
        self
    }
}

impl From<&FleetConfig> for NodeConfig {
    fn from(config: &FleetConfig) -> Self {
        let node = &config.node;
        Self {
            name: node.name.clone().unwrap_or_else(crate::config::host_name),
            node_id: node.id.clone(),
            controller: node.controller.clone().unwrap_or_else(|| config.listen.clone()),
            token: node.token.clone(),
            labels: node.labels.clone(),
            agents: config.agents.clone(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

type SharedEncoder<S> = Arc<Mutex<Encoder<WriteHalf<S>>>>;

/// The node's connection to the controller.
pub struct NodeClient {
    config: NodeConfig,
    handler: Arc<dyn TaskHandler>,
}

impl NodeClient {
    pub fn new(config: NodeConfig, handler: Arc<dyn TaskHandler>) -> Self {
        Self { config, handler }
    }

    /// Dial the controller and serve until it disconnects or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), NodeError> {
        let stream = TcpStream::connect(&self.config.controller).await?;
        info!(controller = %self.config.controller, "Connected to controller");
        self.run_on(stream, cancel).await
    }

    /// Serve over an established stream.
    pub async fn run_on<S>(&self, stream: S, cancel: CancellationToken) -> Result<(), NodeError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut decoder, encoder) = framed(stream);
        let encoder: SharedEncoder<S> = Arc::new(Mutex::new(encoder));

        let mut register = WireMessage::register(&self.config.name, crate::VERSION)
            .with_labels(self.config.labels.clone());
        register.node_id = self.config.node_id.clone();
        register.token = self.config.token.clone();
        encoder.lock().await.encode(&register).await?;

        let ack: WireMessage = decoder.decode().await?;
        let node_id = match (ack.kind, ack.node_id) {
            (MessageType::RegisterAck, Some(id)) => id,
            (MessageType::Error, _) => {
                return Err(NodeError::Rejected(ack.error.unwrap_or_default()));
            }
            (kind, _) => return Err(NodeError::UnexpectedMessage(kind)),
        };
        info!(node = %node_id, name = %self.config.name, "Registered with controller");

        for agent in &self.config.agents {
            let msg = announce(&node_id, agent);
            encoder.lock().await.encode(&msg).await?;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(node = %node_id, "Node client cancelled");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    encoder.lock().await.encode(&WireMessage::heartbeat(&node_id)).await?;
                }
                msg = decoder.decode::<WireMessage>() => match msg {
                    Ok(msg) => self.on_message(msg, &encoder),
                    Err(WireError::StreamClosed) => {
                        info!(node = %node_id, "Controller closed the connection");
                        return Ok(());
                    }
                    Err(WireError::Malformed(e)) => warn!(error = %e, "Malformed message from controller"),
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    fn on_message<S>(&self, msg: WireMessage, encoder: &SharedEncoder<S>)
    where
        S: AsyncWrite + Send + 'static,
    {
        match msg.kind {
            MessageType::Task => {
                let task = TaskAssignment {
                    task_id: msg.task_id.unwrap_or_default(),
                    agent: msg.agent.unwrap_or_default(),
                    prompt: msg.prompt.unwrap_or_default(),
                };
                tokio::spawn(run_task(task, Arc::clone(&self.handler), Arc::clone(encoder)));
            }
            MessageType::Error => {
                warn!(error = msg.error.as_deref().unwrap_or_default(), "Controller reported error");
            }
            other => debug!(kind = %other, "Ignoring message"),
        }
    }
}

/// Stable agent id so reconnects update the same record.
fn announce(node_id: &str, agent: &AgentConfig) -> WireMessage {
    let mut msg = WireMessage::agent_register(&agent.name)
        .with_agent_id(format!("{}-{}", node_id, agent.name));
    if !agent.description.is_empty() {
        msg.description = Some(agent.description.clone());
    }
    msg.model = agent.model.clone();
    if !agent.tools.is_empty() {
        msg.skills = Some(agent.tools.clone());
    }
    msg
}

async fn run_task<S>(task: TaskAssignment, handler: Arc<dyn TaskHandler>, encoder: SharedEncoder<S>)
where
    S: AsyncWrite + Send + 'static,
{
    debug!(task = %task.task_id, agent = %task.agent, "Running task");
    let running = WireMessage::task_result(&task.task_id, TaskStatus::Running);
    if let Err(e) = encoder.lock().await.encode(&running).await {
        warn!(task = %task.task_id, error = %e, "Failed to report task start");
        return;
    }

    let report = match handler.handle(&task).await {
        Ok(result) => WireMessage::task_result(&task.task_id, TaskStatus::Completed).with_result(result),
        Err(e) => {
            warn!(task = %task.task_id, error = %e, "Task failed");
            WireMessage::task_result(&task.task_id, TaskStatus::Failed).with_error(e.to_string())
        }
    };

    if let Err(e) = encoder.lock().await.encode(&report).await {
        warn!(task = %task.task_id, error = %e, "Failed to report task result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::types::{Message, Provider, ProviderResponse, ToolDefinition};
    use crate::wire::Decoder;

    struct UpperProvider;

    #[async_trait]
    impl Provider for UpperProvider {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _system_prompt: Option<&str>,
        ) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::text(messages[0].content.to_uppercase()))
        }

        fn name(&self) -> &str {
            "upper"
        }

        fn model(&self) -> &str {
            "upper-1"
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _task: &TaskAssignment) -> anyhow::Result<String> {
            anyhow::bail!("no capacity")
        }
    }

    fn handler() -> Arc<dyn TaskHandler> {
        Arc::new(AgentTaskHandler::new(
            vec![AgentConfig::new("coder", "Writes code")],
            Arc::new(UpperProvider),
        ))
    }

    async fn expect(decoder: &mut Decoder<tokio::io::ReadHalf<tokio::io::DuplexStream>>, kind: MessageType) -> WireMessage {
        let msg: WireMessage = decoder.decode().await.unwrap();
        assert_eq!(msg.kind, kind);
        msg
    }

    #[tokio::test]
    async fn test_agent_handler_runs_agent() {
        let task = TaskAssignment {
            task_id: "t1".to_string(),
            agent: "coder".to_string(),
            prompt: "fix it".to_string(),
        };
        assert_eq!(handler().handle(&task).await.unwrap(), "FIX IT");

        let unknown = TaskAssignment {
            agent: "ghost".to_string(),
            ..task
        };
        assert!(handler().handle(&unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_registration_and_task_flow() {
        let (node_side, controller_side) = tokio::io::duplex(64 * 1024);
        let config = NodeConfig {
            node_id: Some("n1".to_string()),
            token: Some("secret".to_string()),
            ..NodeConfig::new("worker-1", "unused")
        }
        .with_agents(vec![AgentConfig::new("coder", "Writes code")]);
        let client = NodeClient::new(config, handler());
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run_on(node_side, cancel).await }
        });

        let (mut decoder, mut encoder) = framed(controller_side);
        let register = expect(&mut decoder, MessageType::Register).await;
        assert_eq!(register.node_name.as_deref(), Some("worker-1"));
        assert_eq!(register.node_id.as_deref(), Some("n1"));
        assert_eq!(register.token.as_deref(), Some("secret"));

        encoder.encode(&WireMessage::register_ack("n1")).await.unwrap();
        let announced = expect(&mut decoder, MessageType::AgentRegister).await;
        assert_eq!(announced.agent_name.as_deref(), Some("coder"));
        assert_eq!(announced.agent_id.as_deref(), Some("n1-coder"));
        assert_eq!(announced.description.as_deref(), Some("Writes code"));

        encoder
            .encode(&WireMessage::task("t1", "coder", "ship it"))
            .await
            .unwrap();
        let running = expect(&mut decoder, MessageType::TaskResult).await;
        assert_eq!(running.status, Some(TaskStatus::Running));
        let done = expect(&mut decoder, MessageType::TaskResult).await;
        assert_eq!(done.status, Some(TaskStatus::Completed));
        assert_eq!(done.result.as_deref(), Some("SHIP IT"));

        drop(encoder);
        drop(decoder);
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_task_reports_error() {
        let (node_side, controller_side) = tokio::io::duplex(64 * 1024);
        let client = NodeClient::new(NodeConfig::new("w", "unused"), Arc::new(FailingHandler));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run_on(node_side, cancel).await }
        });

        let (mut decoder, mut encoder) = framed(controller_side);
        expect(&mut decoder, MessageType::Register).await;
        encoder.encode(&WireMessage::register_ack("n9")).await.unwrap();
        encoder.encode(&WireMessage::task("t9", "any", "hi")).await.unwrap();

        expect(&mut decoder, MessageType::TaskResult).await;
        let failed = expect(&mut decoder, MessageType::TaskResult).await;
        assert_eq!(failed.status, Some(TaskStatus::Failed));
        assert_eq!(failed.error.as_deref(), Some("no capacity"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_task_split_across_heartbeat_is_run() {
        use tokio::io::AsyncWriteExt;

        let (node_side, controller_side) = tokio::io::duplex(64 * 1024);
        let mut config = NodeConfig::new("w", "unused");
        config.heartbeat_interval = Duration::from_millis(50);
        let client = NodeClient::new(config, handler());
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run_on(node_side, cancel).await }
        });

        let (read_half, mut write_half) = tokio::io::split(controller_side);
        let mut decoder = Decoder::new(read_half);
        expect(&mut decoder, MessageType::Register).await;
        let mut ack = serde_json::to_vec(&WireMessage::register_ack("n1")).unwrap();
        ack.push(b'\n');
        write_half.write_all(&ack).await.unwrap();

        let mut line = serde_json::to_vec(&WireMessage::task("t1", "coder", "hello")).unwrap();
        line.push(b'\n');
        let (head, tail) = line.split_at(line.len() / 2);
        write_half.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        write_half.write_all(tail).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg: WireMessage = decoder.decode().await.unwrap();
                if msg.kind == MessageType::TaskResult && msg.status == Some(TaskStatus::Completed) {
                    return msg;
                }
            }
        })
        .await
        .expect("task result after split line");
        assert_eq!(done.task_id.as_deref(), Some("t1"));
        assert_eq!(done.result.as_deref(), Some("HELLO"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let (node_side, controller_side) = tokio::io::duplex(4096);
        let client = NodeClient::new(NodeConfig::new("w", "unused"), handler());
        let run = tokio::spawn(async move { client.run_on(node_side, CancellationToken::new()).await });

        let (mut decoder, mut encoder) = framed(controller_side);
        expect(&mut decoder, MessageType::Register).await;
        encoder.encode(&WireMessage::error("go away")).await.unwrap();

        match run.await.unwrap() {
            Err(NodeError::Rejected(reason)) => assert_eq!(reason, "go away"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_from_fleet_config() {
        let mut fleet = FleetConfig::default();
        fleet.node.controller = Some("10.0.0.1:7450".to_string());
        fleet.agents.push(AgentConfig::new("coder", ""));

        let config = NodeConfig::from(&fleet);
        assert_eq!(config.controller, "10.0.0.1:7450");
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }
}
