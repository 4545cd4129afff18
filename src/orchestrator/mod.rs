// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator - routes user messages to agents.
//!
//! # Architecture
//!
//! ```text
//!   channel.receive()
//!         │
//!         ▼
//!   parse_message ──► Router::route ──► (provider, AI step only)
//!         │
//!         ▼  one per resolved agent, in name order
//!   ProxyChannel(user msg) ──► Agent::run ──► channel.send(reply)
//! ```
//!
//! The agent registry and rule list sit behind one [`RwLock`]: routing
//! copies a snapshot under the read lock, registration and rule changes
//! take it exclusively.
//! Messages are handled one at a time inside the control loop; a slow agent
//! delays the next message. Failures become a single error-role reply and
//! the loop carries on until it is cancelled or the channel closes.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentConfig};
use crate::channel::{
    Channel, ChannelError, ChannelMessage, ChannelRole, ProxyChannel, SharedChannel,
};
use crate::error::RouteError;
use crate::router::{parse_message, ParsedMessage, Router, RoutingConfig, RoutingRule, RoutingTable};
use crate::types::SharedProvider;

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),
}

/// Owns the agent registry and drives routing and agent execution.
pub struct Orchestrator {
    table: RwLock<RoutingTable>,
    router: Router,
    provider: SharedProvider,
    channel: SharedChannel,
}

impl Orchestrator {
    /// Create an orchestrator replying on `channel`.
    ///
    /// `provider` runs agent turns; `router_provider`, when given, is used
    /// for AI classification. Rules from `config` are installed in order and
    /// an invalid pattern fails construction.
    pub fn new(
        config: RoutingConfig,
        channel: SharedChannel,
        provider: SharedProvider,
        router_provider: Option<SharedProvider>,
    ) -> Result<Self, OrchestratorError> {
        let mut table = RoutingTable::new();
        for rule in &config.rules {
            table.add_rule(rule.clone())?;
        }

        Ok(Self {
            table: RwLock::new(table),
            router: Router::new(config, router_provider),
            provider,
            channel,
        })
    }

    /// Add or replace an agent by name.
    pub async fn register_agent(&self, config: AgentConfig) {
        info!(agent = %config.name, "Registered agent");
        self.table.write().await.register_agent(config);
    }

    /// Remove an agent and the rules that target it. Unknown names are ignored.
    pub async fn unregister_agent(&self, name: &str) {
        if self.table.write().await.unregister_agent(name) {
            info!(agent = name, "Unregistered agent");
        }
    }

    /// Append a routing rule.
    pub async fn add_rule(&self, rule: RoutingRule) -> Result<(), RouteError> {
        debug!(pattern = %rule.pattern, agent = %rule.agent, "Added routing rule");
        self.table.write().await.add_rule(rule)
    }

    /// Registered agents in name order.
    pub async fn agents(&self) -> Vec<AgentConfig> {
        self.table.read().await.agents().cloned().collect()
    }

    /// Rules in evaluation order.
    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.table.read().await.rules()
    }

    /// Resolve target agents for a parsed message.
    pub async fn route(
        &self,
        parsed: &ParsedMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RouteError> {
        // Snapshot so registry writes are not blocked behind the classifier call.
        let table = self.table.read().await.clone();
        self.router.route(parsed, &table, cancel).await
    }

    /// Run the control loop until `cancel` fires or the channel closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        self.channel.start().await?;
        info!(channel = self.channel.name(), mode = %self.router.config().mode, "Orchestrator started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Orchestrator cancelled");
                    return Ok(());
                }
                msg = self.channel.receive() => msg,
            };

            let Some(msg) = next else {
                info!(channel = self.channel.name(), "Channel closed, orchestrator stopping");
                return Ok(());
            };

            if msg.role != ChannelRole::User {
                continue;
            }

            self.handle_message(&msg, &cancel).await;
        }
    }

    /// Route and answer one user message.
    pub async fn handle_message(&self, msg: &ChannelMessage, cancel: &CancellationToken) {
        let parsed = parse_message(&msg.content);

        let targets = match self.route(&parsed, cancel).await {
            Ok(targets) => targets,
            Err(e) => {
                debug!(error = %e, "Routing failed");
                self.reply_error(e.to_string()).await;
                return;
            }
        };

        if targets.is_empty() {
            warn!("Broadcast with no registered agents");
            return;
        }

        let mut targets = targets;
        targets.sort();
        for name in targets {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                outcome = self.run_agent(&name, &parsed.content) => outcome,
            };
            if let Err(e) = outcome {
                warn!(agent = %name, error = %e, "Agent execution failed");
                self.reply_error(format!("{}: {}", name, e)).await;
            }
        }
    }

    /// Run one turn of `name` on `content`, replying on the shared channel.
    pub async fn run_agent(&self, name: &str, content: &str) -> anyhow::Result<()> {
        let config = self
            .table
            .read()
            .await
            .agent(name)
            .cloned()
            .ok_or_else(|| RouteError::AgentNotFound(name.to_string()))?;

        let proxy = ProxyChannel::new(name, ChannelMessage::user(content), self.channel.clone());
        let agent = Agent::new(config, Arc::clone(&self.provider));

        let result = agent.run(&proxy).await;
        proxy.stop().await?;
        result
    }

    async fn reply_error(&self, message: String) {
        if let Err(e) = self.channel.send(ChannelMessage::error(message)).await {
            warn!(error = %e, "Failed to deliver error reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, MemoryHandle};
    use crate::error::ProviderError;
    use crate::router::RoutingMode;
    use crate::types::{Message, Provider, ProviderResponse, ToolDefinition};
    use async_trait::async_trait;

    /// Echoes the system prompt's first word and the message.
    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            system_prompt: Option<&str>,
        ) -> Result<ProviderResponse, ProviderError> {
            let content = &messages[0].content;
            if content.contains("explode") {
                return Err(ProviderError::api("kaboom", 500));
            }
            Ok(ProviderResponse::text(format!(
                "{}|{}",
                system_prompt.unwrap_or_default(),
                content
            )))
        }

        fn name(&self) -> &str {
            "echo"
        }

        fn model(&self) -> &str {
            "echo-1"
        }
    }

    fn orchestrator(config: RoutingConfig) -> (Orchestrator, MemoryHandle) {
        let (channel, handle) = MemoryChannel::new("test");
        let orch = Orchestrator::new(config, Arc::new(channel), Arc::new(EchoProvider), None).unwrap();
        (orch, handle)
    }

    fn agent(name: &str) -> AgentConfig {
        AgentConfig::new(name, "").with_system_prompt(name)
    }

    #[tokio::test]
    async fn test_register_twice_keeps_latest() {
        let (orch, _h) = orchestrator(RoutingConfig::default());
        orch.register_agent(AgentConfig::new("coder", "first")).await;
        let second = AgentConfig::new("coder", "second").with_model("m2");
        orch.register_agent(second.clone()).await;

        assert_eq!(orch.agents().await, vec![second]);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let (orch, _h) = orchestrator(RoutingConfig::default());
        orch.register_agent(agent("coder")).await;
        orch.unregister_agent("ghost").await;
        assert_eq!(orch.agents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_prunes_rules() {
        let (orch, _h) = orchestrator(RoutingConfig::default());
        orch.register_agent(agent("coder")).await;
        orch.add_rule(RoutingRule::new("bug", "coder")).await.unwrap();
        orch.add_rule(RoutingRule::new("docs", "writer")).await.unwrap();

        orch.unregister_agent("coder").await;
        assert!(orch.rules().await.iter().all(|r| r.agent != "coder"));
        assert_eq!(orch.rules().await.len(), 1);
    }

    /// Classifier that answers only once released.
    struct GatedClassifier(Arc<tokio::sync::Notify>);

    #[async_trait]
    impl Provider for GatedClassifier {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _system_prompt: Option<&str>,
        ) -> Result<ProviderResponse, ProviderError> {
            self.0.notified().await;
            Ok(ProviderResponse::text("coder"))
        }

        fn name(&self) -> &str {
            "gated"
        }

        fn model(&self) -> &str {
            "gated-1"
        }
    }

    #[tokio::test]
    async fn test_registration_not_blocked_by_classification() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (channel, _h) = MemoryChannel::new("test");
        let config = RoutingConfig {
            mode: RoutingMode::Ai,
            ..Default::default()
        };
        let orch = Arc::new(
            Orchestrator::new(
                config,
                Arc::new(channel),
                Arc::new(EchoProvider),
                Some(Arc::new(GatedClassifier(Arc::clone(&gate)))),
            )
            .unwrap(),
        );
        orch.register_agent(agent("coder")).await;

        let routing = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move {
                orch.route(&parse_message("anything"), &CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            orch.register_agent(agent("writer")),
        )
        .await
        .expect("register_agent waited on classification");
        orch.add_rule(RoutingRule::new("docs", "writer")).await.unwrap();

        gate.notify_one();
        assert_eq!(routing.await.unwrap().unwrap(), vec!["coder"]);
        assert_eq!(orch.agents().await.len(), 2);
    }

    #[test]
    fn test_invalid_configured_rule_fails_construction() {
        let (channel, _h) = MemoryChannel::new("test");
        let config = RoutingConfig {
            rules: vec![RoutingRule::new("[", "coder")],
            ..Default::default()
        };
        let result = Orchestrator::new(config, Arc::new(channel), Arc::new(EchoProvider), None);
        assert!(matches!(result, Err(OrchestratorError::Route(_))));
    }

    #[tokio::test]
    async fn test_handle_message_routes_and_replies() {
        let (orch, mut handle) = orchestrator(RoutingConfig::default());
        orch.register_agent(agent("coder")).await;

        orch.handle_message(&ChannelMessage::user("@coder fix it"), &CancellationToken::new())
            .await;

        let reply = handle.recv().await.unwrap();
        assert_eq!(reply.role, ChannelRole::Assistant);
        assert_eq!(reply.agent.as_deref(), Some("coder"));
        assert_eq!(reply.content, "coder|fix it");
    }

    #[tokio::test]
    async fn test_routing_failure_becomes_one_error_reply() {
        let (orch, mut handle) = orchestrator(RoutingConfig::default());
        orch.handle_message(&ChannelMessage::user("@ghost hi"), &CancellationToken::new())
            .await;

        let reply = handle.recv().await.unwrap();
        assert_eq!(reply.role, ChannelRole::Error);
        assert_eq!(reply.content, "agent not found: ghost");
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_agent_failure_becomes_error_reply() {
        let (orch, mut handle) = orchestrator(RoutingConfig::default());
        orch.register_agent(agent("coder")).await;
        orch.handle_message(&ChannelMessage::user("@coder explode"), &CancellationToken::new())
            .await;

        let reply = handle.recv().await.unwrap();
        assert_eq!(reply.role, ChannelRole::Error);
        assert!(reply.content.starts_with("coder: "));
        assert!(reply.content.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_rule_target_unregistered_reports_error() {
        let config = RoutingConfig {
            mode: RoutingMode::Rules,
            rules: vec![RoutingRule::new("docs", "scribe")],
            ..Default::default()
        };
        let (orch, mut handle) = orchestrator(config);
        orch.handle_message(&ChannelMessage::user("write docs"), &CancellationToken::new())
            .await;

        let reply = handle.recv().await.unwrap();
        assert_eq!(reply.role, ChannelRole::Error);
        assert!(reply.content.contains("scribe"));
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_in_name_order() {
        let (orch, mut handle) = orchestrator(RoutingConfig::default());
        for name in ["writer", "coder", "tester"] {
            orch.register_agent(agent(name)).await;
        }

        orch.handle_message(&ChannelMessage::user("@all report"), &CancellationToken::new())
            .await;

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(handle.recv().await.unwrap().agent.unwrap());
        }
        assert_eq!(order, vec!["coder", "tester", "writer"]);
    }

    #[tokio::test]
    async fn test_empty_broadcast_sends_nothing() {
        let (orch, mut handle) = orchestrator(RoutingConfig::default());
        orch.handle_message(&ChannelMessage::user("@all hello"), &CancellationToken::new())
            .await;
        assert!(handle.try_recv().is_none());
    }
}
