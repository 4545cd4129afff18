// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end tests for the orchestrator control loop over a memory channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use agentfleet::agent::AgentConfig;
use agentfleet::channel::{ChannelMessage, ChannelRole, MemoryChannel, MemoryHandle};
use agentfleet::orchestrator::Orchestrator;
use agentfleet::router::{RoutingConfig, RoutingMode, RoutingRule};
use agentfleet::{Message, Provider, ProviderError, ProviderResponse, ToolDefinition};

/// Replies with `<system prompt>: <user content>`.
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
        if content.contains("fail") {
            return Err(ProviderError::api("upstream unavailable", 503));
        }
        Ok(ProviderResponse::text(format!(
            "{}: {}",
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

/// Classifier that always answers with the same agent name.
struct FixedClassifier(&'static str);

#[async_trait]
impl Provider for FixedClassifier {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse::text(self.0))
    }

    fn name(&self) -> &str {
        "fixed"
    }

    fn model(&self) -> &str {
        "fixed-1"
    }
}

struct Harness {
    orch: Arc<Orchestrator>,
    handle: MemoryHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(config: RoutingConfig, classifier: Option<Arc<dyn Provider>>) -> Self {
        let (channel, handle) = MemoryChannel::new("test");
        let orch = Arc::new(
            Orchestrator::new(config, Arc::new(channel), Arc::new(EchoProvider), classifier)
                .unwrap(),
        );
        for name in ["coder", "reviewer", "writer"] {
            orch.register_agent(AgentConfig::new(name, "").with_system_prompt(name))
                .await;
        }

        let cancel = CancellationToken::new();
        let task = {
            let orch = Arc::clone(&orch);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orch.run(cancel).await.unwrap();
            })
        };

        Self {
            orch,
            handle,
            cancel,
            task,
        }
    }

    async fn reply(&mut self) -> ChannelMessage {
        timeout(Duration::from_secs(5), self.handle.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("channel closed")
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("orchestrator did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_manual_addressing_reaches_named_agent() {
    let mut h = Harness::start(RoutingConfig::default(), None).await;

    h.handle.say("@Reviewer check the diff").unwrap();
    let reply = h.reply().await;

    assert_eq!(reply.role, ChannelRole::Assistant);
    assert_eq!(reply.agent.as_deref(), Some("reviewer"));
    assert_eq!(reply.content, "reviewer: check the diff");
    h.shutdown().await;
}

#[tokio::test]
async fn test_unknown_agent_gets_error_reply() {
    let mut h = Harness::start(RoutingConfig::default(), None).await;

    h.handle.say("@ghost hello").unwrap();
    let reply = h.reply().await;

    assert_eq!(reply.role, ChannelRole::Error);
    assert!(reply.content.contains("agent not found: ghost"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_replies_from_every_agent_in_name_order() {
    let mut h = Harness::start(RoutingConfig::default(), None).await;

    h.handle.say("@all status report").unwrap();
    let mut agents = Vec::new();
    for _ in 0..3 {
        let reply = h.reply().await;
        assert_eq!(reply.role, ChannelRole::Assistant);
        agents.push(reply.agent.unwrap());
    }

    assert_eq!(agents, vec!["coder", "reviewer", "writer"]);
    h.shutdown().await;
}

#[tokio::test]
async fn test_rules_then_default() {
    let config = RoutingConfig {
        mode: RoutingMode::Rules,
        default_agent: Some("writer".to_string()),
        rules: vec![RoutingRule::new(r"\b(bug|fix)\b", "coder")],
        ..Default::default()
    };
    let mut h = Harness::start(config, None).await;

    h.handle.say("Please FIX the parser").unwrap();
    assert_eq!(h.reply().await.agent.as_deref(), Some("coder"));

    h.handle.say("draft release notes").unwrap();
    assert_eq!(h.reply().await.agent.as_deref(), Some("writer"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_ai_classification_routes_to_chosen_agent() {
    let config = RoutingConfig {
        mode: RoutingMode::Ai,
        ..Default::default()
    };
    let mut h = Harness::start(config, Some(Arc::new(FixedClassifier("Reviewer\n")))).await;

    h.handle.say("is this change safe?").unwrap();
    let reply = h.reply().await;

    assert_eq!(reply.agent.as_deref(), Some("reviewer"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_unroutable_message_gets_error_reply() {
    let config = RoutingConfig {
        mode: RoutingMode::Rules,
        ..Default::default()
    };
    let mut h = Harness::start(config, None).await;

    h.handle.say("nothing matches this").unwrap();
    let reply = h.reply().await;

    assert_eq!(reply.role, ChannelRole::Error);
    assert_eq!(reply.content, "could not route message");
    h.shutdown().await;
}

#[tokio::test]
async fn test_provider_failure_is_reported_and_loop_continues() {
    let mut h = Harness::start(RoutingConfig::default(), None).await;

    h.handle.say("@coder fail please").unwrap();
    let reply = h.reply().await;
    assert_eq!(reply.role, ChannelRole::Error);
    assert!(reply.content.starts_with("coder: "));

    h.handle.say("@coder try again").unwrap();
    let reply = h.reply().await;
    assert_eq!(reply.role, ChannelRole::Assistant);
    assert_eq!(reply.content, "coder: try again");
    h.shutdown().await;
}

#[tokio::test]
async fn test_non_user_messages_are_ignored() {
    let mut h = Harness::start(RoutingConfig::default(), None).await;

    h.handle
        .send(ChannelMessage::system("@coder should be skipped"))
        .unwrap();
    h.handle.say("@writer hello").unwrap();

    let reply = h.reply().await;
    assert_eq!(reply.agent.as_deref(), Some("writer"));
    assert!(h.handle.try_recv().is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn test_unregister_removes_agent_from_broadcast() {
    let mut h = Harness::start(RoutingConfig::default(), None).await;
    h.orch.unregister_agent("reviewer").await;

    h.handle.say("@all ping").unwrap();
    let first = h.reply().await;
    let second = h.reply().await;

    assert_eq!(first.agent.as_deref(), Some("coder"));
    assert_eq!(second.agent.as_deref(), Some("writer"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_run_ends_when_handle_dropped() {
    let (channel, handle) = MemoryChannel::new("closing");
    let orch =
        Orchestrator::new(RoutingConfig::default(), Arc::new(channel), Arc::new(EchoProvider), None)
            .unwrap();

    drop(handle);
    let result = timeout(Duration::from_secs(5), orch.run(CancellationToken::new())).await;

    assert!(matches!(result, Ok(Ok(()))));
}
