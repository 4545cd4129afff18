// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message channels between users and agents.
//!
//! A [`Channel`] carries [`ChannelMessage`]s in both directions: `receive`
//! yields inbound messages until the channel closes, `send` emits replies.
//!
//! - [`ProxyChannel`] - one-shot input for a single agent execution, with
//!   replies forwarded to a shared output channel
//! - [`MemoryChannel`] - in-process duplex, driven through a [`MemoryHandle`]
//! - [`TerminalChannel`] - stdin/stdout

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Who a channel message is from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    User,
    Assistant,
    Error,
    System,
}

/// A message travelling over a [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    pub role: ChannelRole,
    pub content: String,
    /// Agent that produced the message, for assistant replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChannelMessage {
    fn with_role(role: ChannelRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            agent: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ChannelRole::User, content)
    }

    /// Create an assistant reply from `agent`.
    pub fn assistant(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            ..Self::with_role(ChannelRole::Assistant, content)
        }
    }

    /// Create an error message.
    pub fn error(content: impl Into<String>) -> Self {
        Self::with_role(ChannelRole::Error, content)
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(ChannelRole::System, content)
    }
}

/// Channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed: {0}")]
    Closed(String),

    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bidirectional message transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &str;

    /// Prepare the channel for use.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Emit a message.
    async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError>;

    /// Next inbound message, or `None` once the channel is closed.
    async fn receive(&self) -> Option<ChannelMessage>;

    /// Close the channel. Pending and future `receive` calls return `None`.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Resolves once the channel has been stopped.
    async fn done(&self);
}

/// Shared channel handle.
pub type SharedChannel = Arc<dyn Channel>;

// ============================================================================
// Proxy channel
// ============================================================================

/// Input side of a single agent execution.
///
/// Pre-loaded with exactly one message; after it is read the input is
/// closed. Replies go to the wrapped output channel.
pub struct ProxyChannel {
    name: String,
    input: Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    output: SharedChannel,
    stopped: CancellationToken,
}

impl ProxyChannel {
    /// Create a proxy carrying `message`, replying onto `output`.
    pub fn new(name: impl Into<String>, message: ChannelMessage, output: SharedChannel) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail; the sender is dropped
        // right after, which closes the input once the message is read.
        let _ = tx.send(message);
        Self {
            name: name.into(),
            input: Mutex::new(rx),
            output,
            stopped: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Channel for ProxyChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        self.output.send(msg).await
    }

    async fn receive(&self) -> Option<ChannelMessage> {
        if self.stopped.is_cancelled() {
            return None;
        }
        self.input.lock().await.recv().await
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.stopped.cancel();
        self.input.lock().await.close();
        Ok(())
    }

    async fn done(&self) {
        self.stopped.cancelled().await
    }
}

// ============================================================================
// Memory channel
// ============================================================================

/// In-process channel. The paired [`MemoryHandle`] plays the user.
pub struct MemoryChannel {
    name: String,
    inbound: Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    stopped: CancellationToken,
}

/// The far end of a [`MemoryChannel`].
pub struct MemoryHandle {
    inbound: mpsc::UnboundedSender<ChannelMessage>,
    outbound: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl MemoryChannel {
    /// Create a channel and its handle.
    pub fn new(name: impl Into<String>) -> (Self, MemoryHandle) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let channel = Self {
            name: name.into(),
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            stopped: CancellationToken::new(),
        };
        let handle = MemoryHandle {
            inbound: in_tx,
            outbound: out_rx,
        };
        (channel, handle)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        if self.stopped.is_cancelled() {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        self.outbound
            .send(msg)
            .map_err(|_| ChannelError::Closed(self.name.clone()))
    }

    async fn receive(&self) -> Option<ChannelMessage> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.stopped.cancelled() => None,
            msg = inbound.recv() => msg,
        }
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.stopped.cancel();
        Ok(())
    }

    async fn done(&self) {
        self.stopped.cancelled().await
    }
}

impl MemoryHandle {
    /// Deliver a message to the channel's `receive` side.
    pub fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        self.inbound
            .send(msg)
            .map_err(|_| ChannelError::Closed("memory handle".to_string()))
    }

    /// Shorthand for sending a user message.
    pub fn say(&self, content: impl Into<String>) -> Result<(), ChannelError> {
        self.send(ChannelMessage::user(content))
    }

    /// Next message the channel emitted.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.outbound.recv().await
    }

    /// Next emitted message if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        self.outbound.try_recv().ok()
    }
}

// ============================================================================
// Terminal channel
// ============================================================================

/// Reads user lines from stdin and prints replies to stdout.
pub struct TerminalChannel {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    stopped: CancellationToken,
}

impl TerminalChannel {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            stopped: CancellationToken::new(),
        }
    }

    fn render(msg: &ChannelMessage) -> String {
        match msg.role {
            ChannelRole::Assistant => {
                let who = msg.agent.as_deref().unwrap_or("assistant");
                format!("{} {}", format!("[{}]", who).cyan().bold(), msg.content)
            }
            ChannelRole::Error => format!("{} {}", "error:".red().bold(), msg.content),
            ChannelRole::System => msg.content.dimmed().to_string(),
            ChannelRole::User => msg.content.clone(),
        }
    }
}

impl Default for TerminalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        let banner = format!(
            "{} (address an agent with @name, everyone with @all; Ctrl-D to quit)\n",
            "agentfleet chat".bold()
        );
        let mut stdout = tokio::io::stdout();
        stdout.write_all(banner.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        let mut line = Self::render(&msg);
        line.push('\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Option<ChannelMessage> {
        let mut lines = self.lines.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.stopped.cancelled() => return None,
                line = lines.next_line() => line,
            };
            match next {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(ChannelMessage::user(line)),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.stopped.cancel();
        Ok(())
    }

    async fn done(&self) {
        self.stopped.cancelled().await
    }
}
