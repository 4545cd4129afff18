// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! agentfleet - a control plane for fleets of AI agents.
//!
//! Nodes host agents and register with a controller over a newline-delimited
//! JSON protocol; the controller persists nodes, agents and tasks through a
//! pluggable store and dispatches tasks to connected nodes. Interactive
//! messages are routed to agents by an orchestrator that understands
//! `@agent` addressing, keyword rules and AI classification.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Provider capability and message types
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Logging setup
//! - [`providers`] - Anthropic and OpenAI-protocol providers
//! - [`wire`] - Controller/node wire protocol codec
//! - [`store`] - State store contract and the file-backed store
//! - [`router`] - Message parsing and the routing decision procedure
//! - [`channel`] - Conversation channels (proxy, memory, terminal)
//! - [`agent`] - Agent definitions and single-turn execution
//! - [`orchestrator`] - Agent registry and the routing control loop
//! - [`controller`] - TCP controller: registration, dispatch, leadership
//! - [`node`] - Node client for the wire protocol
//!
//! # Example
//!
//! ```rust,ignore
//! use agentfleet::router::{parse_message, Router, RoutingConfig, RoutingTable};
//!
//! let parsed = parse_message("@coder fix the login bug");
//! let targets = router.route(&parsed, &table, &cancel).await?;
//! ```

pub mod agent;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod providers;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod wire;

// Re-export commonly used types at crate root
pub use error::{ConfigError, ProviderError, Result, RouteError, StoreError, TaskError};
pub use providers::{create_provider, AnthropicProvider, OpenAIProvider, ProviderType};
pub use types::{
    BoxedProvider, Message, ModelInfo, Provider, ProviderConfig, ProviderResponse, Role,
    SharedProvider, StopReason, StreamEvent, TokenUsage, ToolCall, ToolDefinition,
};

/// Crate version, reported by nodes at registration.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
