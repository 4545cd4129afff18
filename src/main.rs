// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! agentfleet entry point - controller, node, chat and inspection commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agentfleet::channel::TerminalChannel;
use agentfleet::config::{self, CliOptions, FleetConfig};
use agentfleet::controller::{Controller, ControllerConfig};
use agentfleet::node::{AgentTaskHandler, NodeClient, NodeConfig};
use agentfleet::orchestrator::Orchestrator;
use agentfleet::providers::create_provider_from_settings;
use agentfleet::router::{RoutingMode, CLASSIFY_MAX_TOKENS};
use agentfleet::store::{FileStore, LeaderElection, NodeStatus, Store, TaskStatus};
use agentfleet::telemetry::{init_telemetry, TelemetryConfig};
use agentfleet::types::SharedProvider;
use agentfleet::wire::{framed, MessageType, WireMessage};

/// agentfleet - control plane for fleets of AI agents.
#[derive(Parser)]
#[command(name = "agentfleet")]
#[command(author, version, about = "Control plane for fleets of AI agents", long_about = None)]
struct Cli {
    /// Store directory
    #[arg(long, global = true, env = "AGENTFLEET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Controller listen address (also the address `submit` and `node` dial)
    #[arg(long, global = true, env = "AGENTFLEET_LISTEN")]
    listen: Option<String>,

    /// Controller id used for leader election
    #[arg(long, global = true)]
    controller_id: Option<String>,

    /// Leader election mode
    #[arg(long, global = true, value_enum)]
    leader_election: Option<Election>,

    /// AI provider (anthropic, openai, ollama, openai-compatible)
    #[arg(short, long, global = true, env = "AGENTFLEET_PROVIDER")]
    provider: Option<String>,

    /// Model to use
    #[arg(short, long, global = true, env = "AGENTFLEET_MODEL")]
    model: Option<String>,

    /// Base URL for the provider API
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Show trace output (full payloads)
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Leader election modes.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Election {
    /// Single controller, always leader
    Always,
    /// File lease with TTL and fencing token
    Lease,
}

impl From<Election> for LeaderElection {
    fn from(election: Election) -> Self {
        match election {
            Election::Always => LeaderElection::AlwaysLeader,
            Election::Lease => LeaderElection::Lease,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller
    Serve,

    /// Run a node that hosts the configured agents
    Node {
        /// Node name (defaults to the host name)
        #[arg(long)]
        name: Option<String>,
        /// Node id to reuse across restarts
        #[arg(long)]
        id: Option<String>,
        /// Controller address
        #[arg(long)]
        controller: Option<String>,
        /// Registration token
        #[arg(long, env = "AGENTFLEET_TOKEN")]
        token: Option<String>,
    },

    /// Chat with the configured agents in the terminal
    Chat,

    /// List nodes
    Nodes {
        #[arg(long)]
        json: bool,
    },

    /// List agents
    Agents {
        /// Only agents on this node
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// List tasks
    Tasks {
        /// Only tasks for this agent id
        #[arg(long)]
        agent: Option<String>,
        /// Only pending tasks
        #[arg(long)]
        pending: bool,
        #[arg(long)]
        json: bool,
    },

    /// Submit a task to a running controller
    Submit {
        /// Agent id or name
        #[arg(short, long)]
        agent: String,
        /// Prompt text
        prompt: String,
    },

    /// Write a default agentfleet.json in the current directory
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&TelemetryConfig::from_flags(cli.debug, cli.trace))?;

    let root = std::env::current_dir()?;
    if let Commands::Init = cli.command {
        let path = config::init_config(&root, None)?;
        println!("Created config file: {}", path.display());
        return Ok(());
    }

    let cli_options = CliOptions {
        data_dir: cli.data_dir,
        listen: cli.listen,
        controller_id: cli.controller_id,
        leader_election: cli.leader_election.map(Into::into),
        provider: cli.provider,
        model: cli.model,
        base_url: cli.base_url,
    };
    let config = config::load_config(&root, cli_options)?;

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Node {
            name,
            id,
            controller,
            token,
        } => {
            let mut config = config;
            config.node.name = name.or(config.node.name);
            config.node.id = id.or(config.node.id);
            config.node.controller = controller.or(config.node.controller);
            config.node.token = token.or(config.node.token);
            run_node(&config).await
        }
        Commands::Chat => chat(&config).await,
        Commands::Nodes { json } => list_nodes(&config, json).await,
        Commands::Agents { node, json } => list_agents(&config, node.as_deref(), json).await,
        Commands::Tasks {
            agent,
            pending,
            json,
        } => list_tasks(&config, agent.as_deref(), pending, json).await,
        Commands::Submit { agent, prompt } => submit(&config, &agent, &prompt).await,
        Commands::Init => Ok(()),
    }
}

/// Cancel on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        trigger.cancel();
    });
    cancel
}

async fn open_store(config: &FleetConfig) -> anyhow::Result<FileStore> {
    FileStore::open(&config.data_dir, config.leader_election)
        .await
        .with_context(|| format!("opening store at {}", config.data_dir.display()))
}

fn provider(config: &FleetConfig) -> anyhow::Result<SharedProvider> {
    let provider = create_provider_from_settings(&config.provider)
        .with_context(|| format!("creating {} provider", config.provider.provider))?;
    Ok(Arc::from(provider))
}

async fn serve(config: &FleetConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let store: Arc<dyn Store> = Arc::new(store);
    let controller = Controller::new(ControllerConfig::from(config), Arc::clone(&store));

    let result = controller.run(shutdown_token()).await;
    store.close().await?;
    result?;
    Ok(())
}

async fn run_node(config: &FleetConfig) -> anyhow::Result<()> {
    if config.agents.is_empty() {
        warn!("No agents configured; the node will register without agents");
    }
    let handler = Arc::new(AgentTaskHandler::new(config.agents.clone(), provider(config)?));
    let client = NodeClient::new(NodeConfig::from(config), handler);
    client.run(shutdown_token()).await?;
    Ok(())
}

async fn chat(config: &FleetConfig) -> anyhow::Result<()> {
    let agent_provider = provider(config)?;

    let router_provider: Option<SharedProvider> = match config.routing.mode {
        RoutingMode::Ai | RoutingMode::Hybrid => {
            let mut settings = config.provider.clone();
            settings.max_tokens = Some(CLASSIFY_MAX_TOKENS);
            match create_provider_from_settings(&settings) {
                Ok(p) => Some(Arc::from(p)),
                Err(e) => {
                    warn!(error = %e, "AI routing unavailable");
                    None
                }
            }
        }
        RoutingMode::Disabled | RoutingMode::Rules => None,
    };

    let orchestrator = Orchestrator::new(
        config.routing.clone(),
        Arc::new(TerminalChannel::new()),
        agent_provider,
        router_provider,
    )?;
    for agent in &config.agents {
        orchestrator.register_agent(agent.clone()).await;
    }
    if config.agents.is_empty() {
        eprintln!("{}", "No agents configured; add some to agentfleet.json".yellow());
    }

    orchestrator.run(shutdown_token()).await?;
    Ok(())
}

async fn list_nodes(config: &FleetConfig, json: bool) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut nodes = store.list_nodes().await?;
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }
    if nodes.is_empty() {
        println!("{}", "No nodes registered".dimmed());
        return Ok(());
    }
    for node in nodes {
        let status = match node.status {
            NodeStatus::Ready => node.status.to_string().green(),
            NodeStatus::NotReady => node.status.to_string().yellow(),
            NodeStatus::Disconnected => node.status.to_string().red(),
        };
        println!(
            "{:<20} {:<38} {:<13} agents={} last_seen={}",
            node.name.bright_white(),
            node.id,
            status,
            node.agent_ids.len(),
            node.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn list_agents(config: &FleetConfig, node: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut agents = match node {
        Some(node_id) => store.list_agents_by_node(node_id).await?,
        None => store.list_agents().await?,
    };
    agents.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    if agents.is_empty() {
        println!("{}", "No agents registered".dimmed());
        return Ok(());
    }
    for agent in agents {
        println!(
            "{:<20} {:<38} node={} status={:?} {}",
            agent.name.bright_white(),
            agent.id,
            agent.node_id,
            agent.status,
            agent.description.dimmed()
        );
    }
    Ok(())
}

async fn list_tasks(
    config: &FleetConfig,
    agent: Option<&str>,
    pending: bool,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut tasks = match (agent, pending) {
        (_, true) => store.list_pending_tasks().await?,
        (Some(agent_id), false) => store.list_tasks_by_agent(agent_id).await?,
        (None, false) => store.list_tasks().await?,
    };
    if let (Some(agent_id), true) = (agent, pending) {
        tasks.retain(|t| t.agent_id == agent_id);
    }
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("{}", "No tasks".dimmed());
        return Ok(());
    }
    for task in tasks {
        let status = match task.status {
            TaskStatus::Completed => task.status.to_string().green(),
            TaskStatus::Failed => task.status.to_string().red(),
            TaskStatus::Running | TaskStatus::Dispatched => task.status.to_string().cyan(),
            TaskStatus::Pending => task.status.to_string().yellow(),
        };
        println!(
            "{:<38} {:<12} {:<16} {}",
            task.id,
            status,
            task.agent_name.bright_white(),
            task.prompt.lines().next().unwrap_or_default()
        );
        if !task.error.is_empty() {
            println!("    {} {}", "error:".red(), task.error);
        }
    }
    Ok(())
}

async fn submit(config: &FleetConfig, agent: &str, prompt: &str) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&config.listen)
        .await
        .with_context(|| format!("connecting to controller at {}", config.listen))?;
    let (mut decoder, mut encoder) = framed(stream);

    encoder.encode(&WireMessage::task("", agent, prompt)).await?;
    let reply: WireMessage = decoder.decode().await?;

    match reply.kind {
        MessageType::TaskResult => {
            println!(
                "{} {}",
                "Submitted task".green(),
                reply.task_id.unwrap_or_default()
            );
            Ok(())
        }
        MessageType::Error => anyhow::bail!(reply.error.unwrap_or_default()),
        other => anyhow::bail!("unexpected reply from controller: {}", other),
    }
}
