//! nodeplane
//!
//! Control plane for a fleet of proxy nodes: allocates listen ports, stores
//! validated protocol parameters, generates engine configs, keeps node agents in
//! sync with the user table and serves per-client subscriptions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod crypto;
mod db;
mod engine;
mod node;
mod port;
mod protocol;
mod subscribe;
mod sync;

use config::{load_config, Config, DEFAULT_CONFIG_PATH};
use db::{NewUser, Store};
use engine::GenerateOptions;
use node::{NodeService, NodeView};
use port::{OsProbe, PortAllocator};
use protocol::AdapterRegistry;
use subscribe::Format;
use sync::{AgentClient, NodeSyncService};

/// Proxy node control plane
#[derive(Parser)]
#[command(name = "nodeplane")]
#[command(about = "Port allocation, config generation and subscriptions for proxy nodes")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and node sync loops
    Run {
        /// Override API listen host
        #[arg(long)]
        host: Option<String>,

        /// Override API listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate configuration and exit
    CheckConfig,

    /// Port allocation commands
    Ports {
        #[command(subcommand)]
        action: Option<PortAction>,
    },

    /// Node commands
    Nodes {
        #[command(subcommand)]
        action: Option<NodeAction>,
    },

    /// User commands
    Users {
        #[command(subcommand)]
        action: UserAction,
    },

    /// List supported protocols and their parameters
    Protocols,

    /// Render a subscription for a user
    Render {
        /// User ID
        #[arg(short, long)]
        user: i64,

        /// Output format (singbox, clash, clash-meta, surge, surfboard, quantumultx, loon, base64)
        #[arg(short, long, default_value = "base64")]
        format: String,
    },

    /// Generate a Shadowsocks 2022 server key
    Keygen {
        /// Cipher method
        #[arg(short, long, default_value = "2022-blake3-aes-128-gcm")]
        method: String,
    },
}

#[derive(Subcommand)]
enum PortAction {
    /// List active allocations
    List,

    /// Show a single port
    Show {
        port: u16,
    },

    /// Show allocation history for a port
    History {
        port: u16,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show usage statistics
    Stats,

    /// Record ports already bound by other processes
    Scan,

    /// Delete released rows older than the given number of days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// List all nodes
    List,

    /// Show node details
    Show {
        id: i64,
    },

    /// Print the generated engine config for a node
    Config {
        id: i64,
    },

    /// Show config history for a node
    History {
        id: i64,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Query the node agent
    Status {
        id: i64,
    },

    /// Look up one user on the node agent
    User {
        id: i64,

        /// User UUID
        uuid: String,
    },

    /// Delete a node and release its ports
    Delete {
        id: i64,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user and print its subscription token
    Add {
        /// Group ID
        #[arg(short, long)]
        group: Option<i64>,

        /// Traffic quota in GiB, 0 for unlimited
        #[arg(short, long, default_value = "0")]
        quota_gb: i64,

        /// Days until expiry
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// List all users
    List,

    /// Show daily traffic for a user
    Stats {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = load_config(Some(&cli.config)).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::CheckConfig) => cmd_check_config(&config),
        Some(Commands::Ports { action }) => cmd_ports(&config, action).await,
        Some(Commands::Nodes { action }) => cmd_nodes(&config, action).await,
        Some(Commands::Users { action }) => cmd_users(&config, action).await,
        Some(Commands::Protocols) => cmd_protocols(),
        Some(Commands::Render { user, format }) => cmd_render(&config, user, &format).await,
        Some(Commands::Keygen { method }) => cmd_keygen(&method),
        Some(Commands::Run { host, port }) => cmd_run(&config, host, port).await,
        None => cmd_run(&config, None, None).await,
    }
}

/// Shared services built from the configuration.
struct Services {
    store: Arc<Store>,
    nodes: Arc<NodeService>,
    sync: Arc<NodeSyncService>,
}

async fn build_services(config: &Config) -> Result<Services> {
    let store = Store::new(&config.database.path)
        .await
        .context("Failed to open database")?;
    let store = Arc::new(store);

    let allocator = Arc::new(PortAllocator::new(
        config.ports.clone(),
        store.clone(),
        Arc::new(OsProbe::new()),
    ));
    allocator
        .restore()
        .await
        .context("Failed to restore port allocations")?;

    let nodes = Arc::new(NodeService::new(
        store.clone(),
        allocator,
        Arc::new(AdapterRegistry::with_defaults()),
        GenerateOptions::from(&config.generator),
    ));

    let agent = AgentClient::new(config.node.request_timeout())
        .context("Failed to build agent client")?;
    let sync = Arc::new(NodeSyncService::new(
        store.clone(),
        Arc::new(agent),
        config.node.clone(),
    ));

    Ok(Services { store, nodes, sync })
}

fn cmd_check_config(config: &Config) -> Result<()> {
    println!("Configuration is valid");

    println!("\nPorts:");
    println!("  Range: {}-{} ({} ports)", config.ports.start, config.ports.end, config.ports.size());
    println!("  Hold sockets: {}", config.ports.hold_sockets);
    println!("  Scan on startup: {}", config.ports.scan_on_startup);

    println!("\nAPI:");
    println!("  Listen: {}:{}", config.api.listen_host, config.api.listen_port);

    println!("\nDatabase:");
    println!("  Path: {}", config.database.path.display());

    println!("\nNode agents:");
    println!("  Pull interval: {}s", config.node.pull_interval_secs);
    println!("  Push interval: {}s", config.node.push_interval_secs);
    println!("  Default agent port: {}", config.node.agent_port);

    println!("\nGenerator:");
    println!("  Local port: {}", config.generator.local_port);
    println!("  Log level: {}", config.generator.log_level);

    Ok(())
}

async fn cmd_ports(config: &Config, action: Option<PortAction>) -> Result<()> {
    let services = build_services(config).await?;
    let allocator = services.nodes.allocator();

    match action {
        Some(PortAction::Show { port }) => match allocator.port_allocation(port).await {
            Some(a) => {
                println!("Port:       {}", a.port);
                println!("Node:       {}", a.node_id);
                println!("Purpose:    {}", a.purpose);
                println!("Status:     {}", a.status.as_str());
                println!("Allocated:  {}", a.allocated_at);
            }
            None => {
                eprintln!("Port not allocated: {}", port);
                std::process::exit(1);
            }
        },
        Some(PortAction::History { port, limit }) => {
            let history = services
                .store
                .port_history(port, limit)
                .await
                .context("Failed to load port history")?;
            if history.is_empty() {
                println!("No history for port {}", port);
                return Ok(());
            }
            println!("{:<8} {:<10} {:<10} {:<20} {}", "Node", "Purpose", "Status", "Allocated", "Released");
            println!("{}", "-".repeat(70));
            for a in history {
                println!(
                    "{:<8} {:<10} {:<10} {:<20} {}",
                    a.node_id,
                    a.purpose,
                    a.status.as_str(),
                    a.allocated_at.format("%Y-%m-%d %H:%M"),
                    a.released_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        Some(PortAction::Stats) => {
            let metrics = allocator.metrics().await;
            let usage = services
                .store
                .port_usage_stats()
                .await
                .context("Failed to get port stats")?;

            println!("Port Allocator Status");
            println!("{}", "=".repeat(40));
            println!("Range:             {}-{}", metrics.range_start, metrics.range_end);
            println!("Total Ports:       {}", metrics.total);
            println!("Allocated:         {}", metrics.allocated);
            println!("Available:         {}", metrics.available);
            println!("Released (rows):   {}", usage.released);
            println!("Nodes with ports:  {}", usage.nodes);
        }
        Some(PortAction::Scan) => {
            let recorded = allocator
                .scan_and_record_used_ports()
                .await
                .context("Failed to scan ports")?;
            println!("Recorded {} ports in use by other processes", recorded);
        }
        Some(PortAction::Cleanup { days }) => {
            let before = Utc::now() - ChronoDuration::days(days);
            let removed = services
                .store
                .cleanup_released_ports(before)
                .await
                .context("Failed to clean up port history")?;
            println!("Removed {} released port rows older than {} days", removed, days);
        }
        Some(PortAction::List) | None => {
            let allocations = allocator.allocations().await;
            if allocations.is_empty() {
                println!("No allocations found");
                return Ok(());
            }
            println!("{:<8} {:<8} {:<10} {}", "Port", "Node", "Purpose", "Allocated");
            println!("{}", "-".repeat(50));
            for a in allocations {
                println!(
                    "{:<8} {:<8} {:<10} {}",
                    a.port,
                    a.node_id,
                    a.purpose,
                    a.allocated_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }
    }

    Ok(())
}

async fn cmd_nodes(config: &Config, action: Option<NodeAction>) -> Result<()> {
    let services = build_services(config).await?;
    let nodes = &services.nodes;

    match action {
        Some(NodeAction::Show { id }) => {
            let node = nodes.get_node(id).await.context("Failed to get node")?;
            let view = NodeView::try_from(&node).context("Failed to serialize node")?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Some(NodeAction::Config { id }) => {
            let generated = nodes.node_config(id).await.context("Failed to generate config")?;
            for warning in &generated.validation.warnings {
                eprintln!("warning: {}", warning);
            }
            println!("{}", generated.config.to_json()?);
        }
        Some(NodeAction::History { id, limit }) => {
            let history = nodes
                .config_history(id, limit)
                .await
                .context("Failed to load history")?;
            if history.is_empty() {
                println!("No history for node {}", id);
                return Ok(());
            }
            println!("{:<6} {:<10} {:<8} {:<20} {}", "ID", "Action", "Success", "At", "Error");
            println!("{}", "-".repeat(70));
            for h in history {
                println!(
                    "{:<6} {:<10} {:<8} {:<20} {}",
                    h.id,
                    h.action.as_str(),
                    h.success,
                    h.created_at.format("%Y-%m-%d %H:%M"),
                    h.error.as_deref().unwrap_or(""),
                );
            }
        }
        Some(NodeAction::Status { id }) => {
            let node = nodes.get_node(id).await.context("Failed to get node")?;
            let status = services.sync.node_status(&node).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if !status.online {
                std::process::exit(1);
            }
        }
        Some(NodeAction::User { id, uuid }) => {
            let node = nodes.get_node(id).await.context("Failed to get node")?;
            let remote = services
                .sync
                .remote_user(&node, &uuid)
                .await
                .context("Failed to query node agent")?;
            match remote {
                Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
                None => {
                    eprintln!("User {} not present on node {}", uuid, id);
                    std::process::exit(1);
                }
            }
        }
        Some(NodeAction::Delete { id }) => {
            let released = nodes.delete_node(id).await.context("Failed to delete node")?;
            println!("Deleted node {} (released ports: {:?})", id, released);
        }
        Some(NodeAction::List) | None => {
            let list = nodes.list_nodes().await.context("Failed to list nodes")?;
            if list.is_empty() {
                println!("No nodes found");
                return Ok(());
            }
            println!("{:<5} {:<20} {:<12} {:<30} {:<7} {}", "ID", "Name", "Protocol", "Host", "Port", "Rate");
            println!("{}", "-".repeat(85));
            for n in list {
                println!(
                    "{:<5} {:<20} {:<12} {:<30} {:<7} {}",
                    n.id, n.name, n.protocol, n.host, n.port, n.rate,
                );
            }
        }
    }

    Ok(())
}

async fn cmd_users(config: &Config, action: UserAction) -> Result<()> {
    let store = Store::new(&config.database.path)
        .await
        .context("Failed to open database")?;

    match action {
        UserAction::Add { group, quota_gb, days } => {
            let new = NewUser {
                group_id: group,
                transfer_enable: quota_gb * 1024 * 1024 * 1024,
                expired_at: days.map(|d| Utc::now() + ChronoDuration::days(d)),
                ..Default::default()
            };
            let (token, user) = store.create_user(&new).await.context("Failed to create user")?;

            println!("User created successfully!");
            println!("  ID:     {}", user.id);
            println!("  UUID:   {}", user.uuid);
            println!("  Group:  {}", user.group_id.map(|g| g.to_string()).unwrap_or_else(|| "(none)".to_string()));
            println!();
            println!("  Subscription token: {}", token);
            println!();
            println!("Save this token securely - it cannot be retrieved later!");
        }
        UserAction::List => {
            let users = store.list_users().await.context("Failed to list users")?;
            if users.is_empty() {
                println!("No users found");
                return Ok(());
            }
            println!("{:<5} {:<38} {:<6} {:<14} {:<14} {:<7}", "ID", "UUID", "Group", "Used", "Quota", "Banned");
            println!("{}", "-".repeat(90));
            for u in users {
                println!(
                    "{:<5} {:<38} {:<6} {:<14} {:<14} {:<7}",
                    u.id,
                    u.uuid,
                    u.group_id.map(|g| g.to_string()).unwrap_or_else(|| "-".to_string()),
                    u.used_traffic(),
                    u.transfer_enable,
                    u.banned,
                );
            }
        }
        UserAction::Stats { id } => {
            let stats = store.user_daily_stats(id).await.context("Failed to load traffic")?;
            if stats.is_empty() {
                println!("No traffic recorded for user {}", id);
                return Ok(());
            }
            println!("{:<12} {:<6} {:<14} {}", "Day", "Rate", "Upload", "Download");
            println!("{}", "-".repeat(50));
            for s in stats {
                println!("{:<12} {:<6} {:<14} {}", s.record_at, s.server_rate, s.u, s.d);
            }
        }
    }

    Ok(())
}

fn cmd_protocols() -> Result<()> {
    let registry = AdapterRegistry::with_defaults();
    for name in registry.supported_protocols() {
        let Some(adapter) = registry.get(&name) else {
            continue;
        };
        println!("{}", name);
        println!("  required: {}", adapter.required_params().join(", "));
        println!("  optional: {}", adapter.optional_params().join(", "));
    }
    Ok(())
}

async fn cmd_render(config: &Config, user_id: i64, format: &str) -> Result<()> {
    let format: Format = format.parse()?;
    let store = Store::new(&config.database.path)
        .await
        .context("Failed to open database")?;

    let Some(user) = store.get_user(user_id).await.context("Failed to get user")? else {
        eprintln!("User not found: {}", user_id);
        std::process::exit(1);
    };

    let nodes = store.list_nodes().await.context("Failed to list nodes")?;
    let servers = subscribe::servers_for_user(&nodes, &user);
    let rendered = subscribe::render(
        format,
        &servers,
        &user,
        &GenerateOptions::from(&config.generator),
    )?;
    println!("{}", rendered.body);
    Ok(())
}

fn cmd_keygen(method: &str) -> Result<()> {
    match crypto::generate_server_key(method) {
        Some(key) => {
            println!("{}", key);
            Ok(())
        }
        None => anyhow::bail!("{} is not a Shadowsocks 2022 method", method),
    }
}

async fn cmd_run(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let services = build_services(config).await?;

    if config.ports.scan_on_startup {
        let recorded = services
            .nodes
            .allocator()
            .scan_and_record_used_ports()
            .await
            .context("Failed to scan ports")?;
        info!(recorded, "Startup port scan complete");
    }

    // Determine listen address
    let listen_host = host.unwrap_or_else(|| config.api.listen_host.clone());
    let listen_port = port.unwrap_or(config.api.listen_port);
    let listen_addr = format!("{}:{}", listen_host, listen_port);

    let app_state = api::AppState {
        config: config.clone(),
        store: services.store.clone(),
        nodes: services.nodes.clone(),
        sync: services.sync.clone(),
    };
    let app = api::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;
    info!(listen_addr = %listen_addr, "Starting nodeplane");

    let sync = services.sync.clone();
    let sync_task = tokio::spawn(async move { sync.run().await });

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    services.sync.stop();
    if let Err(e) = sync_task.await {
        error!(error = %e, "Sync task failed");
    }

    result.context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
