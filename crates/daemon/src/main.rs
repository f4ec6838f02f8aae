//! netplane Daemon
//!
//! Provisions this node's network identity and keeps the WireGuard mesh,
//! container bridge and firewall overlay converged.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use netplane_common::{
    generate_keypair, store, BridgeSettings, CoordinatorLink, Database, NodeNetworkConfig,
    NodeRole, WireguardSettings,
};
use netplane_daemon::{
    DaemonConfig, DriftDetector, KernelHandles, NetworkReconciler, StoreLock, TeardownReport,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "netplaned")]
#[command(about = "netplane daemon - WireGuard mesh, container bridge and firewall agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "NETPLANE_CONFIG", default_value = "/etc/netplane/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store this node's network configuration (first run only)
    Setup(SetupArgs),
    /// Bring up the network plane and keep it converged
    Start,
    /// Ensure the container bridge network and its firewall rules.
    ///
    /// Refused while another netplaned process (such as `start`) holds the
    /// store lock.
    SyncBridge,
    /// Print the stored node configuration
    ShowConfig,
    /// Compare stored intent with live kernel state
    Drift,
    /// Remove the network plane from this host; stored intent is kept
    Cleanup {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Coordinator,
    Worker,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Coordinator => NodeRole::Coordinator,
            RoleArg::Worker => NodeRole::Worker,
        }
    }
}

#[derive(Args)]
struct SetupArgs {
    /// Node role in the mesh
    #[arg(long, value_enum)]
    role: RoleArg,

    /// WireGuard private key (base64); a new key pair is generated if omitted
    #[arg(long, env = "NETPLANE_WG_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Mesh interface address with prefix, e.g. 10.10.0.1/24
    #[arg(long)]
    address: String,

    #[arg(long, default_value_t = 51820)]
    listen_port: u16,

    #[arg(long, default_value_t = 1420)]
    mtu: u32,

    /// Container bridge subnet, e.g. 10.0.1.0/24
    #[arg(long)]
    bridge_subnet: String,

    /// Container bridge gateway, e.g. 10.0.1.1
    #[arg(long)]
    bridge_gateway: String,

    /// Coordinator public key (workers)
    #[arg(long, required_if_eq("role", "worker"))]
    coordinator_public_key: Option<String>,

    /// Coordinator endpoint IP (workers)
    #[arg(long, required_if_eq("role", "worker"))]
    coordinator_endpoint: Option<String>,

    /// Comma separated CIDRs routed to the coordinator (workers)
    #[arg(long, required_if_eq("role", "worker"))]
    coordinator_allowed_ips: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let mut config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    tokio::fs::create_dir_all(&config.store_path).await?;

    // Mutating commands exclude each other across processes
    let _lock = match cli.command {
        Command::Setup(_) | Command::Start | Command::SyncBridge | Command::Cleanup { .. } => {
            Some(StoreLock::acquire(&config.store_path)?)
        }
        Command::ShowConfig | Command::Drift => None,
    };

    match cli.command {
        Command::Setup(args) => setup(&config, args),
        Command::Start => start(config).await,
        Command::SyncBridge => {
            let reconciler = open_reconciler(&config)?;
            let bridge = tokio::task::spawn_blocking(move || reconciler.sync_bridge()).await??;
            println!("{}", bridge);
            Ok(())
        }
        Command::ShowConfig => show_config(&config),
        Command::Drift => drift(config).await,
        Command::Cleanup { yes } => cleanup(config, yes).await,
    }
}

fn open_reconciler(config: &DaemonConfig) -> anyhow::Result<NetworkReconciler> {
    let db = Database::open(config.db_path())?;
    let kernel = KernelHandles::system(config)?;
    Ok(NetworkReconciler::new(config.clone(), db, kernel))
}

fn setup(config: &DaemonConfig, args: SetupArgs) -> anyhow::Result<()> {
    let private_key = match args.private_key {
        Some(key) => key,
        None => {
            let pair = generate_keypair();
            info!("Generated WireGuard key pair");
            pair.private_key
        }
    };

    let role = NodeRole::from(args.role);
    let coordinator = match role {
        NodeRole::Coordinator => None,
        NodeRole::Worker => Some(CoordinatorLink {
            public_key: args.coordinator_public_key.unwrap_or_default(),
            endpoint: args.coordinator_endpoint.unwrap_or_default(),
            allowed_ips: args.coordinator_allowed_ips.unwrap_or_default(),
        }),
    };

    let node = NodeNetworkConfig {
        role,
        wireguard: WireguardSettings {
            private_key,
            address: args.address,
            listen_port: args.listen_port,
            mtu: args.mtu,
        },
        bridge: BridgeSettings {
            subnet: args.bridge_subnet,
            gateway: args.bridge_gateway,
            bridge_id: None,
            mesh_interface: None,
        },
        coordinator,
    };
    node.validate()?;

    let db = Database::open(config.db_path())?;
    db.write(|conn| store::node::insert(conn, &node))?;

    info!("Stored {} configuration in {:?}", node.role, db.path());
    println!("public key: {}", node.public_key()?);
    Ok(())
}

fn show_config(config: &DaemonConfig) -> anyhow::Result<()> {
    let db = Database::open(config.db_path())?;
    let node = db.read(store::node::require)?;
    let public_key = node.public_key()?;

    let mut shown = node;
    shown.wireguard.private_key = "(hidden)".to_string();
    let output = serde_json::json!({
        "public_key": public_key,
        "node": shown,
        "wireguard_interface": config.network.wireguard_interface,
        "container_network": config.network.container_network,
        "chain_prefix": config.network.chain_prefix,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn start(config: DaemonConfig) -> anyhow::Result<()> {
    info!("netplane daemon v{}", netplane_common::VERSION);

    let reconciler = Arc::new(open_reconciler(&config)?);

    let booting = reconciler.clone();
    let report = tokio::task::spawn_blocking(move || booting.boot())
        .await?
        .context("network plane boot failed")?;
    if let Some(e) = &report.bridge_error {
        warn!("Running without bridge network: {}", e);
    }
    if let Some(e) = &report.mesh_error {
        warn!("Running without WireGuard mesh: {}", e);
    }

    let resync = tokio::spawn(reconciler.clone().run());

    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }

    resync.abort();
    if let Err(e) = resync.await {
        if !e.is_cancelled() {
            error!("Resync task error: {}", e);
        }
    }

    // Kernel state is left in place; the next boot converges from it.
    info!("Daemon shutdown complete");
    Ok(())
}

async fn drift(config: DaemonConfig) -> anyhow::Result<()> {
    let reconciler = Arc::new(open_reconciler(&config)?);
    let detector = DriftDetector::new(reconciler);
    let reports = tokio::task::spawn_blocking(move || detector.detect_all()).await??;

    if reports.is_empty() {
        println!("No drift detected");
        return Ok(());
    }
    for report in &reports {
        println!(
            "{:<10} {:<20} {:<40} {}",
            report.drift_type, report.resource_type, report.resource_id, report.message
        );
    }
    anyhow::bail!("{} drift item(s) found", reports.len())
}

async fn cleanup(config: DaemonConfig, yes: bool) -> anyhow::Result<()> {
    if !yes && !confirm(&config)? {
        println!("Aborted");
        return Ok(());
    }

    let reconciler = open_reconciler(&config)?;
    let report = tokio::task::spawn_blocking(move || reconciler.teardown()).await??;
    print_teardown(&report);

    if !report.is_complete() {
        anyhow::bail!("cleanup left {} item(s) behind", report.errors.len());
    }
    Ok(())
}

fn confirm(config: &DaemonConfig) -> anyhow::Result<bool> {
    println!("This removes from this host:");
    println!("  - WireGuard interface {}", config.network.wireguard_interface);
    println!("  - container network {}", config.network.container_network);
    println!("  - firewall chains {}_*", config.network.chain_prefix);
    println!("  - routes and firewall rules installed by netplane");
    print!("Continue? [y/N] ");
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_teardown(report: &TeardownReport) {
    println!("routes removed:    {}", report.routes_removed);
    println!("rules removed:     {}", report.rules_removed);
    println!("chains removed:    {}", report.chains_removed);
    println!("interface removed: {}", report.link_removed);
    println!("network removed:   {}", report.network_removed);
    for e in &report.errors {
        println!("failed: {}", e);
    }
}
