#![deny(warnings)]

//! `chiral-node`: the headless host process for the Chiral Network core
//! (`spec.md` §6). Parses flags into a [`NodeConfig`], starts a
//! [`ChiralNode`], and waits for `SIGINT`/`SIGTERM` before draining
//! shutdown. A thin clap-derived binary over a typed library's errors,
//! nothing more.

use std::process::ExitCode;
use std::time::Duration;

use chiral_core::{ChiralNode, CoreError, NodeConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Bootstrap health is polled for this long before giving up with exit
/// code 3 (`spec.md` §6 "bootstrap failed after cap").
const BOOTSTRAP_GRACE: Duration = Duration::from_secs(15);
const BOOTSTRAP_FAILURE_CAP: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "chiral-node")]
#[command(about = "Headless Chiral Network node")]
struct Cli {
    /// Run without any interactive UI (the only supported mode of this binary).
    #[arg(long)]
    headless: bool,

    #[arg(long, default_value_t = 4001)]
    dht_port: u16,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Print this node's listen multiaddr once the DHT driver is up.
    #[arg(long)]
    show_multiaddr: bool,

    /// Periodically print the Reachability & NAT Module's current state.
    #[arg(long)]
    show_reachability: bool,

    #[arg(long = "bootstrap")]
    bootstrap_addrs: Vec<String>,

    #[arg(long)]
    data_dir: Option<String>,

    #[arg(long)]
    enable_autonat: bool,

    #[arg(long, default_value_t = 90)]
    autonat_probe_interval_secs: u32,

    #[arg(long = "autonat-server")]
    autonat_servers: Vec<String>,

    #[arg(long)]
    enable_autorelay: bool,

    #[arg(long = "preferred-relay")]
    preferred_relays: Vec<String>,

    #[arg(long)]
    enable_relay_server: bool,

    #[arg(long)]
    enable_upnp: bool,

    #[arg(long)]
    pure_client_mode: bool,

    /// Run as a pure router: answer DHT RPCs but never publish this node's
    /// own provider records (`spec.md` §4.5 "bootstrap role").
    #[arg(long)]
    bootstrap_role: bool,

    #[arg(long, default_value_t = 256)]
    chunk_size_kib: u32,

    #[arg(long, default_value_t = 0)]
    cache_size_mib: u64,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        let mut config = NodeConfig {
            dht_port: self.dht_port,
            bootstrap_addrs: self.bootstrap_addrs,
            enable_autonat: self.enable_autonat,
            autonat_probe_interval_secs: self.autonat_probe_interval_secs,
            autonat_servers: self.autonat_servers,
            chunk_size_kib: self.chunk_size_kib,
            cache_size_mib: self.cache_size_mib,
            enable_autorelay: self.enable_autorelay,
            preferred_relays: self.preferred_relays,
            enable_relay_server: self.enable_relay_server,
            enable_upnp: self.enable_upnp,
            pure_client_mode: self.pure_client_mode,
            bootstrap_role: self.bootstrap_role,
            ..Default::default()
        };
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_new(cli.log_level.as_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !cli.headless {
        tracing::warn!(subsystem = "cli", "this binary only supports --headless operation; continuing headless anyway");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(subsystem = "cli", %err, "failed to start tokio runtime");
            return ExitCode::from(1);
        }
    };

    let show_multiaddr = cli.show_multiaddr;
    let show_reachability = cli.show_reachability;
    let config = cli.into_config();

    runtime.block_on(run(config, show_multiaddr, show_reachability))
}

async fn run(config: NodeConfig, show_multiaddr: bool, show_reachability: bool) -> ExitCode {
    let dht_port = config.dht_port;
    let bootstrap_configured = !config.bootstrap_addrs.is_empty();

    let node = match ChiralNode::start_node(config).await {
        Ok(node) => node,
        Err(CoreError::Config(err)) => {
            tracing::error!(subsystem = "cli", %err, "configuration invalid");
            return ExitCode::from(2);
        }
        Err(err) => {
            tracing::error!(subsystem = "cli", %err, "node failed to start");
            return ExitCode::from(1);
        }
    };

    let peer_id = node.local_peer_id();
    tracing::info!(subsystem = "cli", %peer_id, "node started");
    if show_multiaddr {
        println!("/ip4/0.0.0.0/tcp/{dht_port}/p2p/{peer_id}", peer_id = peer_id.as_str());
    }

    if bootstrap_configured {
        if let Err(exit_code) = wait_for_bootstrap(&node).await {
            node.stop_node().await;
            return exit_code;
        }
    }

    let reachability_task = if show_reachability {
        Some(spawn_reachability_printer(node.clone()))
    } else {
        None
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(subsystem = "cli", %err, "failed to install signal handler");
    }

    if let Some(handle) = reachability_task {
        handle.abort();
    }

    tracing::info!(subsystem = "cli", "shutting down");
    node.stop_node().await;
    ExitCode::from(0)
}

/// Polls `get_dht_health()` until at least one peer connects or the grace
/// period elapses with failures past the cap (`spec.md` §6 exit code 3).
async fn wait_for_bootstrap(node: &ChiralNode) -> Result<(), ExitCode> {
    let deadline = tokio::time::Instant::now() + BOOTSTRAP_GRACE;
    loop {
        match node.get_dht_health().await {
            Ok(health) if health.connected_peers > 0 => return Ok(()),
            Ok(health) if health.bootstrap_failures >= BOOTSTRAP_FAILURE_CAP && tokio::time::Instant::now() >= deadline => {
                tracing::error!(subsystem = "cli", failures = health.bootstrap_failures, "bootstrap failed after cap");
                return Err(ExitCode::from(3));
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(subsystem = "cli", %err, "health check failed while waiting for bootstrap");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn spawn_reachability_printer(node: ChiralNode) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let (state, confidence) = node.reachability_state().await;
            println!("reachability: state={state} confidence={confidence}");
        }
    })
}
