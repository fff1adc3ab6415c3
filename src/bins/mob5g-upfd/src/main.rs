//! Mob5G UPF N4 Daemon
//!
//! User plane end of N4: answers association and session requests from SMFs,
//! supervises their liveness and reports session usage back to them.

use anyhow::{Context, Result};
use clap::Parser;
use mob5g_n4::upstream::LogSink;
use mob5g_n4::{open_store, N4Config, N4Node, Role};
use mob5g_pfcp::types::NodeId;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mob5G UPF - N4 user plane endpoint
#[derive(Parser, Debug)]
#[command(name = "mob5g-upfd")]
#[command(author = "Mob5G")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "5G Core UPF N4 (PFCP) daemon", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = "/etc/mob5g/upf.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,

    /// Node ID override
    #[arg(long)]
    node_id: Option<String>,

    /// PFCP server address override
    #[arg(long)]
    pfcp_addr: Option<IpAddr>,

    /// PFCP server port override
    #[arg(long)]
    pfcp_port: Option<u16>,

    /// Usage report period in milliseconds (0 disables)
    #[arg(long)]
    report_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    log::info!("Mob5G UPF v{} starting...", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let config = load_config(&args)?;
    log::info!(
        "Node ID {} (heartbeat {}ms x{}, reports every {}ms)",
        config.node_id,
        config.heartbeat.interval_ms,
        config.heartbeat.miss_threshold,
        config.report_interval_ms
    );

    let store = open_store(&config.store)
        .await
        .context("Failed to open store")?;
    let node = N4Node::start(config, Role::UserPlane, store, Arc::new(LogSink))
        .await
        .context("Failed to start PFCP server")?;

    log::info!("Mob5G UPF ready");

    run_event_loop(&node, shutdown).await;

    log::info!("Shutting down...");
    node.shutdown().await;
    log::info!("Mob5G UPF stopped");
    Ok(())
}

/// Load the YAML configuration and apply command line overrides
fn load_config(args: &Args) -> Result<N4Config> {
    let mut config = if std::path::Path::new(&args.config).exists() {
        log::info!("Loading configuration from {}", args.config);
        N4Config::from_file(&args.config).with_context(|| format!("Invalid configuration {}", args.config))?
    } else {
        log::warn!("Configuration file not found: {}, using defaults", args.config);
        N4Config {
            node_id: NodeId::new("upf"),
            ..Default::default()
        }
    };

    if let Some(node_id) = &args.node_id {
        config.node_id = NodeId::new(node_id.as_str());
    }
    if let Some(addr) = args.pfcp_addr {
        config.addr = addr;
    }
    if let Some(port) = args.pfcp_port {
        config.port = port;
    }
    if let Some(interval) = args.report_interval_ms {
        config.report_interval_ms = interval;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize logging based on command line arguments
fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    builder.filter_level(level);
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.init();
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(())
}

/// Wait for shutdown, logging session statistics periodically
async fn run_event_loop(node: &N4Node, shutdown: Arc<AtomicBool>) {
    let mut shutdown_check = tokio::time::interval(Duration::from_millis(200));
    let mut stats_interval = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = shutdown_check.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            _ = stats_interval.tick() => {
                let associations = node.associations().established().await.len();
                let sessions = match node.up_sessions() {
                    Some(table) => table.len().await,
                    None => 0,
                };
                log::debug!("Associations: {associations}, sessions: {sessions}");
            }
        }
    }
}
