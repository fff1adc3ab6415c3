//! Mob5G SMF N4 Daemon
//!
//! Control plane end of N4: associates with the configured UPFs, serves the
//! session API and forwards usage reports to the orchestration layer.

mod api;
mod upstream_http;

use anyhow::{Context, Result};
use clap::Parser;
use mob5g_n4::config::ApiConfig;
use mob5g_n4::upstream::{LogSink, UpstreamSink};
use mob5g_n4::{open_store, N4Config, N4Node, Role};
use mob5g_pfcp::types::NodeId;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::ApiServer;
use crate::upstream_http::HttpUpstream;

/// Mob5G SMF - N4 control plane endpoint
#[derive(Parser, Debug)]
#[command(name = "mob5g-smfd")]
#[command(author = "Mob5G")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "5G Core SMF N4 (PFCP) daemon", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = "/etc/mob5g/smf.yaml")]
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

    /// HTTP API listen address override
    #[arg(long)]
    api_addr: Option<SocketAddr>,

    /// Upstream URL for usage reports
    #[arg(long)]
    upstream_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    log::info!("Mob5G SMF v{} starting...", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let config = load_config(&args)?;
    let api_config = config.api.clone().unwrap_or_default();
    log::info!(
        "Node ID {} ({} configured peer(s), heartbeat {}ms x{})",
        config.node_id,
        config.peers.len(),
        config.heartbeat.interval_ms,
        config.heartbeat.miss_threshold
    );

    let upstream: Arc<dyn UpstreamSink> = match &api_config.upstream_url {
        Some(url) => {
            let sink = HttpUpstream::new(url)?;
            log::info!("Forwarding usage reports to {}", sink.uri());
            Arc::new(sink)
        }
        None => Arc::new(LogSink),
    };

    let store = open_store(&config.store)
        .await
        .context("Failed to open store")?;
    let node = N4Node::start(config, Role::ControlPlane, store, upstream)
        .await
        .context("Failed to start PFCP server")?;

    let api = ApiServer::new(api_config.addr);
    api.start(node.clone()).await?;

    log::info!("Mob5G SMF ready");

    run_event_loop(&node, shutdown).await;

    log::info!("Shutting down...");
    api.stop().await;
    node.shutdown().await;
    log::info!("Mob5G SMF stopped");
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
            node_id: NodeId::new("smf"),
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
    if args.api_addr.is_some() || args.upstream_url.is_some() {
        let api = config.api.get_or_insert_with(ApiConfig::default);
        if let Some(addr) = args.api_addr {
            api.addr = addr;
        }
        if let Some(url) = &args.upstream_url {
            api.upstream_url = Some(url.clone());
        }
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
                let sessions = match node.sessions() {
                    Some(sessions) => sessions.len().await,
                    None => 0,
                };
                log::debug!("Associations: {associations}, sessions: {sessions}");
            }
        }
    }
}
