use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pktfilter::domain::interfaces;
use pktfilter::{Config, FilterKind, IfaceMgr, Pkt4};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long one receive waits before the shutdown flag is checked again
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pktfilter")]
#[command(about = "DHCPv4 packet filter - open interface sockets and watch DHCP traffic")]
struct Cli {
    /// Configuration file (defaults to PKTFILTER_CONFIG or /etc/pktfilter.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List network interfaces
    Ifaces,
    /// List packet filters available on this platform
    Filters,
    /// Open sockets and log every DHCP packet received
    Listen {
        /// Packet filter (auto, inet, lpf, bpf); overrides the configuration
        #[arg(short, long)]
        filter: Option<FilterKind>,

        /// UDP port; overrides the configuration
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to listen on; may be repeated
        #[arg(short, long = "interface")]
        interfaces: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Ifaces => list_ifaces(),
        Commands::Filters => list_filters(),
        Commands::Listen {
            filter,
            port,
            interfaces,
        } => {
            let mut config = config;
            if let Some(filter) = filter {
                config.filter = filter;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if !interfaces.is_empty() {
                config.interfaces = interfaces;
            }
            listen(&config)
        }
    }
}

fn list_ifaces() -> Result<()> {
    for iface in interfaces() {
        let mac = iface
            .mac
            .map(|m| m.to_string().to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        let addrs: Vec<String> = iface.addrs.iter().map(|a| a.to_string()).collect();
        println!(
            "{:>3} {:<12} {:<17} <{}> {}",
            iface.index,
            iface.name,
            mac,
            iface.flags,
            addrs.join(",")
        );
    }
    Ok(())
}

fn list_filters() -> Result<()> {
    for kind in FilterKind::available() {
        let filter = kind.create()?;
        println!(
            "{:<5} direct-response={}",
            kind,
            filter.is_direct_response_supported()
        );
    }
    println!("auto  -> {}", FilterKind::Auto.resolve());
    Ok(())
}

fn listen(config: &Config) -> Result<()> {
    let filter = config
        .filter
        .create()
        .with_context(|| format!("Failed to create packet filter '{}'", config.filter))?;

    let mut mgr = IfaceMgr::new(filter);
    for iface in interfaces() {
        if config.wants_iface(&iface.name) {
            mgr.add_iface(iface);
        }
    }
    for name in &config.interfaces {
        if mgr.iface(name).is_none() {
            warn!("Interface '{}' not found", name);
        }
    }

    let opened = mgr.open_sockets4(config.port, config.broadcast);
    if opened == 0 {
        bail!("No sockets opened on port {}", config.port);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;

    info!(
        "Listening on port {} with {} ({} sockets, direct response {})",
        config.port,
        mgr.filter_name(),
        opened,
        if mgr.is_direct_response_supported() { "on" } else { "off" }
    );

    while running.load(Ordering::SeqCst) {
        match mgr.receive4(RECEIVE_TIMEOUT) {
            Ok(Some(pkt)) => log_packet(&pkt),
            Ok(None) => {}
            Err(e) => warn!("Receive failed: {}", e),
        }
    }

    mgr.close_sockets();
    info!("Stopped");
    Ok(())
}

fn log_packet(pkt: &Pkt4) {
    let mac = pkt
        .remote_hw_addr
        .map(|m| m.to_string().to_lowercase())
        .unwrap_or_else(|| "-".to_string());

    match pkt.header() {
        Ok(header) => info!(
            "{} {} from {} {}:{} xid=0x{:08x} chaddr={}{}",
            pkt.iface,
            if header.is_request() { "BOOTREQUEST" } else { "BOOTREPLY" },
            mac,
            pkt.remote_addr,
            pkt.remote_port,
            header.xid,
            header.chaddr.to_string().to_lowercase(),
            if header.is_relayed() {
                format!(" via {}", header.giaddr)
            } else {
                String::new()
            }
        ),
        Err(e) => warn!("{}: undecodable packet from {}: {}", pkt.iface, mac, e),
    }
}
