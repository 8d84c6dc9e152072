//! usbip-vhcid
//!
//! Runs the virtual host controller: replays the persisted device list
//! against remote USB/IP servers and keeps the devices attached until
//! Ctrl+C.

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::setup_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use vhci::{TcpConnector, Vhci, VhciConfig};

#[derive(Parser, Debug)]
#[command(name = "usbip-vhcid")]
#[command(author, version, about = "Virtual USB host controller for USB/IP devices")]
#[command(long_about = "
Attaches remote USB/IP devices to a virtual root hub and keeps retrying
the ones whose servers are not reachable yet.

EXAMPLES:
    # Run with default config
    usbip-vhcid

    # Attach one extra device on startup
    usbip-vhcid --device pi5.local,3240,1-1.2

    # Run with a custom config and debug logging
    usbip-vhcid --config /path/to/vhci.toml --log-level debug

CONFIGURATION:
    The controller looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-vhci/vhci.toml
    3. /etc/usbip-vhci/vhci.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Number of root hub ports (overrides config)
    #[arg(short, long, value_name = "N")]
    ports: Option<usize>,

    /// Extra device to attach, as host,service,busid (repeatable)
    #[arg(short, long = "device", value_name = "DEVICE")]
    devices: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = VhciConfig::default();
        let path = VhciConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        VhciConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        VhciConfig::load_or_default(None)
    };

    if let Some(ports) = args.ports {
        config.controller.num_ports = ports;
    }
    config.persistent.devices.extend(args.devices);
    config.validate().context("Invalid configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.controller.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbip-vhcid v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let vhci = Arc::new(
        Vhci::new(config.controller.num_ports, TcpConnector::default())
            .context("Failed to create controller")?
            .with_backoff(config.reconnect.backoff_policy()),
    );
    info!("Root hub ready with {} ports", config.controller.num_ports);

    if config.reconnect.enabled {
        let count = vhci.plugin_persistent_devices(&config.persistent.devices);
        info!("Replaying {} persistent devices", count);
    } else if !config.persistent.devices.is_empty() {
        warn!(
            "Reconnect disabled, {} persistent devices ignored",
            config.persistent.devices.len()
        );
    }

    if let Err(e) = signal::ctrl_c().await {
        vhci.shutdown().await;
        bail!("Failed to listen for Ctrl+C: {}", e);
    }

    info!("Shutting down");
    vhci.shutdown().await;
    Ok(())
}
