//! usbip-host server
//!
//! Host-side USB/IP server: exports locally attached USB devices over the
//! network so a remote usbip client can import them and exchange URBs as if
//! they were locally attached.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbCommand, create_usb_bridge, setup_logging};
use server::config::{ServerConfig, expand_path};
use server::server::UsbIpServer;
use server::usb::{RusbBackend, spawn_usb_worker};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usbip-host-server")]
#[command(
    author,
    version,
    about = "USB/IP host server - export local USB devices over the network"
)]
#[command(long_about = "
Serves the USB/IP protocol (TCP port 3240 by default) so remote usbip
clients can enumerate, import, and drive USB devices attached to this host.

EXAMPLES:
    # Run with default config
    usbip-host-server

    # Run with custom config
    usbip-host-server --config /path/to/server.toml

    # List exportable USB devices without starting the server
    usbip-host-server --list-devices

    # Run with debug logging
    usbip-host-server --log-level debug

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-host/server.toml
    3. /etc/usbip-host/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the configured listen port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config before loading anything
    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    if let Some(port) = args.port {
        config.network.port = port;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbip-host server v{}", env!("CARGO_PKG_VERSION"));

    let backend = RusbBackend::new(config.limits.usb_operation_timeout)
        .context("Failed to initialize USB backend")?;

    if args.list_devices {
        return list_devices_mode(Box::new(backend), config.usb.allowed_devices.clone()).await;
    }

    let mut server = UsbIpServer::new(config, Box::new(backend));
    server.set_on_error(|e| error!("Server error: {}", e));
    server.start().await.context("Failed to start server")?;

    signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
    info!("Shutting down...");

    server.stop().context("Failed to stop server")?;
    server.shutdown().await;
    Ok(())
}

/// Print the exportable device list and exit
async fn list_devices_mode(
    backend: Box<dyn server::usb::DeviceBackend>,
    filters: Vec<String>,
) -> Result<()> {
    let (bridge, worker) = create_usb_bridge();
    let worker_handle = spawn_usb_worker(worker, backend, filters);

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .context("USB worker unavailable")?;
    let devices = rx.await.context("USB worker dropped the request")?;

    if devices.is_empty() {
        println!("No exportable USB devices found");
    } else {
        println!("Exportable USB devices:");
        for device in devices {
            println!("  {}", device.label());
        }
    }

    bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .context("USB worker unavailable")?;
    let _ = tokio::task::spawn_blocking(move || worker_handle.join()).await;
    Ok(())
}
