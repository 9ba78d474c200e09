//! usbip-proxy
//!
//! Attaches to devices exported by USB/IP servers through the proxy backend
//! and reports what it finds.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use common::setup_logging;
use protocol::{SetupPacket, UrbStatus, request};
use proxy::{ProxyConfig, Urb, UsbIpProxy, UsbProxyBackend, lock_urb};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbip-proxy")]
#[command(author, version, about = "USB/IP proxy - drive remote USB devices")]
#[command(long_about = "
Imports USB devices exported by a USB/IP server (usbipd) and drives them
through the asynchronous proxy engine.

EXAMPLES:
    # Import every device listed in the config file
    usbip-proxy

    # Import one device and read its device descriptor
    usbip-proxy --address usbip://192.168.1.20:1-1.4 --probe

    # Run with debug logging
    usbip-proxy --log-level debug

CONFIGURATION:
    The proxy looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-proxy/proxy.toml
    3. /etc/usbip-proxy/proxy.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device to import (repeatable; replaces the configured devices)
    #[arg(short, long, value_name = "usbip://HOST[:PORT]:BUSID")]
    address: Vec<String>,

    /// Read the device descriptor of each imported device
    #[arg(long)]
    probe: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ProxyConfig::default();
        let path = ProxyConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ProxyConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ProxyConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.proxy.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbip-proxy v{}", env!("CARGO_PKG_VERSION"));

    let addresses: Vec<String> = if args.address.is_empty() {
        config.devices.iter().map(|d| d.address.clone()).collect()
    } else {
        args.address.clone()
    };
    if addresses.is_empty() {
        bail!("No devices to import: pass --address or add [[devices]] to the config file");
    }

    let mut failures = 0;
    for address in &addresses {
        if let Err(e) = attach(address, &config, args.probe) {
            error!("{}: {:#}", address, e);
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(anyhow!("{} of {} devices failed", failures, addresses.len()));
    }
    Ok(())
}

fn attach(address: &str, config: &ProxyConfig, probe: bool) -> Result<()> {
    let proxy = UsbIpProxy::open(address, &config.transport)
        .with_context(|| format!("Failed to import {}", address))?;

    let device = proxy.device();
    println!(
        "{}  {:04x}:{:04x}  bus {} dev {}  {:?} speed  {} interface(s)",
        proxy.address(),
        device.id_vendor,
        device.id_product,
        device.busnum,
        device.devnum,
        proxy.speed(),
        device.num_interfaces
    );

    let result = if probe { probe_device(&proxy, config) } else { Ok(()) };
    proxy.close();
    result
}

/// GET_DESCRIPTOR(Device) through the asynchronous queue/reap path
fn probe_device(proxy: &UsbIpProxy, config: &ProxyConfig) -> Result<()> {
    const DEVICE_DESCRIPTOR_LEN: u16 = 18;

    let setup = SetupPacket {
        request_type: 0x80,
        request: request::GET_DESCRIPTOR,
        value: 0x0100,
        index: 0,
        length: DEVICE_DESCRIPTOR_LEN,
    };
    let urb = Urb::control(setup, usize::from(DEVICE_DESCRIPTOR_LEN)).into_shared();
    let handle = proxy.queue(&urb).context("Failed to queue GET_DESCRIPTOR")?;

    let timeout = config.transport.control_timeout();
    let Some(done) = proxy.reap(Some(timeout)) else {
        warn!("No reply to GET_DESCRIPTOR within {:?}, cancelling", timeout);
        proxy.cancel(handle)?;
        let _ = proxy.reap(Some(Duration::from_secs(1)));
        bail!("GET_DESCRIPTOR timed out");
    };

    let done = lock_urb(&done);
    if done.status != UrbStatus::Ok {
        bail!("GET_DESCRIPTOR failed: {:?}", done.status);
    }
    let descriptor = done.transferred();
    let hex: Vec<String> = descriptor.iter().map(|b| format!("{:02x}", b)).collect();
    println!("  device descriptor: {}", hex.join(" "));
    if descriptor.len() >= usize::from(DEVICE_DESCRIPTOR_LEN) {
        println!(
            "  bcdUSB {:x}.{:02x}  class {:02x}  max packet {}  {} configuration(s)",
            descriptor[3],
            descriptor[2],
            descriptor[4],
            descriptor[7],
            descriptor[17]
        );
    }
    Ok(())
}
