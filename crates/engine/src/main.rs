//! hid-transport
//!
//! Command line front end for the HID transport engine: list attached HID
//! devices and exchange input, output and feature reports with them.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::{UsbBridge, create_usb_bridge, setup_logging};
use engine::EngineConfig;
use engine::usb::{RusbHost, spawn_usb_worker};
use protocol::DeviceIdentifier;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hid-transport")]
#[command(author, version, about = "Talk to USB HID devices over libusb")]
#[command(long_about = "
Opens USB HID devices directly through libusb and exchanges reports with
them: input reports over the interrupt IN endpoint, output reports over the
interrupt OUT endpoint and feature reports over HID class control transfers.

Devices are addressed by bus/address as printed by `list`, e.g. 001/004.

EXAMPLES:
    # List every attached device of one vendor
    hid-transport list --vid 0x1234

    # Read one input report, waiting up to 500 ms
    hid-transport read 001/004 --length 64 --timeout-ms 500

    # Send an output report
    hid-transport write 001/004 '01 02 03'

    # Fetch feature report 2 (8 bytes)
    hid-transport get-feature 001/004 0x02 8

CONFIGURATION:
    The engine looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hid-transport/engine.toml
    3. /etc/hid-transport/engine.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    List {
        /// Only devices with this vendor id
        #[arg(long, value_parser = parse_u16)]
        vid: Option<u16>,
        /// Only devices with this product id
        #[arg(long, value_parser = parse_u16)]
        pid: Option<u16>,
    },

    /// Read one input report
    Read {
        device: String,
        /// Maximum number of bytes to read
        #[arg(long, default_value_t = 64)]
        length: usize,
        /// Read timeout; 0 uses the configured default
        #[arg(long, default_value_t = 0)]
        timeout_ms: u32,
    },

    /// Send an output report
    Write { device: String, hex: String },

    /// Fetch a feature report
    GetFeature {
        device: String,
        #[arg(value_parser = parse_u8)]
        report_id: u8,
        /// Number of bytes to request, excluding the report id
        length: usize,
    },

    /// Send a feature report; the first byte is the report id
    SetFeature { device: String, hex: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = EngineConfig::default();
        let path = EngineConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        engine::config::load_config(path).context("Failed to load configuration")?
    } else {
        EngineConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.engine.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("hid-transport v{}", env!("CARGO_PKG_VERSION"));

    let host = RusbHost::new(config.usb.detach_kernel_driver)
        .context("Failed to initialize libusb")?;

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(worker, Arc::new(host), config.worker_settings())
        .context("Failed to spawn USB worker thread")?;

    let command = args.command.unwrap_or(Command::List {
        vid: None,
        pid: None,
    });
    let result = run_command(&usb_bridge, command).await;

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.shutdown().await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    if let Err(e) = usb_worker_handle.join() {
        error!("USB worker thread panicked: {:?}", e);
    }

    result
}

async fn run_command(bridge: &UsbBridge, command: Command) -> Result<()> {
    match command {
        Command::List { vid, pid } => list_devices(bridge, vid, pid).await,

        Command::Read {
            device,
            length,
            timeout_ms,
        } => {
            let data = with_session(bridge, &device, |bridge, id| async move {
                bridge.read(&id, length, timeout_ms).await
            })
            .await
            .context("Read failed")?;

            if data.is_empty() {
                println!("(no data)");
            } else {
                println!("{}", format_hex(&data));
            }
            Ok(())
        }

        Command::Write { device, hex } => {
            let data = parse_hex(&hex)?;
            with_session(bridge, &device, |bridge, id| async move {
                bridge.write(&id, data).await
            })
            .await
            .context("Write failed")
        }

        Command::GetFeature {
            device,
            report_id,
            length,
        } => {
            let data = feature_request(report_id, length)?;
            let report = with_session(bridge, &device, |bridge, id| async move {
                bridge.get_feature_report(&id, data).await
            })
            .await
            .context("GET_REPORT failed")?;

            println!("{}", format_hex(&report));
            Ok(())
        }

        Command::SetFeature { device, hex } => {
            let data = parse_hex(&hex)?;
            if data.is_empty() {
                bail!("Feature report needs at least the report id");
            }
            with_session(bridge, &device, |bridge, id| async move {
                bridge.set_feature_report(&id, data).await
            })
            .await
            .context("SET_REPORT failed")
        }
    }
}

/// Open `device`, run `op`, and close the device again whatever the outcome
async fn with_session<'a, T, F, Fut>(bridge: &'a UsbBridge, device: &str, op: F) -> Result<T>
where
    F: FnOnce(&'a UsbBridge, DeviceIdentifier) -> Fut,
    Fut: std::future::Future<Output = common::Result<T>>,
{
    let id = DeviceIdentifier::from(device);
    bridge
        .open(&id)
        .await
        .with_context(|| format!("Failed to open {}", id))?;

    let result = op(bridge, id.clone()).await;

    if let Err(e) = bridge.close(&id).await {
        error!("Failed to close {}: {:#}", id, e);
    }
    Ok(result?)
}

async fn list_devices(bridge: &UsbBridge, vid: Option<u16>, pid: Option<u16>) -> Result<()> {
    info!("Listing USB devices...");

    let devices = bridge
        .list_devices(vid, pid)
        .await
        .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            let product = if device.product_name.is_empty() {
                "Unknown Product"
            } else {
                &device.product_name
            };
            println!(
                "  [{}] {:04x}:{:04x} - {}",
                device.identifier, device.vendor_id, device.product_id, product
            );
            if !device.serial_number.is_empty() {
                println!("      Serial: {}", device.serial_number);
            }
        }
    }

    // Devices skipped for lack of permission
    while let Some(event) = bridge.try_recv_event() {
        if let common::HidEvent::PermissionRequested { device } = event {
            println!("  [{}] skipped: permission required", device);
        }
    }

    Ok(())
}

/// GET_REPORT buffer: the report id followed by `length` zero bytes
fn feature_request(report_id: u8, length: usize) -> Result<Vec<u8>> {
    let Some(total) = length.checked_add(1) else {
        bail!("Feature report length {} is too large", length);
    };
    let mut data = vec![0u8; total];
    data[0] = report_id;
    Ok(data)
}

/// Parse `aa bb`, `aabb` or `0xaa,0xbb` into bytes
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();

    for token in input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);

        if digits.len() <= 2 {
            bytes.push(parse_byte(digits, token)?);
            continue;
        }
        if digits.len() % 2 != 0 {
            bail!("Odd number of hex digits in '{}'", token);
        }
        for i in (0..digits.len()).step_by(2) {
            let pair = digits
                .get(i..i + 2)
                .ok_or_else(|| anyhow!("Invalid hex '{}'", token))?;
            bytes.push(parse_byte(pair, token)?);
        }
    }

    Ok(bytes)
}

fn parse_byte(digits: &str, token: &str) -> Result<u8> {
    u8::from_str_radix(digits, 16).map_err(|_| anyhow!("Invalid hex byte '{}'", token))
}

fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a decimal or 0x-prefixed hex id
fn parse_u16(s: &str) -> Result<u16, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid id '{}': {}", s, e))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u16(s)?;
    u8::try_from(value).map_err(|_| format!("'{}' does not fit in a byte", s))
}
