//! usb-tty-bridge
//!
//! Command-line front-end for the USB bulk byte-stream bridge. Watches for the
//! configured USB device, exposes it as a port, and talks to it with the
//! newline-terminated request/response protocol ("Turn on" → "Done").

mod config;
mod console;
mod lines;
mod session;

use anyhow::{Context, Result};
use bridge::{BridgeError, StreamPort};
use clap::{Parser, Subcommand};
use common::{BridgeEvent, setup_logging};
use config::BridgeConfig;
use session::Session;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-tty-bridge")]
#[command(
    author,
    version,
    about = "Bridge a USB bulk endpoint pair to a byte-stream port"
)]
#[command(long_about = "
Exposes the bulk IN/OUT endpoints of a USB device (by default the Linux
gadget serial function, 0525:a4a7) as an ordered byte stream, and talks to
it with a line-based request/response protocol.

EXAMPLES:
    # List matching devices and their bulk endpoints
    usb-tty-bridge list

    # Send one command and wait for the reply
    usb-tty-bridge send \"Turn on\"

    # Stream device output to stdout, forward stdin lines to the device
    usb-tty-bridge monitor

    # Interactive console
    usb-tty-bridge console

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-tty-bridge/bridge.toml
    3. /etc/usb-tty-bridge/bridge.toml
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
    /// List matching USB devices and exit
    List,
    /// Send one line and wait for the reply
    Send {
        /// Line to send; a newline is appended
        line: String,
        /// Override the configured reply timeout
        #[arg(short, long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Print device output and forward stdin until Ctrl+C
    Monitor,
    /// Interactive console (default)
    Console,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(config::expand_path(path))).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let command = args.command.unwrap_or(Command::Console);

    // Log lines would tear the console's alternate screen.
    let log_level = match (&args.log_level, &command) {
        (Some(level), _) => level.as_str(),
        (None, Command::Console) => "error",
        (None, _) => config.logging.log_level.as_str(),
    };
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-tty-bridge v{}", env!("CARGO_PKG_VERSION"));

    match command {
        Command::List => list_devices(&config),
        Command::Send { line, timeout_ms } => {
            let session = Session::start(&config)?;
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.client.response_timeout());
            let result = send_line(&session, &config, &line, timeout).await;
            session.shutdown();
            result
        }
        Command::Monitor => {
            let session = Session::start(&config)?;
            let result = run_monitor(&session, &config).await;
            session.shutdown();
            result
        }
        Command::Console => {
            let session = Session::start(&config)?;
            let result = console::run_console(&session, &config).await;
            session.shutdown();
            result
        }
    }
}

/// List matching USB devices and exit
fn list_devices(config: &BridgeConfig) -> Result<()> {
    let identity = config.device.identity()?;
    let devices = bridge::usb::list_matching(identity)
        .map_err(|e| common::Error::Usb(e.to_string()))
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No {} devices found.", identity);
        return Ok(());
    }

    println!("Found {} device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} - Bus {:03} Device {:03}",
            device.identity, device.bus, device.address
        );
        match (device.interface, device.endpoints) {
            (Some(interface), Some(bulk)) => println!(
                "      Interface {}: bulk IN {:#04x} ({} B), bulk OUT {:#04x} ({} B)",
                interface,
                bulk.bulk_in.address,
                bulk.bulk_in.max_packet_size,
                bulk.bulk_out.address,
                bulk.bulk_out.max_packet_size
            ),
            _ => println!("      No interface with a single bulk IN/OUT pair"),
        }
        println!();
    }

    Ok(())
}

/// Send one line and print the reply
async fn send_line(
    session: &Session,
    config: &BridgeConfig,
    line: &str,
    timeout: Duration,
) -> Result<()> {
    let port = session.wait_for_port(config.device.attach_timeout()).await?;
    port.set_line_settings(config.line.clone());
    port.open()
        .with_context(|| format!("Failed to open {}", port.name()))?;

    let result = exchange(&port, line, &config.client.expected_reply, timeout).await;
    port.close();

    for line in result? {
        println!("{}", line);
    }
    Ok(())
}

/// Write one request line and collect the reply lines
async fn exchange(
    port: &Arc<StreamPort>,
    line: &str,
    expected: &str,
    timeout: Duration,
) -> Result<Vec<String>> {
    let request = format!("{}\n", line);
    let written = port.write(request.as_bytes()).context("Write failed")?;
    info!("Sent {} bytes to {}", written, port.name());

    let reader = port.clone();
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || session::wait_for_reply(&reader, &expected, timeout))
        .await
        .context("Reply reader panicked")?
}

/// Stream inbound bytes to stdout and stdin lines to the device
async fn run_monitor(session: &Session, config: &BridgeConfig) -> Result<()> {
    let port = session.wait_for_port(config.device.attach_timeout()).await?;
    port.set_line_settings(config.line.clone());
    port.open()
        .with_context(|| format!("Failed to open {}", port.name()))?;
    eprintln!("Connected to {}, press Ctrl+C to exit", port.name());

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let port = port.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let mut buf = [0u8; 512];
            while !stop.load(Ordering::SeqCst) {
                match port.read_timeout(&mut buf, Duration::from_millis(100)) {
                    Ok(0) => {}
                    Ok(n) => {
                        let _ = stdout.write_all(&buf[..n]);
                        let _ = stdout.flush();
                    }
                    Err(BridgeError::NoDevice) => break,
                    Err(e) => warn!("Read failed: {}", e),
                }
            }
        })
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = port.write(format!("{}\n", line).as_bytes()) {
                        error!("Write failed: {}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            event = session.events.recv() => match event {
                Ok(BridgeEvent::Detached { slot }) if slot == port.slot().0 => {
                    eprintln!("{} detached", port.name());
                    break;
                }
                Ok(event) => info!("Bridge event: {:?}", event),
                Err(e) => {
                    error!("Event channel closed: {}", e);
                    break;
                }
            },
        }
    }

    stop.store(true, Ordering::SeqCst);
    port.close();
    if let Err(e) = reader.await {
        error!("Reader task failed: {}", e);
    }
    Ok(())
}
