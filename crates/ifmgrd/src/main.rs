//! Interface Manager Daemon
//!
//! Main entry point for the ifmgrd daemon.
//! Tracks kernel network interfaces and reports device changes to the controller.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-8: System Component Inventory - Initial and periodic resync
//! - SI-4: System Monitoring - Real-time event processing

use anyhow::Context;
use clap::Parser;
use ifmgrd::config::DEFAULT_CONFIG_PATH;
use ifmgrd::{
    ChannelNotifier, ControllerEvent, ControllerNotifier, IfmgrConfig, InterfaceManager,
    JsonLinesNotifier, NetlinkChannel, OvsInterfaceNames, ReservedNameSource, ShellRunner,
    SocketReadiness, StaticReservedNames,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Delay between controller connection attempts
const CONTROLLER_RETRY_SECS: u64 = 1;

/// Network interface state manager
#[derive(Parser, Debug)]
#[command(name = "ifmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Controller address (host[:port]), overrides the config file
    #[arg(long)]
    controller: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = IfmgrConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(controller) = args.controller {
        config.controller.address = Some(controller);
    }
    config.validate().context("invalid configuration")?;

    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("ifmgrd: Starting interface manager");
    match run_daemon(config).await {
        Ok(()) => {
            info!("ifmgrd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "ifmgrd: Daemon exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging; RUST_LOG overrides the command line level
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(log_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Main daemon loop
///
/// # NIST Controls
/// - SI-4: System Monitoring - Event loop for monitoring
async fn run_daemon(config: IfmgrConfig) -> anyhow::Result<()> {
    let channel = NetlinkChannel::new(&config.netlink).context("opening netlink channel")?;

    let notifier: Box<dyn ControllerNotifier> = match config.controller_endpoint()? {
        Some(endpoint) => {
            let (notifier, rx) = ChannelNotifier::new(config.controller.queue_depth);
            tokio::spawn(controller_writer(endpoint, rx));
            Box::new(notifier)
        }
        None => {
            info!("ifmgrd: No controller configured, writing events to stdout");
            Box::new(JsonLinesNotifier::new(std::io::stdout()))
        }
    };

    let runner = Arc::new(ShellRunner);
    let reserved: Box<dyn ReservedNameSource> = if config.naming.query_ovs {
        Box::new(OvsInterfaceNames::with_binary(
            runner.clone(),
            &config.naming.ovs_vsctl_path,
        ))
    } else {
        Box::new(StaticReservedNames::default())
    };

    let mut manager = InterfaceManager::new(Box::new(channel), notifier)
        .with_runner(runner)
        .with_reserved_names(reserved);

    // NIST: CM-8 - Initial inventory, announces every pre-existing device
    manager.rescan().context("initial device scan")?;
    info!(
        devices = manager.registry().len(),
        fd = manager.raw_fd(),
        "ifmgrd: Listening to link and address events"
    );

    let mut watched_fd = manager.raw_fd();
    let mut readiness = watch_socket(watched_fd);
    // Covers wakeups lost while the socket is being reopened
    let mut poll = tokio::time::interval(config.poll_interval());
    let mut resync = config.resync_interval().map(tokio::time::interval);
    if let Some(resync) = resync.as_mut() {
        // The first tick completes immediately and the initial scan just ran
        resync.tick().await;
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("ifmgrd: Received shutdown signal");
                break;
            }
            ready = next_readable(readiness.as_ref()) => {
                if let Err(e) = ready {
                    warn!(error = %e, "ifmgrd: Netlink readiness wait failed, polling until reconnect");
                    readiness = None;
                }
                if let Err(e) = manager.handle_pending_messages() {
                    warn!(error = %e, "ifmgrd: Error processing kernel events");
                }
            }
            _ = poll.tick() => {
                if let Err(e) = manager.handle_pending_messages() {
                    warn!(error = %e, "ifmgrd: Error processing kernel events");
                }
            }
            _ = next_tick(resync.as_mut()) => {
                debug!("ifmgrd: Periodic resync");
                if let Err(e) = manager.rescan() {
                    warn!(error = %e, "ifmgrd: Periodic resync failed");
                }
            }
        }

        // A reconnect replaces the socket, so follow the new descriptor
        let fd = manager.raw_fd();
        if fd != watched_fd {
            watched_fd = fd;
            readiness = watch_socket(fd);
        }
    }

    info!("ifmgrd: Graceful shutdown complete");
    Ok(())
}

/// Register `fd` with the reactor; None leaves the fallback tick in charge
fn watch_socket(fd: i32) -> Option<SocketReadiness> {
    if fd < 0 {
        return None;
    }
    match SocketReadiness::new(fd) {
        Ok(readiness) => {
            debug!(fd, "ifmgrd: Watching netlink socket");
            Some(readiness)
        }
        Err(e) => {
            warn!(fd, error = %e, "ifmgrd: Cannot watch netlink socket, polling only");
            None
        }
    }
}

async fn next_readable(readiness: Option<&SocketReadiness>) -> ifmgrd::Result<()> {
    match readiness {
        Some(readiness) => readiness.readable().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Forward events to the controller as JSON lines, reconnecting as needed
async fn controller_writer(endpoint: String, mut rx: mpsc::Receiver<ControllerEvent>) {
    let mut stream: Option<TcpStream> = None;

    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "ifmgrd: Failed to serialize controller event");
                continue;
            }
        };
        line.push(b'\n');

        loop {
            if stream.is_none() {
                match TcpStream::connect(&endpoint).await {
                    Ok(conn) => {
                        info!(%endpoint, "ifmgrd: Connected to controller");
                        stream = Some(conn);
                    }
                    Err(e) => {
                        warn!(%endpoint, error = %e, "ifmgrd: Controller unreachable, retrying");
                        tokio::time::sleep(Duration::from_secs(CONTROLLER_RETRY_SECS)).await;
                        continue;
                    }
                }
            }
            let Some(conn) = stream.as_mut() else {
                continue;
            };

            match conn.write_all(&line).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "ifmgrd: Controller connection lost");
                    stream = None;
                }
            }
        }
    }

    debug!("ifmgrd: Controller channel closed");
}
