use anyhow::Context;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use tapbridge::config::Config;
use tapbridge::error::Error;
use tapbridge::framing::Framing;
use tapbridge::session::{LinuxHost, Session};
use tapbridge::tracing::{self, prelude::*};
use tapbridge::transport::{DeviceScanner, Selection};

/// Bridge a USB serial network peripheral onto a TAP interface.
#[derive(Debug, Parser)]
#[command(name = "tapbridge", version, about)]
struct Args {
    /// Serial device to use (e.g. /dev/ttyACM1); auto-detected if omitted
    #[arg(short, long)]
    dev: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TAP interface name
    #[arg(long)]
    iface: Option<String>,

    /// Serial line rate
    #[arg(long)]
    baud: Option<u32>,

    /// USB vendor ID to look for during auto-detection
    #[arg(long)]
    vendor_id: Option<String>,

    /// Framing on the serial link (raw or length-prefixed)
    #[arg(long)]
    framing: Option<Framing>,

    /// List candidate serial devices and exit
    #[arg(long)]
    scan: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing::init_journald_or_stdout(tracing::level_for_verbosity(args.verbose));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            if wants_root(&e) {
                error!("Use: sudo tapbridge --dev /dev/ttyACM0");
            }
            ExitCode::FAILURE
        }
    }
}

/// Whether running as root would get past `e`.
fn wants_root(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Error>(), Some(Error::PermissionDenied(_)))
}

/// Build the effective configuration: defaults, file, environment, flags.
fn load_config(args: &Args) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    let env_device = config.apply_env()?;

    if let Some(name) = &args.iface {
        config.interface.name = name.clone();
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(vid) = &args.vendor_id {
        config.discovery.vendor_id = vid.clone();
    }
    if let Some(framing) = args.framing {
        config.bridge.framing = framing;
    }

    config.validate()?;
    Ok((config, args.dev.clone().or(env_device)))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (config, device) = load_config(&args)?;

    if args.scan {
        return scan(&config);
    }

    let session = Session::establish(&LinuxHost, &config, device).context("Setup failed")?;
    info!(
        "Note: configure the address and routes of {} separately",
        session.interface()
    );

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    let bridge = tracker.spawn(session.run(running.clone()));
    tracker.close();
    info!("Bridge running... (Ctrl+C to stop)");

    let interrupted = tokio::select! {
        _ = sigint.recv() => true,
        _ = sigterm.recv() => true,
        _ = tracker.wait() => false,
    };

    if interrupted {
        info!("Stopping bridge...");
    }
    running.cancel();
    tracker.wait().await;

    let stats = bridge.await.context("bridge task panicked")??;
    info!(
        serial_to_iface_bytes = stats.serial_to_iface_bytes,
        serial_to_iface_frames = stats.serial_to_iface_frames,
        iface_to_serial_bytes = stats.iface_to_serial_bytes,
        iface_to_serial_frames = stats.iface_to_serial_frames,
        short_iface_writes = stats.short_iface_writes,
        "Bridge stopped"
    );
    Ok(())
}

/// Report what discovery sees without opening anything.
fn scan(config: &Config) -> anyhow::Result<()> {
    let scanner = DeviceScanner::new(&config.discovery)?;
    let scan = scanner.scan()?;

    println!(
        "Candidates in {} matching {}:",
        config.discovery.device_dir.display(),
        config.discovery.device_pattern
    );
    if scan.enumerated.is_empty() {
        println!("  (none)");
    }
    for device in &scan.identified {
        println!(
            "  {}: VID={} PID={}",
            device.path.display(),
            device.vendor_id,
            device.product_id
        );
    }
    for (path, reason) in &scan.skipped {
        println!("  {}: {reason}", path.display());
    }

    let vendor_id = &config.discovery.vendor_id;
    match tapbridge::transport::discovery::select(&scan.enumerated, &scan.identified, vendor_id) {
        Ok(selected) => {
            let how = match selected.selection {
                Selection::Matched => format!("vendor {vendor_id}"),
                Selection::Ambiguous { matches } => {
                    format!("first of {matches} devices with vendor {vendor_id}")
                }
                Selection::Fallback => format!("fallback, no device with vendor {vendor_id}"),
            };
            println!("Would use {} ({how})", selected.path.display());
        }
        Err(e) => println!("{e}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_hint_only_for_permission_errors() {
        let denied = anyhow::Error::new(Error::PermissionDenied("not root".into()));
        assert!(wants_root(&denied.context("Setup failed")));

        let no_tun = anyhow::Error::new(Error::DeviceUnavailable("/dev/net/tun".into()));
        assert!(!wants_root(&no_tun.context("Setup failed")));

        assert!(!wants_root(&anyhow::anyhow!("something else")));
    }
}
