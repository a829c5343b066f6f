#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
#![allow(clippy::upper_case_acronyms)]
use crate::error::{Error, Result};
use crate::host::{Backend, ClaimedInterface};
use crate::sequencer::ErrorPolicy;
use crate::transport::{EndpointIn, EndpointKind, EndpointOut};
use crate::webusb::{WebUSBReceiver, WebUSBSender};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{LevelFilter, error, info, warn};
use nusb::transfer::{Bulk, Interrupt};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;

mod ccid;
mod ccid_const;
mod ccid_proto;
mod error;
mod host;
mod sequencer;
mod transport;
mod webusb;

#[derive(Parser)]
#[command(name = "hosttest", version)]
#[command(about = "Exercise the LUFA CCID and WebUSB demo devices from the host")]
struct Cli {
    /// Write the log to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the power on / power off / slot status / transfer block script against the CCID demo
    Ccid {
        #[arg(long, value_enum, default_value = "nusb")]
        backend: Backend,

        /// Slot addressed by every command
        #[arg(long, default_value_t = 0)]
        slot: u8,

        /// Stop at the first failed transfer instead of logging it and carrying on
        #[arg(long)]
        abort_on_error: bool,

        /// Per-transfer timeout; unset or 0 waits forever
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Print interrupt reports from the WebUSB demo until Ctrl-C
    Webusb {
        #[arg(long, value_enum, default_value = "nusb")]
        backend: Backend,

        /// Report sent once polling has started, e.g. `1,2,3,4,5` or `0x01,0xFF`
        #[arg(long, value_delimiter = ',', value_parser = parse_byte)]
        send: Vec<u8>,

        /// Per-transfer timeout; unset or 0 waits forever
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
}

fn parse_byte(s: &str) -> std::result::Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

fn transfer_timeout(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.filter(|&ms| ms != 0).map(Duration::from_millis)
}

fn exit_status(e: &Error) -> u8 {
    match e {
        Error::DeviceNotFound { .. } => 1,
        _ => 2,
    }
}

/// Raises `shutdown` once `signal` fires. If the signal cannot be listened for, the
/// sender is held forever so the poller keeps running.
async fn forward_shutdown(
    shutdown: watch::Sender<bool>,
    signal: impl Future<Output = std::io::Result<()>>,
) {
    match signal.await {
        Ok(()) => {
            info!("Ctrl-C received, stopping");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            warn!("Unable to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env();
    if let Some(path) = log_file {
        let target = Box::new(File::create(path)?);
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();
    Ok(())
}

async fn ccid_session<I: EndpointIn, O: EndpointOut>(
    claimed: ClaimedInterface<I, O>,
    slot: u8,
    policy: ErrorPolicy,
) -> Result<()> {
    println!("Connected to device {}", claimed.identity);
    let (_, result) = ccid::run(claimed.input, claimed.output, slot, policy).await;
    Ok(result?)
}

async fn webusb_session<I: EndpointIn, O: EndpointOut>(
    claimed: ClaimedInterface<I, O>,
    send: &[u8],
) -> Result<()> {
    println!("Connected to device {}", claimed.identity);
    let (tx, rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tx, tokio::signal::ctrl_c()));
    let mut receiver = WebUSBReceiver::new(claimed.input);
    let mut sender = WebUSBSender::new(claimed.output);
    let (polled, _) = tokio::join!(receiver.poll(rx), async {
        if send.is_empty() {
            return;
        }
        match sender.send(send).await {
            Ok(written) => println!("Sent {} bytes", written),
            Err(e) => error!("{}", e),
        }
    });
    polled?;
    Ok(())
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Ccid {
            backend,
            slot,
            abort_on_error,
            timeout_ms,
        } => {
            let timeout = transfer_timeout(timeout_ms);
            let policy = match abort_on_error {
                true => ErrorPolicy::Abort,
                false => ErrorPolicy::Continue,
            };
            let (vid, pid, interface) = (
                ccid::CCID_VENDOR_ID,
                ccid::CCID_PRODUCT_ID,
                ccid::CCID_INTERFACE,
            );
            match backend {
                Backend::Nusb => {
                    let claimed = host::open_nusb::<Bulk>(vid, pid, interface, timeout).await?;
                    ccid_session(claimed, slot, policy).await
                }
                Backend::Rusb => {
                    let claimed =
                        host::open_rusb(vid, pid, interface, EndpointKind::Bulk, timeout)?;
                    ccid_session(claimed, slot, policy).await
                }
            }
        }
        Commands::Webusb {
            backend,
            send,
            timeout_ms,
        } => {
            let timeout = transfer_timeout(timeout_ms);
            let (vid, pid, interface) = (
                webusb::WEBUSB_VENDOR_ID,
                webusb::WEBUSB_PRODUCT_ID,
                webusb::WEBUSB_INTERFACE,
            );
            match backend {
                Backend::Nusb => {
                    let claimed =
                        host::open_nusb::<Interrupt>(vid, pid, interface, timeout).await?;
                    webusb_session(claimed, &send).await
                }
                Backend::Rusb => {
                    let claimed =
                        host::open_rusb(vid, pid, interface, EndpointKind::Interrupt, timeout)?;
                    webusb_session(claimed, &send).await
                }
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(2);
    }
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Error::DeviceNotFound { .. } = e {
                println!("No device found");
            }
            error!("{}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}
