use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_serial::{FlowControl, SerialPortBuilderExt, SerialStream};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use serimux::config::MappingTable;
use serimux::{egress, ingress};

#[derive(Parser, Debug)]
#[command(name = "serimux")]
#[command(author, version, about = "Tunnel TCP sessions over a serial link", long_about = None)]
struct Cli {
    #[command(subcommand)]
    side: Side,
}

#[derive(Subcommand, Debug)]
enum Side {
    /// Accept TCP clients on the mapped local ports and carry them over
    /// the serial link.
    Ingress {
        /// Serial device path.
        #[arg(default_value = "COM1")]
        device: String,

        /// Baud rate.
        #[arg(default_value_t = 115_200)]
        baud: u32,

        /// Hardware (RTS/CTS) flow control; the literal `false` disables it.
        #[arg(default_value = "true")]
        flow_control: String,

        /// Port-mapping file.
        #[arg(default_value = "port-mapping.json")]
        mapping_file: PathBuf,
    },
    /// Dial the targets named by incoming frames and carry the replies
    /// back over the serial link.
    Egress {
        /// Serial device path.
        #[arg(default_value = "COM1")]
        device: String,

        /// Baud rate.
        #[arg(default_value_t = 115_200)]
        baud: u32,

        /// Hardware (RTS/CTS) flow control; the literal `false` disables it.
        #[arg(default_value = "true")]
        flow_control: String,
    },
}

/// `RUST_LOG` wins; otherwise the `DEBUG` / `VERBOSE` / `QUIET`
/// environment toggles pick the level. None of them affect the wire.
fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if std::env::var_os("VERBOSE").is_some() {
        "trace"
    } else if std::env::var_os("DEBUG").is_some() {
        "debug"
    } else if std::env::var_os("QUIET").is_some() {
        "warn"
    } else {
        "info"
    };
    EnvFilter::new(level)
}

fn open_serial(device: &str, baud: u32, flow_control: &str) -> Result<SerialStream> {
    let flow = if flow_control == "false" {
        FlowControl::None
    } else {
        FlowControl::Hardware
    };
    let stream = tokio_serial::new(device, baud)
        .flow_control(flow)
        .open_native_async()
        .with_context(|| format!("opening serial device {}", device))?;
    info!(device, baud, flow = ?flow, "serial link open");
    Ok(stream)
}

#[tokio::main]
async fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.side {
        Side::Ingress {
            device,
            baud,
            flow_control,
            mapping_file,
        } => {
            let mappings = MappingTable::load(&mapping_file)?;
            let serial = open_serial(&device, baud, &flow_control)?;
            ingress::run(serial, mappings).await
        }
        Side::Egress {
            device,
            baud,
            flow_control,
        } => {
            let serial = open_serial(&device, baud, &flow_control)?;
            egress::run(serial).await
        }
    }
}

fn main() {
    fmt()
        .with_env_filter(log_filter())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "fatal");
            1
        }
    };
    std::process::exit(code);
}
