use std::path::PathBuf;

use clap::Parser;
use toaster_lib::{config, serial};

/// Keeps a T-962 reflow oven on known firmware and streams its telemetry.
#[derive(Parser, Debug)]
#[command(name = "toaster", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, default_value = "toaster.toml")]
    config: PathBuf,

    /// Serial device, overrides the config file
    #[arg(short, long)]
    port: Option<String>,

    /// trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    if cli.list_ports {
        for port in serial::discover_ports()? {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!(
                    "{}\t{:04x}:{:04x}\t{}",
                    port.port_name,
                    vid,
                    pid,
                    port.product.as_deref().unwrap_or("")
                ),
                _ => println!("{}", port.port_name),
            }
        }
        return Ok(());
    }

    let mut config = config::load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.serial.path = port;
    }

    tracing::info!("Starting toaster {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Oven on {} @ {} baud", config.serial.path, config.serial.runtime_baud);

    toaster_lib::run(config).await
}
