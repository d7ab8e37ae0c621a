//! Lanlink CLI - trusted-device LAN sync.

mod commands;
mod ui;

use clap::{Parser, Subcommand};
use lanlink_core::protocol::DeviceType;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lanlink")]
#[command(about = "Trusted-device LAN sync", long_about = None)]
struct Cli {
    /// Device name to advertise
    #[arg(short, long, default_value_t = default_device_name())]
    name: String,

    /// Device class to advertise (PHONE, PC, TABLET, TV)
    #[arg(short = 't', long, default_value = "PC")]
    device_type: String,

    /// Data directory for identity and trust records
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// UDP discovery port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// TCP session port (0 = ephemeral)
    #[arg(short, long)]
    port: Option<u16>,

    /// Accept inbound pairings without asking
    #[arg(long)]
    auto_accept: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "lanlink-device".to_string())
}

#[derive(Subcommand)]
enum Commands {
    /// Start the lanlink service (default)
    Run,
    /// Show device info
    Info,
}

fn build_config(cli: &Cli) -> lanlink_core::Config {
    let mut config = lanlink_core::Config::default();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(port) = cli.discovery_port {
        config.discovery_port = port;
    }
    if let Some(port) = cli.port {
        config.tcp_port = port;
    }
    config.auto_accept = cli.auto_accept;
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lanlink=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli);
    let device_type = DeviceType::from_token(&cli.device_type.to_uppercase());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run_service(cli.name, device_type, config).await?,
        Commands::Info => commands::show_info(cli.name, device_type, config)?,
    }

    Ok(())
}
