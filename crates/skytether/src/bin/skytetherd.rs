use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skytether::{Middleware, MiddlewareConfig};

#[derive(Parser, Debug)]
#[command(name = "skytetherd", about = "UDP drone middleware daemon")]
struct Args {
    /// Path to a TOML config file. Defaults to the user config dir's
    /// skytether/config.toml; a missing file either way falls back to
    /// defaults + env.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    remote_ip: Option<String>,

    #[arg(long)]
    remote_port: Option<u16>,

    #[arg(long)]
    local_port: Option<u16>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "skytetherd starting");

    let mut config = MiddlewareConfig::load(args.config.as_deref())?;
    if let Some(ip) = args.remote_ip {
        config.driver.remote_ip = ip;
    }
    if let Some(port) = args.remote_port {
        config.driver.remote_port = port;
    }
    if let Some(port) = args.local_port {
        config.driver.local_port = port;
    }

    let mw = Middleware::new(config);
    if !mw.start().await {
        warn!("initial handshake failed, continuing; heartbeat monitor will keep retrying");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    mw.shutdown().await;

    Ok(())
}
