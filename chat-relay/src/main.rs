use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{RelayConfig, RelayServer, cli::ServerArgs};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RelayConfig::from(ServerArgs::parse());
    let server = RelayServer::bind(config)
        .await
        .context("relay could not start")?;
    let addr = server.local_addr()?;
    info!("relay listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err.into());
    }

    Ok(())
}
