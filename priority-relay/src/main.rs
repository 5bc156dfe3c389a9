use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use priority_relay::{
    cli::Cli,
    server::{Relay, shutdown_signal},
};

fn init_tracing(event_log: Option<&Path>) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The event log is append-only so restarts keep earlier history.
    let file_layer = match event_log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open event log {}", path.display()))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.event_log().map(|path| path.as_path()))?;

    let listener = match TcpListener::bind(cli.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %cli.listen, error = %err, "failed to bind");
            return Err(err).with_context(|| format!("failed to bind {}", cli.listen));
        }
    };

    let relay = Relay::new(listener, cli.settings());
    let signal = shutdown_signal();
    let addr = relay.local_addr()?;
    info!("relay listening on {}", addr);

    relay.run_until(signal).await
}
