//! plfm-vt relay
//!
//! Usage: `relay <proxy-port> <shell-port> <dest-host> [dest-port]`
//!
//! Exit codes:
//! - 0: dispatch loop stopped on SIGINT/SIGTERM
//! - 1: bad arguments or a zero listening port
//! - 2: a listening socket could not be opened

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_relay::{Args, Config, LogFormat, RelayServer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Usage: relay <proxy-port> <shell-port> <dest-host> [dest-port]");
            return ExitCode::from(e.exit_code());
        }
    };

    init_tracing(&config);

    info!("Starting plfm-vt relay");
    info!(
        proxy_addr = %config.relay.proxy_addr,
        shell_addr = %config.relay.shell_addr,
        dest = %config.relay.destination,
        "Configuration loaded"
    );

    let server = match RelayServer::bind(&config.relay).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to open listening socket");
            return ExitCode::from(e.exit_code());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Signal handling failed; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await;

    info!("Relay shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize tracing (prefer RUST_LOG, fall back to the configured level).
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    Ok(())
}
