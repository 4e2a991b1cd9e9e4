//! CLI entry point (A4).
//!
//! Parses `--config`/`--log-level`, loads the configuration, spins up
//! tracing, then hands off to [`gtbridge::bridge::Bridge`] until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use gtbridge::bridge::Bridge;
use gtbridge::config::BridgeConfig;
use gtbridge::tracing_init;

#[derive(Parser, Debug)]
#[command(name = "gtbridge", version, about = "DX-spot protocol bridge daemon")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long, default_value = "gtbridge.json")]
    config: PathBuf,

    /// Override the config's log_level (trace/debug/info/warn/error).
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match BridgeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let log_file = config.log_file.as_ref().map(PathBuf::from);
    let _tracing_guard = match tracing_init::init_tracing(level, log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fatal config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "fatal config error");
        return ExitCode::FAILURE;
    }

    info!(callsign = %config.callsign, client_id = %config.client_id, "starting gtbridge");

    let (running_tx, running_rx) = watch::channel(true);
    let (bridge, udp_rx) = Bridge::build(config).await;

    let shutdown_tx = running_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(false);
    });

    if let Err(e) = bridge.run(udp_rx, running_rx).await {
        error!(error = %e, "bridge exited with an error");
        return ExitCode::FAILURE;
    }

    info!("gtbridge stopped");
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
