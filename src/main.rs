//! udpmqttgw - UDP to MQTT gateway
//!
//! Receives datagrams on a UDP port and republishes each one, unmodified,
//! on an MQTT topic.
//!
//! Module structure:
//! - `domain/` - Datagram and enumerated session settings
//! - `infra/` - CLI, config file, statistics
//! - `io/` - UDP socket and MQTT session
//! - `services/` - Forwarding loop

use anyhow::Context;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use udp_mqtt_gateway::infra::{Cli, Config, ConfigError};
use udp_mqtt_gateway::io::{DatagramSocket, Session};
use udp_mqtt_gateway::services::Forwarder;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(Cli::exit_code(&e));
        }
    };

    init_logging(cli.verbose);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_VERSION"),
        config_file = %cli.config.display(),
        "udpmqttgw starting"
    );

    match run(cli).await {
        Ok(()) => {
            info!("udpmqttgw shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

/// RUST_LOG wins; otherwise -v raises the level
fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_file(&cli.config)?.with_verbosity(cli.verbose);
    if config.verbosity() >= 1 {
        config.log();
    }

    let socket = DatagramSocket::bind(config.input_udp_port())
        .await
        .with_context(|| format!("could not bind UDP socket to port {}", config.input_udp_port()))?;

    let session = Session::connect(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let forwarder = Forwarder::new(&config, socket, session);
    forwarder.run(shutdown_rx).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "sigterm_handler_failed");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

/// Log a fatal error; validation problems are listed one per line
fn report_error(e: &anyhow::Error) {
    if let Some(ConfigError::Validation { problems }) = e.downcast_ref::<ConfigError>() {
        for problem in problems {
            error!("{}", problem);
        }
        error!("exiting, because of invalid configuration");
        return;
    }
    if let Some(ConfigError::Io { .. } | ConfigError::Syntax { .. } | ConfigError::Argument { .. }) =
        e.downcast_ref::<ConfigError>()
    {
        error!(error = %format!("{e:#}"), "exiting, because of an error parsing configuration");
        return;
    }
    error!(error = %format!("{e:#}"), "exiting");
}
