pub mod config;
pub mod mqtt;
pub mod wake;

use crate::config::BridgeConfig;
use crate::mqtt::request_handler::RequestHandler;
use crate::wake::{UdpTransmitter, WakeDispatcher};
use color_eyre::{eyre::WrapErr, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    info!("Starting wake-on-lan bridge");

    // Missing or malformed settings end the process before any connection
    let config = BridgeConfig::load()
        .await
        .wrap_err("Unable to load configuration")?;
    info!(
        "Bridging {} on {} to {} broadcast target(s)",
        config.mqtt.topic,
        config.mqtt.broker,
        config.targets.len()
    );

    let dispatcher = WakeDispatcher::new(Arc::new(UdpTransmitter));
    let handler = Arc::new(RequestHandler::new(dispatcher, config.targets));

    mqtt::run_bridge(config.mqtt, handler, wait_for_signal())
        .await
        .wrap_err("Bridge stopped")?;

    info!("Shutdown complete");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolves on SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => info!("Signal received: SIGINT"),
                        Err(e) => {
                            error!("Unable to listen for SIGINT: {}", e);
                            terminate.recv().await;
                            info!("Signal received: SIGTERM");
                        }
                    },
                    _ = terminate.recv() => info!("Signal received: SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Unable to listen for SIGTERM: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Signal received: SIGINT"),
        Err(e) => {
            error!("Unable to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
