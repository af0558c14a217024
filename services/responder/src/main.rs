//! tapra
//!
//! Router Advertisement responder for unnumbered tap interfaces.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tapra_responder::config::{Config, LogFormat};
use tapra_responder::monitor::spawn_link_monitor;
use tapra_responder::netlink::Netlink;
use tapra_responder::transport::SocketDialer;
use tapra_responder::Engine;

/// How long taps get to close after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting tapra");

    let filter = config.interface_filter()?;
    let advertisement = config.advertisement()?;
    info!(
        interface_regex = %config.interface_regex,
        interval_secs = advertisement.interval.as_secs(),
        router_lifetime = advertisement.router_lifetime,
        mtu = ?advertisement.mtu,
        "Configuration loaded"
    );

    let netlink = Netlink::connect().context("failed to open netlink connection")?;
    let kernel = Arc::new(netlink.clone());
    let engine = Engine::new(
        kernel.clone(),
        kernel,
        Arc::new(SocketDialer::new(netlink.clone())),
        advertisement,
    );

    let mut monitor = spawn_link_monitor(engine.clone(), netlink, filter);
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    // Without the monitor no new tap is ever picked up, so its end is fatal.
    let monitor_failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            None
        }
        result = &mut monitor => {
            match result {
                Ok(Ok(())) => {
                    warn!("Link monitor exited");
                    Some(anyhow!("link monitor exited"))
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Link monitor error");
                    Some(e.context("link monitor failed"))
                }
                Err(e) => {
                    error!(error = %e, "Link monitor task panicked");
                    Some(anyhow!("link monitor task panicked: {}", e))
                }
            }
        }
    };

    monitor.abort();

    info!(taps = engine.len().await, "Waiting for taps to shut down...");
    engine.shutdown(SHUTDOWN_GRACE).await;

    if let Some(e) = monitor_failure {
        return Err(e);
    }

    info!("tapra shutdown complete");
    Ok(())
}
