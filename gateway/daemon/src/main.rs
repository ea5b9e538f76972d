//! Gateway Daemon
//!
//! Standalone process hosting the task scheduling and execution engine.
//! Loads the gateway TOML config, probes the configured providers, starts
//! the orchestrator, and runs the retention sweeper until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Default config path (<config dir>/gateway/gateway.toml)
//! gateway-daemon
//!
//! # Explicit config
//! gateway-daemon --config /etc/gateway/gateway.toml
//!
//! # With verbose logging
//! gateway-daemon --log debug
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_CONFIG`: config file path (same as `--config`)
//! - `GATEWAY_LOG`: tracing filter (same as `--log`)
//! - `GATEWAY_*`: individual setting overrides (see gateway-core)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use gateway_core::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "gateway-daemon", version, about = "Text-generation gateway engine")]
struct Args {
    /// Config file path
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Tracing filter directive (overrides the config file)
    #[arg(long)]
    log: Option<String>,

    /// Retention sweep interval in seconds
    #[arg(long, default_value_t = 300)]
    sweep_interval_secs: u64,
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.or_else(GatewayConfig::default_path);
    let config =
        GatewayConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let filter = args.log.unwrap_or_else(|| config.log_filter.0.clone());
    init_tracing(&filter);

    info!(pid = std::process::id(), "starting gateway daemon");
    if let Some(path) = &config_path {
        info!(path = %path.display(), "configuration loaded");
    }
    if config.providers.is_empty() {
        warn!("no providers configured; every task will fail to route");
    }

    let mut gateway = Gateway::from_config(&config).context("failed to build gateway")?;

    for (provider, healthy) in gateway.healthcheck().await {
        if healthy {
            info!(provider, "provider healthy");
        } else {
            warn!(provider, "provider unreachable at startup");
        }
    }

    gateway.start();
    info!("orchestrator running");

    let sweep_interval = Duration::from_secs(args.sweep_interval_secs.max(1));
    let store = gateway.store().clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                info!(purged, "expired tasks swept");
            }
        }
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    sweeper.abort();
    gateway.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
