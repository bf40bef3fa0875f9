//! MQTT Throttle Proxy
//!
//! Transparent TCP reverse proxy for MQTT traffic. Enforces per-client
//! token-bucket rate limits in front of a downstream broker and exposes
//! Prometheus metrics over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use mqtt_throttle::config::ProxyConfig;
use mqtt_throttle::http::{create_router, HttpState};
use mqtt_throttle::metrics::ProxyMetrics;
use mqtt_throttle::proxy::ProxyServer;

/// Rate-limiting MQTT reverse proxy.
#[derive(Parser)]
#[command(name = "mqtt-throttle")]
#[command(version)]
#[command(about = "MQTT reverse proxy that rate-limits clients before the broker")]
struct Cli {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port override
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Broker host override
    #[arg(short = 'b', long)]
    broker: Option<String>,

    /// Broker port override
    #[arg(short = 'P', long = "broker-port")]
    broker_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mqtt_throttle=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ProxyConfig::load_from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?
        }
        None => {
            info!("Using default configuration");
            ProxyConfig::default()
        }
    };

    config.apply_env();

    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(broker) = cli.broker {
        config.broker_host = broker;
    }
    if let Some(broker_port) = cli.broker_port {
        config.broker_port = broker_port;
    }

    config.validate().context("configuration rejected")?;

    info!(
        "Starting mqtt-throttle v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("Listen address: {}", config.listen_addr());
    info!("Broker address: {}", config.broker_addr());
    info!(
        "Rate limit: {} msg/sec (burst: {}, block: {}s)",
        config.max_messages_per_sec, config.burst_size, config.block_duration_sec
    );
    if !config.client_policies.is_empty() {
        info!("Client policy overrides: {}", config.client_policies.len());
    }

    let metrics = ProxyMetrics::new();

    // Metrics HTTP endpoint, on its own port and task.
    let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
    let http_router = create_router(HttpState {
        metrics: metrics.clone(),
    });
    let http_listener = TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {}", metrics_addr))?;
    tokio::spawn(async move {
        info!("Metrics endpoint listening on {}", metrics_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("Metrics endpoint failed: {}", e);
        }
    });

    let server = Arc::new(ProxyServer::new(config, metrics));

    // Stop the accept loop on SIGINT/SIGTERM; workers drain on their own.
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Received shutdown signal, stopping proxy");
        shutdown_server.stop();
    });

    server.run().await.context("proxy server failed")?;
    info!("Proxy stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
