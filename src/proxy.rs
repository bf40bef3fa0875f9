//! Proxy Server
//!
//! Accept loop, worker spawning, periodic rate-limiter cleanup, and
//! cooperative shutdown.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{error, info};

use crate::config::ProxyConfig;
use crate::forwarder::{handle_client, ForwarderDeps};
use crate::metrics::ProxyMetrics;
use crate::rate_limit::RateLimiter;

/// How often the accept loop runs rate-limiter cleanup.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Wakeup granularity for accepting and shutdown observation.
const ACCEPT_WAKEUP: Duration = Duration::from_secs(1);

/// The proxy server: owns the shared rate limiter and metrics, accepts
/// client connections, and hands each one to a detached worker.
pub struct ProxyServer {
    config: ProxyConfig,
    rate_limiter: Arc<RateLimiter>,
    metrics: ProxyMetrics,
    running: Arc<AtomicBool>,
    active_connections: Arc<AtomicI64>,
}

impl ProxyServer {
    /// Creates a server from validated configuration, installing any
    /// per-client policy overrides into the rate limiter.
    pub fn new(config: ProxyConfig, metrics: ProxyMetrics) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.default_policy()));
        for (client_id, entry) in &config.client_policies {
            rate_limiter.set_client_policy(client_id, config.client_policy(entry));
        }

        ProxyServer {
            config,
            rate_limiter,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicI64::new(0)),
        }
    }

    /// The shared rate limiter.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    /// Binds the configured listen address and runs the accept loop.
    ///
    /// Bind failure is returned to the caller without entering the
    /// loop. Returns after [`ProxyServer::stop`], once the listening
    /// socket is closed; in-flight workers drain on their own.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    ///
    /// Accepts with a 1-second wakeup so a cleared running flag is
    /// observed promptly, and runs rate-limiter cleanup every five
    /// minutes of wall time.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Proxy listening on {}", listener.local_addr()?);
        info!("Forwarding to broker at {}", self.config.broker_addr());
        self.running.store(true, Ordering::Relaxed);

        let mut last_cleanup = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            match timeout(ACCEPT_WAKEUP, listener.accept()).await {
                Ok(Ok((stream, _addr))) => {
                    self.metrics.increment_counter("total_connections");
                    let deps = ForwarderDeps {
                        rate_limiter: self.rate_limiter.clone(),
                        metrics: self.metrics.clone(),
                        broker_addr: self.config.broker_addr(),
                        running: self.running.clone(),
                        active_connections: self.active_connections.clone(),
                    };
                    tokio::spawn(handle_client(stream, deps));
                }
                Ok(Err(e)) => {
                    if self.running.load(Ordering::Relaxed) {
                        error!("Accept failed: {}", e);
                    }
                }
                Err(_) => {
                    // Wakeup to re-check the running flag.
                }
            }

            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                let removed = self.rate_limiter.cleanup_expired();
                if removed > 0 {
                    info!("Cleaned up {} idle rate-limiter buckets", removed);
                }
                let stats = self.rate_limiter.stats();
                self.metrics
                    .set_gauge("unique_clients", stats.total_buckets as i64);
                last_cleanup = Instant::now();
            }
        }

        info!("Proxy stopped accepting connections");
        Ok(())
    }

    /// Requests shutdown: the accept loop exits at its next wakeup and
    /// closes the listening socket; workers observe the flag within a
    /// second and finish their pumps.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
