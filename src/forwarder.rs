//! Connection Forwarding
//!
//! Per-connection worker: identifies the client from its first bytes,
//! opens the upstream broker connection, and pumps bytes both ways.
//! Client-to-broker chunks pass through the rate limiter; chunks it
//! denies are dropped without being written. Broker-to-client traffic
//! is always forwarded unchanged.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connect::{parse_client_id, ClientInfo};
use crate::metrics::ProxyMetrics;
use crate::rate_limit::RateLimiter;

/// Window peeked off a new connection to find the CONNECT packet.
const PEEK_WINDOW: usize = 1024;

/// A peek shorter than this cannot hold a CONNECT fixed header plus
/// the fields in front of the Client Identifier; the connection is
/// abandoned without contacting the broker.
const MIN_CONNECT_BYTES: usize = 10;

/// I/O window for each forwarding direction.
const CHUNK_SIZE: usize = 4096;

/// Shared handles a connection worker needs from the server.
#[derive(Clone)]
pub struct ForwarderDeps {
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: ProxyMetrics,
    pub broker_addr: String,
    pub running: Arc<AtomicBool>,
    pub active_connections: Arc<AtomicI64>,
}

/// Handles one accepted client connection to completion.
///
/// Workers are detached; every exit path cleans up after itself and
/// never affects the server or sibling connections.
pub async fn handle_client(stream: TcpStream, deps: ForwarderDeps) {
    let peer_ip = match stream.peer_addr() {
        Ok(addr) => addr.ip(),
        Err(e) => {
            debug!("Dropping connection without peer address: {}", e);
            return;
        }
    };

    // Identify the client from a non-destructive peek. The bytes stay
    // queued on the socket and flow to the broker through the pump.
    let mut peek_buf = [0u8; PEEK_WINDOW];
    let peeked = match stream.peek(&mut peek_buf).await {
        Ok(n) if n >= MIN_CONNECT_BYTES => n,
        Ok(n) => {
            debug!("Abandoning connection from {}: {} bytes peeked", peer_ip, n);
            return;
        }
        Err(e) => {
            debug!("Abandoning connection from {}: peek failed: {}", peer_ip, e);
            return;
        }
    };

    let info = ClientInfo::resolve(peer_ip, parse_client_id(&peek_buf[..peeked]));
    info!("New client: {} (ID: {})", info.ip, info.display_id());

    let broker = match TcpStream::connect(&deps.broker_addr).await {
        Ok(broker) => broker,
        Err(e) => {
            warn!(
                "Cannot reach broker {} for client {}: {}",
                deps.broker_addr,
                info.display_id(),
                e
            );
            return;
        }
    };

    deps.active_connections.fetch_add(1, Ordering::Relaxed);
    deps.metrics
        .set_gauge("active_connections", deps.active_connections.load(Ordering::Relaxed));

    pump(stream, broker, &info, &deps).await;

    let active = deps.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    deps.metrics.set_gauge("active_connections", active);
    deps.metrics.increment_counter("client_disconnects");
    info!("Client disconnected: {} (ID: {})", info.ip, info.display_id());
}

/// Bidirectional pump between the client and broker sockets.
///
/// Runs until either side closes or errors, a write fails, or the
/// server's running flag clears. The 1-second wakeup bounds how long
/// shutdown can go unobserved. Both sockets close on return.
async fn pump(client: TcpStream, broker: TcpStream, info: &ClientInfo, deps: &ForwarderDeps) {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut broker_rd, mut broker_wr) = broker.into_split();

    let mut client_buf = [0u8; CHUNK_SIZE];
    let mut broker_buf = [0u8; CHUNK_SIZE];

    while deps.running.load(Ordering::Relaxed) {
        tokio::select! {
            read = client_rd.read(&mut client_buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };

                if deps.rate_limiter.allow(&info.ip, info.limiter_id()) {
                    deps.metrics.increment_counter("allowed_messages");
                    if broker_wr.write_all(&client_buf[..n]).await.is_err() {
                        break;
                    }
                } else {
                    deps.metrics.increment_counter("blocked_messages");
                    debug!(
                        "Rate limit exceeded for {} ({}), dropping {} bytes",
                        info.display_id(),
                        info.ip,
                        n
                    );
                }
            }
            read = broker_rd.read(&mut broker_buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };

                if client_wr.write_all(&broker_buf[..n]).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                // Wakeup to re-check the running flag.
            }
        }
    }
}
