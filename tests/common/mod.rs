//! Common test utilities for proxy integration tests.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use mqtt_throttle::config::ProxyConfig;
use mqtt_throttle::metrics::ProxyMetrics;
use mqtt_throttle::proxy::ProxyServer;

/// Builds an MQTT 3.1.1 CONNECT packet with the given client id.
#[allow(dead_code)]
pub fn connect_packet(client_id: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x00, 0x04]);
    payload.extend_from_slice(b"MQTT");
    payload.push(0x04); // protocol level 4
    payload.push(0x02); // clean session
    payload.extend_from_slice(&[0x00, 0x3c]); // keep-alive 60s
    payload.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    payload.extend_from_slice(client_id.as_bytes());

    let mut packet = vec![0x10];
    packet.push(payload.len() as u8);
    packet.extend_from_slice(&payload);
    packet
}

/// Builds an MQTT 3.1.1 QoS 0 PUBLISH packet.
#[allow(dead_code)]
pub fn publish_packet(topic: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    payload.extend_from_slice(topic.as_bytes());
    payload.extend_from_slice(body);

    let mut packet = vec![0x30];
    packet.push(payload.len() as u8);
    packet.extend_from_slice(&payload);
    packet
}

/// In-process stand-in for the downstream broker.
///
/// Records every byte received; echoes them back when built with
/// [`MockBroker::echo`].
#[allow(dead_code)]
pub struct MockBroker {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<u8>>>,
    pub connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockBroker {
    /// Broker that records and echoes everything it receives.
    pub async fn echo() -> Self {
        Self::start(true, false).await
    }

    /// Broker that records, but never responds.
    pub async fn sink() -> Self {
        Self::start(false, false).await
    }

    /// Broker that closes the connection after the first chunk it reads.
    pub async fn close_after_first_read() -> Self {
        Self::start(false, true).await
    }

    async fn start(echo: bool, close_after_first: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task_received = received.clone();
        let task_connections = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                task_connections.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

                let received = task_received.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                received.lock().unwrap().extend_from_slice(&buf[..n]);
                                if echo && stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                                if close_after_first {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        MockBroker {
            addr,
            received,
            connections,
        }
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Running proxy bound to an ephemeral port.
#[allow(dead_code)]
pub struct TestProxy {
    pub server: Arc<ProxyServer>,
    pub addr: SocketAddr,
    pub metrics: ProxyMetrics,
    pub handle: JoinHandle<()>,
}

/// Starts a proxy forwarding to `broker` with the given rate settings.
#[allow(dead_code)]
pub async fn start_proxy(broker: SocketAddr, rate: f64, burst: u32, block_secs: u64) -> TestProxy {
    let config = ProxyConfig {
        max_messages_per_sec: rate,
        burst_size: burst,
        block_duration_sec: block_secs,
        ..ProxyConfig::default()
    };
    start_proxy_with_config(config, broker).await
}

/// Starts a proxy from a full configuration, pointed at `broker`.
#[allow(dead_code)]
pub async fn start_proxy_with_config(mut config: ProxyConfig, broker: SocketAddr) -> TestProxy {
    config.broker_host = broker.ip().to_string();
    config.broker_port = broker.port();
    config.validate().expect("test config must be valid");

    let metrics = ProxyMetrics::new();
    let server = Arc::new(ProxyServer::new(config, metrics.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serve_server = server.clone();
    let handle = tokio::spawn(async move {
        serve_server
            .serve(listener)
            .await
            .expect("proxy serve failed");
    });

    TestProxy {
        server,
        addr,
        metrics,
        handle,
    }
}

/// Polls `condition` until it holds or the timeout elapses.
#[allow(dead_code)]
pub async fn wait_until(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    condition()
}
