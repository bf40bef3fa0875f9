//! Prometheus Metrics
//!
//! Name-keyed counter and gauge sink backed by a Prometheus registry.
//!
//! Connection workers and the accept loop report through
//! [`ProxyMetrics::increment_counter`] and [`ProxyMetrics::set_gauge`];
//! the HTTP endpoint renders the registry in Prometheus text format.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Counters written by the proxy core.
const COUNTERS: &[(&str, &str)] = &[
    ("total_connections", "Total client connections accepted"),
    ("allowed_messages", "Client chunks forwarded to the broker"),
    ("blocked_messages", "Client chunks dropped by the rate limiter"),
    ("client_disconnects", "Connection workers that finished forwarding"),
];

/// Gauges maintained by the proxy server.
const GAUGES: &[(&str, &str)] = &[
    ("active_connections", "Currently forwarding client connections"),
    ("unique_clients", "Rate-limiter buckets currently tracked"),
];

/// Metrics sink shared by the server and all connection workers.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Arc<Registry>,
    counters: Arc<Mutex<HashMap<String, IntCounter>>>,
    gauges: Arc<Mutex<HashMap<String, IntGauge>>>,
}

impl ProxyMetrics {
    /// Creates a metrics sink with the proxy's counters and gauges
    /// pre-registered.
    pub fn new() -> Self {
        let metrics = ProxyMetrics {
            registry: Arc::new(Registry::new()),
            counters: Arc::new(Mutex::new(HashMap::new())),
            gauges: Arc::new(Mutex::new(HashMap::new())),
        };

        {
            let mut counters = metrics.counters.lock().unwrap();
            for (name, help) in COUNTERS {
                Self::new_counter(&metrics.registry, &mut counters, name, help);
            }
            let mut gauges = metrics.gauges.lock().unwrap();
            for (name, help) in GAUGES {
                Self::new_gauge(&metrics.registry, &mut gauges, name, help);
            }
        }

        metrics
    }

    fn new_counter(
        registry: &Registry,
        counters: &mut HashMap<String, IntCounter>,
        name: &str,
        help: &str,
    ) -> IntCounter {
        let counter =
            IntCounter::with_opts(Opts::new(format!("proxy_{}_total", name), help)).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counters.insert(name.to_string(), counter.clone());
        counter
    }

    fn new_gauge(
        registry: &Registry,
        gauges: &mut HashMap<String, IntGauge>,
        name: &str,
        help: &str,
    ) -> IntGauge {
        let gauge = IntGauge::with_opts(Opts::new(format!("proxy_{}", name), help)).unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();
        gauges.insert(name.to_string(), gauge.clone());
        gauge
    }

    /// Increments the named counter, registering it on first use.
    pub fn increment_counter(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(counter) = counters.get(name) {
            counter.inc();
            return;
        }
        Self::new_counter(&self.registry, &mut counters, name, "Registered at runtime").inc();
    }

    /// Sets the named gauge, registering it on first use.
    pub fn set_gauge(&self, name: &str, value: i64) {
        let mut gauges = self.gauges.lock().unwrap();
        if let Some(gauge) = gauges.get(name) {
            gauge.set(value);
            return;
        }
        Self::new_gauge(&self.registry, &mut gauges, name, "Registered at runtime").set(value);
    }

    /// Current value of a counter; zero when it was never written.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .map(|counter| counter.get())
            .unwrap_or(0)
    }

    /// Current value of a gauge; zero when it was never written.
    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .lock()
            .unwrap()
            .get(name)
            .map(|gauge| gauge.get())
            .unwrap_or(0)
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preregistered_counters_start_at_zero() {
        let metrics = ProxyMetrics::new();

        assert_eq!(metrics.counter_value("total_connections"), 0);
        assert_eq!(metrics.counter_value("allowed_messages"), 0);
        assert_eq!(metrics.counter_value("blocked_messages"), 0);
        assert_eq!(metrics.counter_value("client_disconnects"), 0);
    }

    #[test]
    fn test_increment_counter() {
        let metrics = ProxyMetrics::new();

        metrics.increment_counter("allowed_messages");
        metrics.increment_counter("allowed_messages");
        metrics.increment_counter("blocked_messages");

        assert_eq!(metrics.counter_value("allowed_messages"), 2);
        assert_eq!(metrics.counter_value("blocked_messages"), 1);
    }

    #[test]
    fn test_unknown_counter_registered_on_first_use() {
        let metrics = ProxyMetrics::new();

        metrics.increment_counter("parse_misses");
        assert_eq!(metrics.counter_value("parse_misses"), 1);
    }

    #[test]
    fn test_set_gauge() {
        let metrics = ProxyMetrics::new();

        metrics.set_gauge("active_connections", 7);
        assert_eq!(metrics.gauge_value("active_connections"), 7);

        metrics.set_gauge("active_connections", 3);
        assert_eq!(metrics.gauge_value("active_connections"), 3);
    }

    #[test]
    fn test_encode_renders_text_format() {
        let metrics = ProxyMetrics::new();
        metrics.increment_counter("total_connections");
        metrics.set_gauge("unique_clients", 5);

        let text = metrics.encode();
        assert!(text.contains("proxy_total_connections_total 1"));
        assert!(text.contains("proxy_unique_clients 5"));
    }

    #[test]
    fn test_clones_share_state() {
        let metrics = ProxyMetrics::new();
        let clone = metrics.clone();

        clone.increment_counter("total_connections");
        assert_eq!(metrics.counter_value("total_connections"), 1);
    }
}
