//! Proxy Configuration
//!
//! Defaults, optional YAML/JSON config file, and environment overrides.
//!
//! Precedence, lowest to highest: built-in defaults, config file,
//! `PROXY_*` environment variables, command-line flags (applied by the
//! binary). Validation runs once on the merged result.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::rate_limit::RateLimitPolicy;

/// Proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address the proxy listens on. `0.0.0.0` binds all interfaces.
    pub listen_address: String,
    /// Port the proxy listens on.
    pub listen_port: u16,
    /// Upstream MQTT broker host.
    pub broker_host: String,
    /// Upstream MQTT broker port.
    pub broker_port: u16,
    /// Default refill rate, messages per second per client.
    pub max_messages_per_sec: f64,
    /// Default burst capacity, messages.
    pub burst_size: u32,
    /// Default block duration in seconds. Zero drops without blocking.
    pub block_duration_sec: u64,
    /// Port for the Prometheus metrics HTTP endpoint.
    pub metrics_port: u16,
    /// Per-client policy overrides, keyed by MQTT Client Identifier.
    pub client_policies: HashMap<String, ClientPolicyConfig>,
}

/// Per-client override entry in the config file.
///
/// Unset fields inherit from the global policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientPolicyConfig {
    pub max_messages_per_sec: Option<f64>,
    pub burst_size: Option<u32>,
    pub block_duration_sec: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 1883,
            broker_host: "localhost".to_string(),
            broker_port: 1884,
            max_messages_per_sec: 10.0,
            burst_size: 20,
            block_duration_sec: 60,
            metrics_port: 9090,
            client_policies: HashMap::new(),
        }
    }
}

/// Configuration loading or validation failure.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config file: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl ProxyConfig {
    /// Loads configuration from a YAML or JSON file, chosen by extension.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            _ => Err(ConfigError::Parse(
                "unsupported config file format, use .yaml, .yml, or .json".to_string(),
            )),
        }
    }

    /// Applies `PROXY_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("PROXY_LISTEN_ADDRESS") {
            self.listen_address = val;
        }

        if let Ok(val) = std::env::var("PROXY_LISTEN_PORT") {
            if let Ok(parsed) = val.parse() {
                self.listen_port = parsed;
            }
        }

        if let Ok(val) = std::env::var("PROXY_BROKER_HOST") {
            self.broker_host = val;
        }

        if let Ok(val) = std::env::var("PROXY_BROKER_PORT") {
            if let Ok(parsed) = val.parse() {
                self.broker_port = parsed;
            }
        }

        if let Ok(val) = std::env::var("PROXY_MAX_MESSAGES_PER_SEC") {
            if let Ok(parsed) = val.parse() {
                self.max_messages_per_sec = parsed;
            }
        }

        if let Ok(val) = std::env::var("PROXY_BURST_SIZE") {
            if let Ok(parsed) = val.parse() {
                self.burst_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("PROXY_BLOCK_DURATION_SEC") {
            if let Ok(parsed) = val.parse() {
                self.block_duration_sec = parsed;
            }
        }

        if let Ok(val) = std::env::var("PROXY_METRICS_PORT") {
            if let Ok(parsed) = val.parse() {
                self.metrics_port = parsed;
            }
        }
    }

    /// Rejects configurations the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages_per_sec <= 0.0 {
            return Err(ConfigError::Invalid(
                "max_messages_per_sec must be positive".to_string(),
            ));
        }
        if self.burst_size == 0 {
            return Err(ConfigError::Invalid(
                "burst_size must be positive".to_string(),
            ));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid(
                "listen_port must be between 1 and 65535".to_string(),
            ));
        }
        if self.broker_port == 0 {
            return Err(ConfigError::Invalid(
                "broker_port must be between 1 and 65535".to_string(),
            ));
        }
        if self.broker_host.is_empty() {
            return Err(ConfigError::Invalid(
                "broker_host cannot be empty".to_string(),
            ));
        }
        for (client_id, policy) in &self.client_policies {
            if policy.max_messages_per_sec.is_some_and(|rate| rate <= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "client policy {:?}: max_messages_per_sec must be positive",
                    client_id
                )));
            }
            if policy.burst_size == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "client policy {:?}: burst_size must be positive",
                    client_id
                )));
            }
        }
        Ok(())
    }

    /// The default rate-limit policy from the global settings.
    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            refill_rate_per_sec: self.max_messages_per_sec,
            burst_capacity: self.burst_size,
            block_duration: Duration::from_secs(self.block_duration_sec),
        }
    }

    /// Resolves a per-client override against the global settings.
    pub fn client_policy(&self, override_entry: &ClientPolicyConfig) -> RateLimitPolicy {
        RateLimitPolicy {
            refill_rate_per_sec: override_entry
                .max_messages_per_sec
                .unwrap_or(self.max_messages_per_sec),
            burst_capacity: override_entry.burst_size.unwrap_or(self.burst_size),
            block_duration: Duration::from_secs(
                override_entry
                    .block_duration_sec
                    .unwrap_or(self.block_duration_sec),
            ),
        }
    }

    /// `host:port` address of the upstream broker.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }

    /// `host:port` address the proxy listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}
