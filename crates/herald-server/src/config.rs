//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`HERALD_CONFIG`, or the first of the default paths that exists)
//! - Environment variables (`HERALD__SECTION__KEY`, e.g. `HERALD__AUTH__HOST`)

use anyhow::{Context, Result};
use herald_core::{AppServerConfig, EngineConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log every authorization and webhook outcome.
    #[serde(default)]
    pub dev_mode: bool,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Application server configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Pub/sub backend configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Application server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the application server. The scheme is always taken from here.
    #[serde(default = "default_auth_host")]
    pub host: String,

    /// Channel authorization path.
    #[serde(default = "default_auth_endpoint")]
    pub auth_endpoint: String,

    /// Lifecycle webhook path.
    #[serde(default = "default_event_endpoint")]
    pub event_endpoint: String,

    /// Send requests to the host the client connected through.
    #[serde(default = "default_true")]
    pub forward_request_host: bool,

    /// Verify the application server's TLS certificate.
    #[serde(default)]
    pub verify_tls: bool,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,

    /// Send connected/disconnected webhooks.
    #[serde(default = "default_true")]
    pub lifecycle_webhooks: bool,
}

/// Pub/sub backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Channel patterns to subscribe to.
    #[serde(default = "default_redis_patterns")]
    pub patterns: Vec<String>,

    /// Prefix stripped from pub/sub channel names.
    #[serde(default)]
    pub key_prefix: String,

    /// Delay before resubscribing after the subscription drops, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_auth_host() -> String {
    "http://localhost".to_string()
}

fn default_auth_endpoint() -> String {
    "/broadcasting/auth".to_string()
}

fn default_event_endpoint() -> String {
    "/broadcasting/event".to_string()
}

fn default_auth_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_patterns() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            redis: RedisConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            host: default_auth_host(),
            auth_endpoint: default_auth_endpoint(),
            event_endpoint: default_event_endpoint(),
            forward_request_host: true,
            verify_tls: false,
            timeout_ms: default_auth_timeout(),
            lifecycle_webhooks: true,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            patterns: default_redis_patterns(),
            key_prefix: String::new(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: default_max_subscriptions(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// an environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("HERALD_CONFIG") {
            Ok(path) => Some(PathBuf::from(shellexpand::tilde(&path).as_ref())),
            Err(_) => find_config_file(),
        };
        Self::load_from(file.as_deref())
    }

    /// Load configuration from a specific file (if given) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("HERALD")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("redis.patterns")
                .try_parsing(true),
        );

        let source = match file {
            Some(path) => path.display().to_string(),
            None => "environment".to_string(),
        };

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .with_context(|| format!("Failed to load configuration from {source}"))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Settings for the application server client.
    #[must_use]
    pub fn app_server(&self) -> AppServerConfig {
        AppServerConfig {
            host: self.auth.host.clone(),
            auth_endpoint: self.auth.auth_endpoint.clone(),
            event_endpoint: self.auth.event_endpoint.clone(),
            forward_request_host: self.auth.forward_request_host,
            verify_tls: self.auth.verify_tls,
            timeout: Duration::from_millis(self.auth.timeout_ms),
            dev_mode: self.dev_mode,
        }
    }

    /// Settings for the channel engine.
    #[must_use]
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            lifecycle_webhooks: self.auth.lifecycle_webhooks,
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
