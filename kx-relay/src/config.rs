//! Configuration loading for kx-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and every field has a default, so an empty file is valid.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for kx-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Public HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared cache backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Channel lifecycle configuration.
    #[serde(default)]
    pub channels: ChannelsConfig,
    /// Per-IP admission limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Blacklist synchronization.
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    /// Admin endpoints (health, metrics).
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Public HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the relay (default: 0.0.0.0:5000).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Where `GET /` redirects after a successful backend probe.
    #[serde(default = "default_root_redirect")]
    pub root_redirect: String,
    /// Take the client IP from `X-Forwarded-For` instead of the socket peer.
    /// Only safe behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_proxy_headers: bool,
    /// Maximum request body size in bytes (default: 64KB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

/// Shared cache backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Redis URL shared by every relay instance. When unset, or when the
    /// connection fails at startup, an in-process map is used instead.
    pub redis_url: Option<String>,
    /// Prefix prepended to every key (default: "keyexchange").
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Channel lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Channel lifetime in seconds, refreshed on every write (default: 300).
    #[serde(default = "default_channel_ttl")]
    pub ttl_secs: u64,
    /// Successful reads after which a channel is torn down (default: 6).
    #[serde(default = "default_max_gets")]
    pub max_gets: u64,
    /// Length of generated channel ids (default: 4).
    #[serde(default = "default_channel_id_length")]
    pub channel_id_length: usize,
    /// Required length of the `X-KeyExchange-Id` header (default: 256).
    #[serde(default = "default_client_id_length")]
    pub client_id_length: usize,
}

/// Per-IP admission limits.
///
/// A threshold of 0 disables that counter.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Requests from one IP before it is blacklisted (default: 1000).
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// 400/404/405 responses to one IP before it is blacklisted (default: 20).
    #[serde(default = "default_max_bad_requests")]
    pub max_bad_requests: u32,
    /// How long a promoted IP stays blacklisted, in seconds.
    /// 0 keeps it until removed explicitly (default: 600).
    #[serde(default = "default_blacklist_ttl")]
    pub blacklist_ttl_secs: u64,
    /// Number of IPs whose counters are tracked; least recently seen IPs
    /// are evicted first (default: 1000).
    #[serde(default = "default_tracked_ips")]
    pub tracked_ips: usize,
}

/// Blacklist synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistConfig {
    /// Seconds between two sync cycles (default: 5).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// CAS attempts per publish before giving up (default: 10).
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: usize,
}

/// Admin endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bind address for `/health` and `/metrics`. Disabled when unset.
    pub bind_address: Option<String>,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_root_redirect() -> String {
    "https://services.mozilla.com".to_string()
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_key_prefix() -> String {
    "keyexchange".to_string()
}

fn default_channel_ttl() -> u64 {
    300
}

fn default_max_gets() -> u64 {
    6
}

fn default_channel_id_length() -> usize {
    4
}

fn default_client_id_length() -> usize {
    kx_types::CLIENT_ID_LENGTH
}

fn default_max_requests() -> u32 {
    1000
}

fn default_max_bad_requests() -> u32 {
    20
}

fn default_blacklist_ttl() -> u64 {
    600
}

fn default_tracked_ips() -> usize {
    1000
}

fn default_sync_interval() -> u64 {
    5
}

fn default_max_publish_attempts() -> usize {
    10
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            root_redirect: default_root_redirect(),
            trust_proxy_headers: false,
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_channel_ttl(),
            max_gets: default_max_gets(),
            channel_id_length: default_channel_id_length(),
            client_id_length: default_client_id_length(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            max_bad_requests: default_max_bad_requests(),
            blacklist_ttl_secs: default_blacklist_ttl(),
            tracked_ips: default_tracked_ips(),
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            max_publish_attempts: default_max_publish_attempts(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ChannelsConfig {
    /// Channel lifetime as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl LimitsConfig {
    /// Blacklist entry lifetime for promoted IPs.
    pub fn blacklist_ttl(&self) -> Option<Duration> {
        match self.blacklist_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl BlacklistConfig {
    /// Sync period as a Duration (never zero).
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
