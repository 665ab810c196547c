// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the remote cluster service.
//!
//! Configuration is read once at service start and passed to
//! [`ServiceContext::new()`](crate::ServiceContext::new). There is no
//! hot-reload: the snapshot handed out by `ServiceContext::config()` never
//! changes for the lifetime of the context.
//!
//! # Quick Start
//!
//! ```rust
//! use remote_cluster::config::ServiceConfig;
//!
//! let config = ServiceConfig {
//!     local_node_id: "node-1".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ServiceConfig
//! ├── local_node_id: String        # This node's ID (for logs)
//! ├── delivery: DeliveryConfig     # Retry, backoff, dead letters, throttling
//! ├── heartbeat: HeartbeatConfig   # Remote ping task
//! ├── store: StoreConfig           # SQLite persistence
//! ├── logging: LoggingConfig       # Level and format
//! └── shutdown: ShutdownConfig     # Stop timeout and in-flight grace
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "local_node_id": "eu.node.berlin-1",
//!   "delivery": { "max_attempts": 8, "initial_backoff": "500ms", "max_backoff": "5m" },
//!   "heartbeat": { "ping_interval": "1m", "online_threshold": "5m" },
//!   "store": { "sqlite_path": "/var/lib/app/remote_clusters.db" }
//! }
//! ```

use crate::error::{RemoteClusterError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ServiceContext::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// The identity of the local node running this service.
    pub local_node_id: String,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.node.default".to_string(),
            delivery: DeliveryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a config with fast retries and timeouts for tests.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            delivery: DeliveryConfig::for_testing(),
            heartbeat: HeartbeatConfig {
                enabled: false,
                ..Default::default()
            },
            store: StoreConfig::in_memory(),
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
            shutdown: ShutdownConfig {
                timeout: "2s".to_string(),
                grace: "200ms".to_string(),
            },
        }
    }

    /// Parse a config from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RemoteClusterError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.local_node_id.trim().is_empty() {
            return Err(RemoteClusterError::Config(
                "local_node_id must not be empty".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(RemoteClusterError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.backoff_factor < 1.0 {
            return Err(RemoteClusterError::Config(format!(
                "delivery.backoff_factor must be >= 1.0, got {}",
                self.delivery.backoff_factor
            )));
        }
        if self.delivery.initial_backoff_duration() > self.delivery.max_backoff_duration() {
            return Err(RemoteClusterError::Config(
                "delivery.initial_backoff exceeds delivery.max_backoff".to_string(),
            ));
        }
        if self.delivery.max_concurrent_sends == 0 {
            return Err(RemoteClusterError::Config(
                "delivery.max_concurrent_sends must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a humantime duration string, falling back on invalid input.
fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryConfig: per-remote delivery loops
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Failed attempts after which a task is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failure (e.g. "1s").
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    /// Ceiling for exponential backoff (e.g. "5m").
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// Multiplier applied per failed attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Timeout for one send through the transport.
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,

    /// How long a loop with an empty queue lingers before exiting.
    #[serde(default = "default_idle_loop_timeout")]
    pub idle_loop_timeout: String,

    /// Maximum dead letters retained (oldest evicted first).
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Maximum sends in flight across all remotes.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    /// Throttle outbound sends across all remotes.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained sends per second when throttled.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when throttled.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_backoff() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_send_timeout() -> String {
    "30s".to_string()
}

fn default_idle_loop_timeout() -> String {
    "5m".to_string()
}

fn default_dead_letter_capacity() -> usize {
    10_000
}

fn default_max_concurrent_sends() -> usize {
    64
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: "1s".to_string(),
            max_backoff: "5m".to_string(),
            backoff_factor: 2.0,
            send_timeout: "30s".to_string(),
            idle_loop_timeout: "5m".to_string(),
            dead_letter_capacity: 10_000,
            max_concurrent_sends: 64,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl DeliveryConfig {
    /// Fast retries for tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: "10ms".to_string(),
            max_backoff: "100ms".to_string(),
            backoff_factor: 2.0,
            send_timeout: "500ms".to_string(),
            idle_loop_timeout: "5s".to_string(),
            dead_letter_capacity: 1000,
            max_concurrent_sends: 16,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }

    pub fn initial_backoff_duration(&self) -> Duration {
        parse_or(&self.initial_backoff, Duration::from_secs(1))
    }

    pub fn max_backoff_duration(&self) -> Duration {
        parse_or(&self.max_backoff, Duration::from_secs(300))
    }

    pub fn send_timeout_duration(&self) -> Duration {
        parse_or(&self.send_timeout, Duration::from_secs(30))
    }

    pub fn idle_loop_timeout_duration(&self) -> Duration {
        parse_or(&self.idle_loop_timeout, Duration::from_secs(300))
    }

    /// Backoff schedule for failed deliveries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_backoff_duration(),
            max_delay: self.max_backoff_duration(),
            backoff_factor: self.backoff_factor,
        }
    }

    /// Rate limit configuration, `None` when throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HeartbeatConfig: remote ping task
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote heartbeat configuration.
///
/// While this node is leader, every enabled remote is pinged each
/// `ping_interval`; a successful ping refreshes `last_ping_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ping_interval")]
    pub ping_interval: String,

    /// A remote is online if it answered a ping within this window.
    #[serde(default = "default_online_threshold")]
    pub online_threshold: String,
}

fn default_ping_interval() -> String {
    "1m".to_string()
}

fn default_online_threshold() -> String {
    "5m".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval: "1m".to_string(),
            online_threshold: "5m".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval_duration(&self) -> Duration {
        parse_or(&self.ping_interval, Duration::from_secs(60))
    }

    pub fn online_threshold_duration(&self) -> Duration {
        parse_or(&self.online_threshold, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database for remote cluster records.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "remote_clusters.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LoggingConfig / ShutdownConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Logger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "remote_cluster=debug".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default = "default_false")]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for all delivery loops to exit.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout: String,

    /// Time an in-flight send gets to finish after stop is signaled.
    #[serde(default = "default_shutdown_grace")]
    pub grace: String,
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

fn default_shutdown_grace() -> String {
    "5s".to_string()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: "10s".to_string(),
            grace: "5s".to_string(),
        }
    }
}

impl ShutdownConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(10))
    }

    /// Grace for in-flight sends, never longer than the overall timeout.
    pub fn grace_duration(&self) -> Duration {
        parse_or(&self.grace, Duration::from_secs(5)).min(self.timeout_duration())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
