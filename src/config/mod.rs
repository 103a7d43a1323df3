use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::client::TimeoutPolicy;
use crate::pool::{CircuitBreakerConfig, PoolConfig, PoolPolicy};

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum leased connections per route
    #[serde(default = "default_max_per_route")]
    pub max_per_route: usize,

    /// Maximum leased connections across all routes
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Admission discipline: strict or lax
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Maximum idle time before a connection is retired, in seconds
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Maximum connection age, in seconds
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

fn default_max_per_route() -> usize {
    5
}

fn default_max_total() -> usize {
    10
}

fn default_policy() -> String {
    "strict".to_string()
}

fn default_max_idle_secs() -> u64 {
    90
}

fn default_max_lifetime_secs() -> u64 {
    600
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_per_route: default_max_per_route(),
            max_total: default_max_total(),
            policy: default_policy(),
            max_idle_secs: default_max_idle_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_per_route: self.max_per_route,
            max_total: self.max_total,
            policy: match self.policy.as_str() {
                "lax" => PoolPolicy::Lax,
                _ => PoolPolicy::Strict,
            },
            max_idle_time: Duration::from_secs(self.max_idle_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Failure rate threshold in percent
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    /// Slow-call rate threshold in percent
    #[serde(default = "default_slow_rate")]
    pub slow_call_rate_threshold: f64,

    /// Calls at least this long count as slow, in milliseconds
    #[serde(default = "default_slow_duration_ms")]
    pub slow_call_duration_ms: u64,

    /// Samples required before rates are trusted
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Outcome window capacity
    #[serde(default = "default_window_size")]
    pub sliding_window_size: usize,

    /// Rejection period after the circuit opens, in milliseconds
    #[serde(default = "default_wait_in_open_ms")]
    pub wait_duration_in_open_ms: u64,

    /// Probe calls admitted while half-open
    #[serde(default = "default_permitted_half_open")]
    pub permitted_calls_in_half_open: usize,

    /// Longest the circuit may sit half-open waiting for probe verdicts, in
    /// milliseconds
    #[serde(default = "default_max_wait_half_open_ms")]
    pub max_wait_duration_in_half_open_ms: u64,
}

fn default_failure_rate() -> f64 {
    50.0
}

fn default_slow_rate() -> f64 {
    100.0
}

fn default_slow_duration_ms() -> u64 {
    60_000
}

fn default_minimum_calls() -> usize {
    10
}

fn default_window_size() -> usize {
    50
}

fn default_wait_in_open_ms() -> u64 {
    30_000
}

fn default_permitted_half_open() -> usize {
    3
}

fn default_max_wait_half_open_ms() -> u64 {
    60_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate(),
            slow_call_rate_threshold: default_slow_rate(),
            slow_call_duration_ms: default_slow_duration_ms(),
            minimum_calls: default_minimum_calls(),
            sliding_window_size: default_window_size(),
            wait_duration_in_open_ms: default_wait_in_open_ms(),
            permitted_calls_in_half_open: default_permitted_half_open(),
            max_wait_duration_in_half_open_ms: default_max_wait_half_open_ms(),
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: self.failure_rate_threshold,
            slow_call_rate_threshold: self.slow_call_rate_threshold,
            slow_call_duration_threshold: Duration::from_millis(self.slow_call_duration_ms),
            minimum_calls: self.minimum_calls,
            sliding_window_size: self.sliding_window_size,
            wait_duration_in_open: Duration::from_millis(self.wait_duration_in_open_ms),
            permitted_calls_in_half_open: self.permitted_calls_in_half_open,
            max_wait_duration_in_half_open: Duration::from_millis(
                self.max_wait_duration_in_half_open_ms,
            ),
        }
    }
}

/// Default timeouts applied to requests that do not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Transport connect timeout, in milliseconds
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Pool lease timeout, in milliseconds
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Pool-scoped byte-gap timeout, in milliseconds; absent means reads may
    /// block indefinitely
    #[serde(default = "default_inter_byte_ms")]
    pub inter_byte_ms: Option<u64>,

    /// Request-scoped byte-gap timeout, in milliseconds; overrides
    /// `inter_byte_ms` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_ms: Option<u64>,

    /// Hard wall-clock ceiling, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_ms: Option<u64>,
}

fn default_connect_ms() -> u64 {
    3_000
}

fn default_lease_ms() -> u64 {
    3_000
}

fn default_inter_byte_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            lease_ms: default_lease_ms(),
            inter_byte_ms: default_inter_byte_ms(),
            response_ms: None,
            hard_ms: None,
        }
    }
}

impl TimeoutSettings {
    pub fn to_timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            connect_timeout: Duration::from_millis(self.connect_ms),
            lease_timeout: Duration::from_millis(self.lease_ms),
            inter_byte_timeout: self.inter_byte_ms.map(Duration::from_millis),
            response_timeout: self.response_ms.map(Duration::from_millis),
            hard_timeout: self.hard_ms.map(Duration::from_millis),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Default request timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ClientConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables, all optional:
/// - WIREPOOL_MAX_PER_ROUTE / WIREPOOL_MAX_TOTAL
/// - WIREPOOL_POOL_POLICY (strict | lax)
/// - WIREPOOL_CONNECT_TIMEOUT_MS / WIREPOOL_LEASE_TIMEOUT_MS
/// - WIREPOOL_INTER_BYTE_TIMEOUT_MS / WIREPOOL_RESPONSE_TIMEOUT_MS
/// - WIREPOOL_HARD_TIMEOUT_MS
pub fn load_from_env() -> Result<ClientConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = ClientConfig::new();

    if let Ok(value) = std::env::var("WIREPOOL_MAX_PER_ROUTE") {
        config.pool.max_per_route = value
            .parse()
            .context("WIREPOOL_MAX_PER_ROUTE is not a number")?;
    }

    if let Ok(value) = std::env::var("WIREPOOL_MAX_TOTAL") {
        config.pool.max_total = value.parse().context("WIREPOOL_MAX_TOTAL is not a number")?;
    }

    if let Ok(value) = std::env::var("WIREPOOL_POOL_POLICY") {
        config.pool.policy = value;
    }

    if let Ok(value) = std::env::var("WIREPOOL_CONNECT_TIMEOUT_MS") {
        if let Ok(ms) = value.parse() {
            config.timeouts.connect_ms = ms;
        }
    }

    if let Ok(value) = std::env::var("WIREPOOL_LEASE_TIMEOUT_MS") {
        if let Ok(ms) = value.parse() {
            config.timeouts.lease_ms = ms;
        }
    }

    if let Ok(value) = std::env::var("WIREPOOL_INTER_BYTE_TIMEOUT_MS") {
        if let Ok(ms) = value.parse() {
            config.timeouts.inter_byte_ms = Some(ms);
        }
    }

    if let Ok(value) = std::env::var("WIREPOOL_RESPONSE_TIMEOUT_MS") {
        if let Ok(ms) = value.parse() {
            config.timeouts.response_ms = Some(ms);
        }
    }

    if let Ok(value) = std::env::var("WIREPOOL_HARD_TIMEOUT_MS") {
        if let Ok(ms) = value.parse() {
            config.timeouts.hard_ms = Some(ms);
        }
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<ClientConfig> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}
