use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

pub const POOL_MAX_SIZE_KEY: &str = "pool.max_size";
pub const POOL_MIN_IDLE_KEY: &str = "pool.min_idle";
pub const POOL_IDLE_TIMEOUT_KEY: &str = "pool.idle_timeout_ms";
pub const POOL_MAX_LIFETIME_KEY: &str = "pool.max_lifetime_ms";
pub const POOL_CONNECTION_TIMEOUT_KEY: &str = "pool.connection_timeout_ms";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of concurrent sessions across all pools.
    pub max_sessions: Option<usize>,
    /// Session idle timeout in seconds.
    pub session_timeout_seconds: Option<u64>,
    /// Log format: "compact" or "json".
    pub log_format: String,
    /// Optional SQL executed once when a pool opens its database.
    pub init_sql: Option<String>,

    pub pool_max_size: u32,
    pub pool_min_idle: u32,
    pub pool_idle_timeout_ms: u64,
    pub pool_max_lifetime_ms: u64,
    pub pool_connection_timeout_ms: u64,
    /// Upper bound on a pool acquisition, independent of the pool's own timeout.
    pub acquire_hard_timeout_ms: u64,
    /// Largest in-memory size of one materialised query result.
    pub max_result_bytes: usize,

    /// Rows per result-set block when the client does not ask for a size.
    pub row_block_size: usize,
    pub max_row_block_size: usize,
    /// Largest LOB payload carried by a single data block.
    pub lob_block_size: usize,
    /// Binary cells up to this many bytes are inlined instead of registered as LOBs.
    pub lob_inline_threshold: usize,

    /// Consecutive failures that open the circuit for one operation fingerprint.
    pub breaker_failure_threshold: u32,
    /// Cool-down before an open circuit lets a trial call through.
    pub breaker_open_ms: u64,

    pub slow_query_threshold_ms: u64,
    pub metrics_history_size: usize,

    pub status_enabled: bool,
    pub status_host: String,
    pub status_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1059,
            max_sessions: Some(200),
            session_timeout_seconds: Some(1800),
            log_format: "compact".to_string(),
            init_sql: None,
            pool_max_size: 20,
            pool_min_idle: 2,
            pool_idle_timeout_ms: 600_000,
            pool_max_lifetime_ms: 1_800_000,
            pool_connection_timeout_ms: 10_000,
            acquire_hard_timeout_ms: 15_000,
            max_result_bytes: 256 * 1024 * 1024,
            row_block_size: 100,
            max_row_block_size: 10_000,
            lob_block_size: 1024 * 1024,
            lob_inline_threshold: 4096,
            breaker_failure_threshold: 3,
            breaker_open_ms: 60_000,
            slow_query_threshold_ms: 1_000,
            metrics_history_size: 200,
            status_enabled: false,
            status_host: "127.0.0.1".to_string(),
            status_port: 1060,
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("SQLTUNNEL"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: ServerConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    pub fn acquire_hard_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_hard_timeout_ms)
    }

    pub fn breaker_open_duration(&self) -> Duration {
        Duration::from_millis(self.breaker_open_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_max_size == 0 {
            anyhow::bail!("pool_max_size must be at least 1");
        }
        if self.row_block_size == 0 || self.max_row_block_size < self.row_block_size {
            anyhow::bail!("row_block_size must be non-zero and not exceed max_row_block_size");
        }
        if self.lob_block_size == 0 {
            anyhow::bail!("lob_block_size must be non-zero");
        }
        if self.max_result_bytes == 0 {
            anyhow::bail!("max_result_bytes must be non-zero");
        }
        if self.breaker_failure_threshold == 0 {
            anyhow::bail!("breaker_failure_threshold must be at least 1");
        }
        if self.acquire_hard_timeout_ms == 0
            || self.pool_connection_timeout_ms == 0
            || self.pool_idle_timeout_ms == 0
            || self.pool_max_lifetime_ms == 0
        {
            anyhow::bail!("pool and acquisition timeouts must be non-zero");
        }
        Ok(())
    }

    /// Pool defaults before any client overrides are applied.
    pub fn pool_defaults(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_max_size,
            min_idle: self.pool_min_idle.min(self.pool_max_size),
            idle_timeout: Duration::from_millis(self.pool_idle_timeout_ms),
            max_lifetime: Duration::from_millis(self.pool_max_lifetime_ms),
            connection_timeout: Duration::from_millis(self.pool_connection_timeout_ms),
        }
    }
}

/// Sizing and timing of one routed pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_idle: u32,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub connection_timeout: Duration,
}

impl PoolSettings {
    /// Apply client-supplied overrides from the connect properties.
    pub fn with_overrides(mut self, props: &HashMap<String, String>) -> Result<Self, ServerError> {
        if let Some(max) = parse_override::<u32>(props, POOL_MAX_SIZE_KEY)? {
            if max == 0 {
                return Err(ServerError::InvalidRequest(format!(
                    "{POOL_MAX_SIZE_KEY} must be at least 1"
                )));
            }
            self.max_size = max;
        }
        if let Some(min_idle) = parse_override::<u32>(props, POOL_MIN_IDLE_KEY)? {
            self.min_idle = min_idle;
        }
        if let Some(timeout) = parse_timeout_override(props, POOL_IDLE_TIMEOUT_KEY)? {
            self.idle_timeout = timeout;
        }
        if let Some(timeout) = parse_timeout_override(props, POOL_MAX_LIFETIME_KEY)? {
            self.max_lifetime = timeout;
        }
        if let Some(timeout) = parse_timeout_override(props, POOL_CONNECTION_TIMEOUT_KEY)? {
            self.connection_timeout = timeout;
        }
        self.min_idle = self.min_idle.min(self.max_size);
        Ok(self)
    }
}

fn parse_override<T: std::str::FromStr>(
    props: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ServerError> {
    match props.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ServerError::InvalidRequest(format!("invalid value {raw:?} for {key}"))
        }),
    }
}

fn parse_timeout_override(
    props: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Duration>, ServerError> {
    match parse_override::<u64>(props, key)? {
        Some(0) => Err(ServerError::InvalidRequest(format!(
            "{key} must be non-zero"
        ))),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
        None => Ok(None),
    }
}
