//! Configuration management for the httpq delivery service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use httpq_delivery::{
    client::ClientConfig, DEFAULT_DELIVERY_TIMEOUT_MS, DEFAULT_EXECUTION_WINDOW_MS,
    DEFAULT_MAIN_BATCH_SIZE, DEFAULT_RETRY_BATCH_SIZE, DEFAULT_WORKER_MULTIPLIER,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "httpq.toml";

/// Runtime settings of the httpq binary.
///
/// Environment variables win over `httpq.toml`, which wins over the
/// built-in defaults. The retry curve and the attempt ceiling are fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Postgres URL (`DATABASE_URL`).
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Upper bound of the connection pool (`DATABASE_MAX_CONNECTIONS`).
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    /// Idle connections kept open (`DATABASE_MIN_CONNECTIONS`).
    #[serde(default = "default_min_connections")]
    pub database_min_connections: u32,
    /// Seconds to wait for a pooled connection (`DATABASE_CONNECTION_TIMEOUT`).
    #[serde(default = "default_acquire_timeout")]
    pub database_connection_timeout: u64,

    /// Delivery workers per available core (`WORKER_POOL_MULTIPLIER`).
    #[serde(default = "default_worker_multiplier")]
    pub worker_pool_multiplier: usize,
    /// Main queue claim size (`MAIN_BATCH_SIZE`).
    #[serde(default = "default_main_batch_size")]
    pub main_batch_size: i64,
    /// Retry queue claim size (`RETRY_BATCH_SIZE`).
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: i64,
    /// Target spacing of dequeue cycles (`EXECUTION_WINDOW_MS`).
    #[serde(default = "default_execution_window_ms")]
    pub execution_window_ms: u64,
    /// Hard timeout of one attempt (`DELIVERY_TIMEOUT_MS`).
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Daily partitions kept before today (`PARTITION_PAST_DAYS`).
    #[serde(default = "default_partition_days")]
    pub partition_past_days: u32,
    /// Daily partitions kept from today on (`PARTITION_FUTURE_DAYS`).
    #[serde(default = "default_partition_days")]
    pub partition_future_days: u32,

    /// Grace period after a shutdown signal (`SHUTDOWN_TIMEOUT_SECONDS`).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// Fallback tracing filter (`RUST_LOG`).
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Reads and validates the layered configuration.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Delivery client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..ClientConfig::default()
        }
    }

    /// Spacing between dequeue cycles.
    pub fn execution_window(&self) -> Duration {
        Duration::from_millis(self.execution_window_ms)
    }

    /// Grace period for shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Database URL safe to log: the password is replaced by `***`.
    pub fn database_url_masked(&self) -> String {
        let url = &self.database_url;
        let scheme_end = url.find("://").map_or(0, |i| i + 3);
        let Some(at) = url[scheme_end..].rfind('@').map(|i| i + scheme_end) else {
            return url.clone();
        };
        match url[scheme_end..at].find(':') {
            Some(colon) => format!("{}***{}", &url[..=scheme_end + colon], &url[at..]),
            None => url.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!(
                "database_min_connections ({}) exceeds database_max_connections ({})",
                self.database_min_connections,
                self.database_max_connections
            );
        }

        if self.database_connection_timeout == 0 {
            anyhow::bail!("database_connection_timeout must be greater than 0");
        }

        if self.worker_pool_multiplier == 0 {
            anyhow::bail!("worker_pool_multiplier must be greater than 0");
        }

        if self.main_batch_size <= 0 || self.retry_batch_size <= 0 {
            anyhow::bail!("batch sizes must be greater than 0");
        }

        if self.execution_window_ms == 0 {
            anyhow::bail!("execution_window_ms must be greater than 0");
        }

        if self.delivery_timeout_ms == 0 {
            anyhow::bail!("delivery_timeout_ms must be greater than 0");
        }

        if self.shutdown_timeout_seconds == 0 {
            anyhow::bail!("shutdown_timeout_seconds must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            worker_pool_multiplier: default_worker_multiplier(),
            main_batch_size: default_main_batch_size(),
            retry_batch_size: default_retry_batch_size(),
            execution_window_ms: default_execution_window_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            partition_past_days: default_partition_days(),
            partition_future_days: default_partition_days(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/httpq".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_worker_multiplier() -> usize {
    DEFAULT_WORKER_MULTIPLIER
}

fn default_main_batch_size() -> i64 {
    DEFAULT_MAIN_BATCH_SIZE
}

fn default_retry_batch_size() -> i64 {
    DEFAULT_RETRY_BATCH_SIZE
}

fn default_execution_window_ms() -> u64 {
    DEFAULT_EXECUTION_WINDOW_MS
}

fn default_delivery_timeout_ms() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_MS
}

fn default_partition_days() -> u32 {
    7
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,httpq=debug".to_string()
}
