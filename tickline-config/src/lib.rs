//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

mod deserializer;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Store connection string; the only knob without a default.
    #[serde(default)]
    pub redis_url: String,
    /// Feed endpoints; `ws://`/`wss://` select the streaming ingestor,
    /// anything else is polled.
    #[serde(default, deserialize_with = "deserializer::comma_separated::deserialize")]
    pub feed_urls: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_anomaly_window_size")]
    pub anomaly_window_size: usize,
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mappings: MappingConfig,
}

/// Symbol and sector lookup tables, loaded once and read-only thereafter.
#[derive(Clone, Debug, Deserialize)]
pub struct MappingConfig {
    /// Feed symbol to canonical ticker.
    #[serde(default = "default_symbols")]
    pub symbols: HashMap<String, String>,
    /// Canonical ticker to sector label.
    #[serde(default = "default_sectors")]
    pub sectors: HashMap<String, String>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            sectors: default_sectors(),
        }
    }
}

impl AppConfig {
    /// Rejects configurations the pipeline cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.redis_url.trim().is_empty() {
            bail!("missing required config: REDIS_URL");
        }
        if self.feed_urls.is_empty() {
            bail!("missing required config: FEED_URLS (no feeds configured)");
        }
        if self.anomaly_window_size == 0 {
            bail!("ANOMALY_WINDOW_SIZE must be positive");
        }
        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be positive");
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_anomaly_window_size() -> usize {
    20
}

fn default_anomaly_threshold() -> f64 {
    3.0
}

fn default_max_workers() -> usize {
    50
}

fn default_batch_size() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    8082
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_symbols() -> HashMap<String, String> {
    [
        ("BTCUSD", "BTCUSD"),
        ("XBTUSD", "BTCUSD"),
        ("ETHUSD", "ETHUSD"),
        ("AAPL", "AAPL"),
        ("MSFT", "MSFT"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_sectors() -> HashMap<String, String> {
    [
        ("BTCUSD", "crypto"),
        ("ETHUSD", "crypto"),
        ("AAPL", "technology"),
        ("MSFT", "technology"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml` (optional)
/// 2. `config/local.toml` (optional, ignored in git)
/// 3. Environment variables (`REDIS_URL`, `FEED_URLS`, ...)
pub fn load_config() -> Result<AppConfig> {
    let base_path = Path::new("config");

    let config = Config::builder()
        .add_source(File::from(base_path.join("default.toml")).required(false))
        .add_source(File::from(base_path.join("local.toml")).required(false))
        .add_source(Environment::default().ignore_empty(true))
        .build()?;

    let app: AppConfig = config
        .try_deserialize()
        .map_err(|err: ConfigError| anyhow::Error::from(err))?;
    app.validate()?;
    Ok(app)
}
