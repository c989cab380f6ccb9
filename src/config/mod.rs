//! Typed configuration.
//!
//! Deployment settings come from environment variables and are loaded once
//! at startup; required vars fail fast. Coordinator limits live in
//! [`NodeConfig`], which has working defaults and can be overridden from a
//! TOML file.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::JobClass;
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    pub dispatcher_url: String,
    pub node_id: String,
    pub dispatcher_token: Option<SecretString>,
    /// Durable store. When unset the node keeps its state in memory.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            dispatcher_url: required_var("DISPATCHER_URL")?,
            node_id: required_var("NODE_ID")?,
            dispatcher_token: std::env::var("DISPATCHER_TOKEN").ok().map(SecretString::from),
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Coordinator limits and timings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Admission queue capacity.
    pub queue_capacity: usize,
    /// Max simultaneously active interactive workers.
    pub interactive_ceiling: usize,
    /// Max simultaneously active batch workers.
    pub batch_ceiling: usize,
    /// Crawl jobs accepted per rate-limit window.
    pub daily_cap: u32,
    /// Rate-limit window length in seconds.
    pub refresh_interval_secs: u64,
    /// Worker lifespan before the job's own wait is added, in milliseconds.
    pub base_lifespan_ms: u64,
    /// Delay before the empty-queue teardown recheck, in seconds.
    pub drain_recheck_secs: u64,
    /// How long a job-scoped processing request may stay unanswered, in seconds.
    pub process_timeout_secs: u64,
    /// Timeout for a single cross-context send, in milliseconds.
    pub router_timeout_ms: u64,
    /// Slowest downlink, in Mbit/s, on which the node still connects.
    pub min_downlink_mbps: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 24,
            interactive_ceiling: 4,
            batch_ceiling: 4,
            daily_cap: 500,
            refresh_interval_secs: 24 * 60 * 60,
            base_lifespan_ms: 90_000,
            drain_recheck_secs: 15,
            process_timeout_secs: 10,
            router_timeout_ms: 5_000,
            min_downlink_mbps: 5.0,
        }
    }
}

impl NodeConfig {
    /// Load limits from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read node config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad node config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        if self.interactive_ceiling == 0 || self.batch_ceiling == 0 {
            return Err(Error::Config("worker ceilings must be at least 1".into()));
        }
        if self.daily_cap == 0 {
            return Err(Error::Config("daily_cap must be at least 1".into()));
        }
        Ok(())
    }

    /// Ceiling for a job class.
    pub fn ceiling(&self, class: JobClass) -> usize {
        match class {
            JobClass::Interactive => self.interactive_ceiling,
            JobClass::Batch => self.batch_ceiling,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn base_lifespan(&self) -> Duration {
        Duration::from_millis(self.base_lifespan_ms)
    }

    pub fn drain_recheck(&self) -> Duration {
        Duration::from_secs(self.drain_recheck_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn router_timeout(&self) -> Duration {
        Duration::from_millis(self.router_timeout_ms)
    }
}
