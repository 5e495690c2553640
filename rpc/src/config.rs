//! Messenger configuration loaded from TOML files by the demo binaries.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::messenger::MessengerBuilder;

/// Messenger configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessengerConfig {
    /// Messenger name, used in log lines and thread names.
    #[serde(default = "default_name")]
    pub name: String,

    /// Number of reactor threads.
    #[serde(default = "default_num_reactors")]
    pub num_reactors: usize,

    /// Idle timeout for server-side connections, in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub connection_keepalive_ms: u64,

    /// Coarse timer period of each reactor loop, in milliseconds.
    #[serde(default = "default_granularity_ms")]
    pub coarse_timer_granularity_ms: u64,

    /// Cap on server-side connection negotiation, in milliseconds.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub server_negotiation_timeout_ms: u64,

    /// Worker threads performing blocking negotiation handshakes.
    #[serde(default = "default_negotiation_threads")]
    pub negotiation_threads: usize,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set (e.g. "info", "rpc=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include thread names in log output.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            thread_names: true,
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        MessengerConfig {
            name: default_name(),
            num_reactors: default_num_reactors(),
            connection_keepalive_ms: default_keepalive_ms(),
            coarse_timer_granularity_ms: default_granularity_ms(),
            server_negotiation_timeout_ms: default_negotiation_timeout_ms(),
            negotiation_threads: default_negotiation_threads(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: MessengerConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.num_reactors == 0 {
            return Err("num_reactors must be at least 1".into());
        }
        if self.coarse_timer_granularity_ms == 0 {
            return Err("coarse_timer_granularity_ms must be nonzero".into());
        }
        if self.connection_keepalive_ms < self.coarse_timer_granularity_ms {
            return Err(format!(
                "connection_keepalive_ms ({}) must be at least coarse_timer_granularity_ms ({})",
                self.connection_keepalive_ms, self.coarse_timer_granularity_ms
            )
            .into());
        }
        Ok(())
    }

    /// Map onto a [`MessengerBuilder`].
    pub fn builder(&self) -> MessengerBuilder {
        MessengerBuilder::new(&self.name)
            .num_reactors(self.num_reactors)
            .connection_keepalive_time(Duration::from_millis(self.connection_keepalive_ms))
            .coarse_timer_granularity(Duration::from_millis(self.coarse_timer_granularity_ms))
            .server_negotiation_timeout(Duration::from_millis(self.server_negotiation_timeout_ms))
            .negotiation_threads(self.negotiation_threads)
    }
}

// Default value functions

fn default_name() -> String {
    "messenger".to_string()
}

fn default_num_reactors() -> usize {
    4
}

fn default_keepalive_ms() -> u64 {
    65_000
}

fn default_granularity_ms() -> u64 {
    100
}

fn default_negotiation_timeout_ms() -> u64 {
    3_000
}

fn default_negotiation_threads() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
