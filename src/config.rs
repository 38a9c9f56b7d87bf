use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::bus::DEFAULT_CHANNEL_CAPACITY;
use crate::coordinator::CoordinatorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Key prefix of per-agent mailboxes
    pub mailbox_prefix: String,
    /// Channel receiving every broadcast message
    pub broadcast_channel: String,
    /// Key prefix for broadcast lookup entries
    pub lookup_prefix: String,
    /// Lifetime of a lookup entry when the message has no ttl
    pub lookup_ttl_secs: u64,
    /// Per-channel buffer before slow subscribers lag
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_prefix: "agent_queue:".to_string(),
            broadcast_channel: "agent_broadcast".to_string(),
            lookup_prefix: "broadcast:".to_string(),
            lookup_ttl_secs: 60,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file (console only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FLEET_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (FLEET_COORDINATOR__MAX_AGENTS, etc.)
            .add_source(
                Environment::with_prefix("FLEET")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bus.mailbox_prefix.is_empty() {
            errors.push("bus.mailbox_prefix must not be empty".to_string());
        }
        if self.bus.broadcast_channel.is_empty() {
            errors.push("bus.broadcast_channel must not be empty".to_string());
        }
        if self.bus.mailbox_prefix == self.bus.lookup_prefix {
            errors.push("bus.mailbox_prefix and bus.lookup_prefix must differ".to_string());
        }
        if self.bus.channel_capacity == 0 {
            errors.push("bus.channel_capacity must be positive".to_string());
        }

        let c = &self.coordinator;
        if c.health_check_interval_secs == 0 {
            errors.push("coordinator.health_check_interval_secs must be positive".to_string());
        }
        if c.stats_interval_secs == 0 {
            errors.push("coordinator.stats_interval_secs must be positive".to_string());
        }
        if c.system_check_interval_secs == 0 {
            errors.push("coordinator.system_check_interval_secs must be positive".to_string());
        }
        if c.unhealthy_threshold == 0 {
            errors.push("coordinator.unhealthy_threshold must be at least 1".to_string());
        }
        if c.stale_heartbeat_multiplier == 0 {
            errors.push("coordinator.stale_heartbeat_multiplier must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.broadcast_channel, "agent_broadcast");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = AppConfig::default();
        config.bus.broadcast_channel.clear();
        config.coordinator.unhealthy_threshold = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/fleet-config").unwrap();
        assert_eq!(config.coordinator.health_check_interval_secs, 30);
        assert_eq!(config.bus.lookup_ttl_secs, 60);
    }
}
