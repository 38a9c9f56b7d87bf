//! Coordinator Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Health-monitor period (s)
    pub health_check_interval_secs: u64,
    /// Stats-collection period (s)
    pub stats_interval_secs: u64,
    /// System-monitoring period (s)
    pub system_check_interval_secs: u64,
    /// Pause after a failed or panicked loop iteration (s)
    pub loop_error_backoff_secs: u64,
    /// Consecutive unhealthy checks before a restart
    pub unhealthy_threshold: u32,
    /// A heartbeat older than this many heartbeat intervals is stale
    pub stale_heartbeat_multiplier: u32,
    /// Fleet size above which the system monitor warns
    pub max_agents: usize,
    /// How long one inbox poll waits on the coordinator mailbox (ms)
    pub inbox_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            stats_interval_secs: 60,
            system_check_interval_secs: 300,
            loop_error_backoff_secs: 10,
            unhealthy_threshold: 3,
            stale_heartbeat_multiplier: 3,
            max_agents: 50,
            inbox_timeout_ms: 1000,
        }
    }
}

impl CoordinatorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn system_check_interval(&self) -> Duration {
        Duration::from_secs(self.system_check_interval_secs)
    }

    pub fn loop_error_backoff(&self) -> Duration {
        Duration::from_secs(self.loop_error_backoff_secs)
    }

    pub fn inbox_timeout(&self) -> Duration {
        Duration::from_millis(self.inbox_timeout_ms)
    }
}
