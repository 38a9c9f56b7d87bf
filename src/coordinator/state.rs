//! Coordinator State - registry entries and fleet snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::SupervisedAgent;
use crate::bus::BusStats;

/// Coordinator-owned record of one running worker
#[derive(Clone)]
pub struct RegistryEntry {
    pub agent: SupervisedAgent,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive health checks that found the worker unhealthy
    pub unhealthy_checks: u32,
}

impl RegistryEntry {
    pub fn new(agent: SupervisedAgent) -> Self {
        let now = Utc::now();
        Self {
            agent,
            registered_at: now,
            last_heartbeat: now,
            unhealthy_checks: 0,
        }
    }

    /// True when the last heartbeat is older than `multiplier` heartbeat intervals
    pub fn is_stale(&self, now: DateTime<Utc>, multiplier: u32) -> bool {
        let interval = self.agent.config().heartbeat_interval * multiplier;
        match chrono::Duration::from_std(interval) {
            Ok(window) => now - self.last_heartbeat > window,
            Err(_) => false,
        }
    }
}

/// Fleet-wide view returned by `Coordinator::get_system_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub running: bool,
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_messages_processed: u64,
    pub uptime_secs: f64,
    pub registered_agent_types: Vec<String>,
}

/// One pass of the stats-collection loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_messages_processed: u64,
    pub total_errors: u64,
    pub bus: BusStats,
    pub collected_at: DateTime<Utc>,
}

/// What one health-monitor pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked: usize,
    /// Restart attempted for a stale heartbeat
    pub stale: Vec<String>,
    /// Restart attempted after repeated unhealthy checks
    pub unhealthy: Vec<String>,
    /// Attempts above that failed
    pub failed: Vec<String>,
}

impl HealthReport {
    pub fn restarted(&self) -> usize {
        self.stale.len() + self.unhealthy.len() - self.failed.len()
    }
}
