//! Worker configuration, status and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{FleetError, Result};

/// Default heartbeat period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default processing-failure budget before a self-restart
pub const DEFAULT_MAX_ERRORS: u64 = 10;
/// Default pause between stop and start during a restart
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Error,
    Stopped,
    /// Between the stop and start halves of a restart
    Restarting,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Stopped => write!(f, "stopped"),
            AgentStatus::Restarting => write!(f, "restarting"),
        }
    }
}

/// Externally supplied resource readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGauges {
    pub memory_usage: f64,
    pub cpu_usage: f64,
}

/// Lock-free holder for the latest gauges
#[derive(Debug, Default)]
pub(crate) struct GaugeCell {
    memory_bits: AtomicU64,
    cpu_bits: AtomicU64,
}

impl GaugeCell {
    pub fn store(&self, gauges: ResourceGauges) {
        self.memory_bits
            .store(gauges.memory_usage.to_bits(), Ordering::Relaxed);
        self.cpu_bits.store(gauges.cpu_usage.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> ResourceGauges {
        ResourceGauges {
            memory_usage: f64::from_bits(self.memory_bits.load(Ordering::Relaxed)),
            cpu_usage: f64::from_bits(self.cpu_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Per-worker settings, fixed once the worker is registered
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub agent_type: String,
    pub heartbeat_interval: Duration,
    pub max_errors: u64,
    pub restart_delay: Duration,
    /// Free-form settings for the worker implementation
    pub config: HashMap<String, Value>,
}

impl WorkerConfig {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_errors: DEFAULT_MAX_ERRORS,
            restart_delay: DEFAULT_RESTART_DELAY,
            config: HashMap::new(),
        }
    }

    /// Build from a control-command style map. `heartbeat_interval` and
    /// `restart_delay` are seconds (fractions allowed), `max_errors` a count.
    /// The whole map is kept as the free-form config.
    pub fn from_parameters(
        agent_id: &str,
        agent_type: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<Self> {
        let mut config = Self::new(agent_id, agent_type);

        if let Some(value) = parameters.get("heartbeat_interval") {
            config.heartbeat_interval = seconds(value, "heartbeat_interval")?;
        }
        if let Some(value) = parameters.get("restart_delay") {
            config.restart_delay = seconds(value, "restart_delay")?;
        }
        if let Some(value) = parameters.get("max_errors") {
            config.max_errors = value.as_u64().ok_or_else(|| {
                FleetError::Validation(format!("max_errors must be a non-negative integer, got {value}"))
            })?;
        }

        config.config = parameters;
        config.validate()?;
        Ok(config)
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_errors(mut self, max_errors: u64) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_setting(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(FleetError::Validation("agent_id must not be empty".into()));
        }
        if self.agent_type.trim().is_empty() {
            return Err(FleetError::Validation("agent_type must not be empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(FleetError::Validation(format!(
                "{}: heartbeat_interval must be positive",
                self.agent_id
            )));
        }
        if self.max_errors == 0 {
            return Err(FleetError::Validation(format!(
                "{}: max_errors must be at least 1",
                self.agent_id
            )));
        }
        Ok(())
    }
}

fn seconds(value: &Value, field: &str) -> Result<Duration> {
    value
        .as_f64()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| {
            FleetError::Validation(format!("{field} must be a non-negative number of seconds, got {value}"))
        })
}

/// Read-only snapshot of a supervised worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub uptime_secs: f64,
    pub messages_processed: u64,
    pub error_count: u64,
    pub restart_count: u64,
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub started_at: Option<DateTime<Utc>>,
}
