//! Payload shapes the fleet itself understands, plus send options

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentStatus, ResourceGauges};
use crate::message::MessagePriority;

/// Agent id heartbeats and control commands are addressed to
pub const COORDINATOR_ID: &str = "coordinator";

/// Heartbeat lifetime: a heartbeat older than this is useless to the monitor
pub const HEARTBEAT_TTL_SECS: i64 = 60;

/// Liveness signal a worker sends to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
    pub memory_usage: f64,
    pub cpu_usage: f64,
}

impl HeartbeatPayload {
    pub fn new(agent_id: &str, status: AgentStatus, gauges: ResourceGauges) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status,
            timestamp: Utc::now(),
            memory_usage: gauges.memory_usage,
            cpu_usage: gauges.cpu_usage,
        }
    }
}

/// Optional knobs for `AgentProtocol::send`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: MessagePriority,
    pub ttl: Option<Duration>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub max_retries: Option<u32>,
    pub broadcast: bool,
}

impl SendOptions {
    pub fn with_priority(priority: MessagePriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, agent_id: impl Into<String>) -> Self {
        self.reply_to = Some(agent_id.into());
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}
