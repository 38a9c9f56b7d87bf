//! AgentContext - what a worker gets to reach the rest of the fleet
//!
//! Cheap to clone: the protocol façade and gauges are shared with the
//! supervising agent.

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::message::MessageType;
use crate::protocol::AgentProtocol;

use super::types::{GaugeCell, ResourceGauges, WorkerConfig};

#[derive(Clone)]
pub struct AgentContext {
    config: Arc<WorkerConfig>,
    protocol: Arc<AgentProtocol>,
    gauges: Arc<GaugeCell>,
}

impl AgentContext {
    pub(crate) fn new(
        config: Arc<WorkerConfig>,
        protocol: Arc<AgentProtocol>,
        gauges: Arc<GaugeCell>,
    ) -> Self {
        Self {
            config,
            protocol,
            gauges,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Free-form setting from the worker config
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.config.config.get(key)
    }

    pub fn protocol(&self) -> &Arc<AgentProtocol> {
        &self.protocol
    }

    /// Publish memory / cpu readings; they ride along on the next heartbeat
    pub fn report_resources(&self, memory_usage: f64, cpu_usage: f64) {
        self.gauges.store(ResourceGauges {
            memory_usage,
            cpu_usage,
        });
    }

    /// Shorthand for a routed (receiver-less) send of `message_type`
    pub async fn emit(
        &self,
        message_type: impl Into<MessageType>,
        payload: Value,
    ) -> Result<Option<String>> {
        self.protocol
            .send(message_type, payload, None, Default::default())
            .await
    }
}
