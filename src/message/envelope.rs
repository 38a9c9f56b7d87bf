//! Envelope - the record every producer hands to the bus
//!
//! `Envelope` is the shared wire shape for point-to-point and broadcast
//! traffic. `ProtocolMessage` extends it with the routing metadata the
//! protocol façade needs (version, correlation, retries, broadcast flag);
//! the extra fields are flattened next to the envelope fields so a plain
//! `Envelope` can always be decoded from a `ProtocolMessage` document.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::types::{MessagePriority, MessageType};
use crate::error::{FleetError, Result};

/// Protocol version stamped on every outbound message
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default retry budget for routed messages
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: String,
    /// Absent for broadcast traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "ttl_seconds", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub priority: MessagePriority,
}

impl Envelope {
    /// True when `now` is past `timestamp + ttl`. Never expires without a
    /// ttl, or when the deadline falls outside the representable date range.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl.and_then(|ttl| self.timestamp.checked_add_signed(ttl)) {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }
}

/// Envelope plus protocol metadata, as carried for routed traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub broadcast: bool,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl ProtocolMessage {
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn message_type(&self) -> &MessageType {
        &self.envelope.message_type
    }

    pub fn sender(&self) -> &str {
        &self.envelope.sender
    }

    pub fn receiver(&self) -> Option<&str> {
        self.envelope.receiver.as_deref()
    }

    pub fn payload(&self) -> &Value {
        &self.envelope.payload
    }

    pub fn priority(&self) -> MessagePriority {
        self.envelope.priority
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.envelope.is_expired(now)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Copy for another delivery attempt, or `None` once the budget is spent.
    /// Keeps id and correlation; the timestamp is refreshed so the ttl window
    /// restarts.
    pub fn next_attempt(&self) -> Option<ProtocolMessage> {
        if !self.can_retry() {
            return None;
        }
        let mut retry = self.clone();
        retry.retry_count += 1;
        retry.envelope.timestamp = Utc::now();
        Some(retry)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Builder that enforces envelope validity rules
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message_type: MessageType,
    sender: String,
    receiver: Option<String>,
    payload: Value,
    priority: MessagePriority,
    ttl: Option<Duration>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    max_retries: u32,
    broadcast: bool,
}

impl MessageBuilder {
    pub fn new(message_type: impl Into<MessageType>, sender: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            sender: sender.into(),
            receiver: None,
            payload: Value::Null,
            priority: MessagePriority::Normal,
            ttl: None,
            correlation_id: None,
            reply_to: None,
            max_retries: DEFAULT_MAX_RETRIES,
            broadcast: false,
        }
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn maybe_receiver(mut self, receiver: Option<String>) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn maybe_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl_secs(self, secs: i64) -> Self {
        self.ttl(Duration::seconds(secs))
    }

    pub fn correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn build(self) -> Result<ProtocolMessage> {
        if self.broadcast && self.receiver.is_some() {
            return Err(FleetError::Validation(format!(
                "{} message from {} cannot have both a receiver and the broadcast flag",
                self.message_type, self.sender
            )));
        }
        if let Some(ttl) = self.ttl {
            if ttl < Duration::zero() {
                return Err(FleetError::Validation(format!(
                    "ttl must not be negative (got {}ms)",
                    ttl.num_milliseconds()
                )));
            }
        }
        if self.message_type.as_str().is_empty() {
            return Err(FleetError::Validation("message type must not be empty".into()));
        }
        if self.sender.trim().is_empty() {
            return Err(FleetError::Validation("sender must not be empty".into()));
        }

        Ok(ProtocolMessage {
            envelope: Envelope {
                id: Uuid::new_v4().to_string(),
                message_type: self.message_type,
                sender: self.sender,
                receiver: self.receiver,
                payload: self.payload,
                timestamp: Utc::now(),
                ttl: self.ttl,
                priority: self.priority,
            },
            version: default_version(),
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            retry_count: 0,
            max_retries: self.max_retries,
            broadcast: self.broadcast,
        })
    }
}

/// ttl on the wire: fractional seconds, finite and non-negative
mod ttl_seconds {
    use chrono::Duration;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Upper bound, well inside what `chrono::Duration` holds in milliseconds
    const MAX_TTL_SECS: f64 = 1e15;

    pub fn serialize<S>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ttl {
            Some(d) => serializer.serialize_f64(d.num_milliseconds() as f64 / 1000.0),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        match secs {
            None => Ok(None),
            Some(s) if !s.is_finite() || s < 0.0 => Err(D::Error::custom(format!(
                "ttl must be a non-negative number of seconds (got {})",
                s
            ))),
            Some(s) if s > MAX_TTL_SECS => {
                Err(D::Error::custom(format!("ttl out of range (got {}s)", s)))
            }
            Some(s) => Ok(Some(Duration::milliseconds((s * 1000.0).round() as i64))),
        }
    }
}
