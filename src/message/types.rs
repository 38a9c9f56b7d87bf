//! Message type and priority enums shared by every layer of the bus

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Message kinds carried on the bus.
///
/// The set is closed for everything the fleet itself understands; business
/// workers that need their own kinds use `Custom`. Wire form is the snake_case
/// name, parsed case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Heartbeat,
    Control,
    Status,
    Data,
    Signal,
    Broadcast,
    MarketData,
    Prediction,
    RiskAlert,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Control => "control",
            MessageType::Status => "status",
            MessageType::Data => "data",
            MessageType::Signal => "signal",
            MessageType::Broadcast => "broadcast",
            MessageType::MarketData => "market_data",
            MessageType::Prediction => "prediction",
            MessageType::RiskAlert => "risk_alert",
            MessageType::Custom(name) => name.as_str(),
        }
    }

    /// Whether this is one of the built-in kinds
    pub fn is_builtin(&self) -> bool {
        !matches!(self, MessageType::Custom(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "heartbeat" => MessageType::Heartbeat,
            "control" => MessageType::Control,
            "status" => MessageType::Status,
            "data" => MessageType::Data,
            "signal" => MessageType::Signal,
            "broadcast" => MessageType::Broadcast,
            "market_data" => MessageType::MarketData,
            "prediction" => MessageType::Prediction,
            "risk_alert" => MessageType::RiskAlert,
            _ => MessageType::Custom(normalized),
        })
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        MessageType::from(s.to_string())
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

/// Advisory priority. The bus never reorders on it; consumers may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessagePriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

impl From<MessagePriority> for u8 {
    fn from(p: MessagePriority) -> Self {
        p as u8
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessagePriority::Low),
            2 => Ok(MessagePriority::Normal),
            3 => Ok(MessagePriority::High),
            4 => Ok(MessagePriority::Critical),
            other => Err(format!("invalid message priority: {other}")),
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePriority::Low => write!(f, "low"),
            MessagePriority::Normal => write!(f, "normal"),
            MessagePriority::High => write!(f, "high"),
            MessagePriority::Critical => write!(f, "critical"),
        }
    }
}
