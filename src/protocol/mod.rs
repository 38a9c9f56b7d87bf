//! Protocol façade
//!
//! Per-agent messaging surface: typed send helpers, handler dispatch,
//! expiry filtering and statistics.

#[allow(clippy::module_inception)]
pub mod protocol;
pub mod payloads;
pub mod stats;

pub use payloads::{HeartbeatPayload, SendOptions, COORDINATOR_ID, HEARTBEAT_TTL_SECS};
pub use protocol::{baseline_routing_rules, AgentProtocol, DispatchOutcome};
pub use stats::{success_rate, ProtocolStats};
