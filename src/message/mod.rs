//! Message model - envelopes, protocol metadata, types and priorities

pub mod envelope;
pub mod types;

pub use envelope::{
    Envelope, MessageBuilder, ProtocolMessage, DEFAULT_MAX_RETRIES, PROTOCOL_VERSION,
};
pub use types::{MessagePriority, MessageType};
