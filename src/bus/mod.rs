//! Message Bus
//!
//! Point-to-point mailboxes and broadcast channels on top of a pluggable
//! `Transport`. Workers never use this module directly; they go through the
//! protocol façade.

pub mod handler;
pub mod memory;
pub mod message_bus;
pub mod subscription;
pub mod transport;

pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use memory::{InMemoryTransport, DEFAULT_CHANNEL_CAPACITY};
pub use message_bus::{BusStats, MessageBus};
pub use subscription::Subscription;
pub use transport::Transport;
