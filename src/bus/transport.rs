//! Transport - the durable pub/sub + keyed-list service the bus rides on
//!
//! The bus never talks to a concrete broker. Anything offering keyed lists
//! with a blocking pop, pub/sub channels and expiring keys can back it.
//! `InMemoryTransport` is the in-process implementation.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append to the tail of a keyed list
    async fn push(&self, key: &str, value: String) -> Result<()>;

    /// Pop from the head of a keyed list, waiting up to `timeout`.
    /// `Ok(None)` means nothing arrived in time.
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Length of a keyed list (0 for unknown keys)
    async fn len(&self, key: &str) -> Result<usize>;

    /// Drop a key and everything stored under it
    async fn delete(&self, key: &str) -> Result<()>;

    /// Publish to a channel. Returns how many live subscribers received it.
    async fn publish(&self, channel: &str, value: String) -> Result<usize>;

    /// Subscribe to a channel. Only traffic published after this call is seen;
    /// dropping the receiver unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;

    /// Store a value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Read an expiring value; `None` once expired or never set
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Reachability check
    async fn ping(&self) -> Result<()>;

    /// Release the connection. Later calls fail with a transport error.
    async fn close(&self) -> Result<()>;
}
