//! In-process transport
//!
//! Keyed lists with a blocking pop, broadcast channels and expiring keys,
//! all held in memory. Supports a reachability toggle so callers can
//! exercise transport-failure paths.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info};

use super::transport::Transport;
use crate::error::{FleetError, Result};

/// Default per-channel buffer before slow subscribers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct KeyedList {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
}

pub struct InMemoryTransport {
    lists: DashMap<String, Arc<KeyedList>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    expiring: DashMap<String, (String, Instant)>,
    channel_capacity: usize,
    reachable: AtomicBool,
    closed: AtomicBool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            lists: DashMap::new(),
            channels: DashMap::new(),
            expiring: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
            reachable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.wake_all();
        }
    }

    /// Drop expired keys eagerly. Reads already ignore them.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.expiring.len();
        self.expiring.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.expiring.len()
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("transport closed".into()));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("transport unreachable".into()));
        }
        Ok(())
    }

    fn list(&self, key: &str) -> Arc<KeyedList> {
        self.lists
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyedList::default()))
            .clone()
    }

    fn wake_all(&self) {
        for entry in self.lists.iter() {
            entry.value().notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn push(&self, key: &str, value: String) -> Result<()> {
        self.check()?;
        let list = self.list(key);
        list.queue.lock().await.push_back(value);
        list.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        self.check()?;
        let list = self.list(key);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(value) = list.queue.lock().await.pop_front() {
                return Ok(Some(value));
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between the check above and this await is not lost.
            if tokio::time::timeout_at(deadline, list.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
            self.check()?;
        }
    }

    async fn len(&self, key: &str) -> Result<usize> {
        self.check()?;
        let list = match self.lists.get(key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(0),
        };
        let len = list.queue.lock().await.len();
        Ok(len)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        if let Some(entry) = self.lists.get(key) {
            let list = entry.value().clone();
            drop(entry);
            list.queue.lock().await.clear();
        }
        self.expiring.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, value: String) -> Result<usize> {
        self.check()?;
        let sender = match self.channels.get(channel) {
            Some(entry) => entry.value().clone(),
            None => return Ok(0),
        };
        // Err only means there are no live receivers
        Ok(sender.send(value).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        self.check()?;
        let capacity = self.channel_capacity;
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        debug!("New subscriber on channel {}", channel);
        Ok(receiver)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check()?;
        self.expiring
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let value = self
            .expiring
            .get(key)
            .filter(|entry| entry.value().1 > now)
            .map(|entry| entry.value().0.clone());
        if value.is_none() {
            self.expiring.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(value)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the senders ends every subscription stream
        self.channels.clear();
        self.wake_all();
        info!("In-memory transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pop_is_fifo() {
        let transport = InMemoryTransport::new();
        for i in 0..5 {
            transport.push("q", format!("m{i}")).await.unwrap();
        }
        assert_eq!(transport.len("q").await.unwrap(), 5);
        for i in 0..5 {
            let value = transport.pop("q", Duration::from_millis(10)).await.unwrap();
            assert_eq!(value, Some(format!("m{i}")));
        }
        assert_eq!(transport.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_times_out_empty() {
        let transport = InMemoryTransport::new();
        let started = Instant::now();
        let value = transport.pop("empty", Duration::from_millis(50)).await.unwrap();
        assert!(value.is_none());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let transport = Arc::new(InMemoryTransport::new());
        let producer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("q", "late".into()).await.unwrap();
        });

        let value = transport.pop("q", Duration::from_secs(2)).await.unwrap();
        assert_eq!(value.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_subscribers_only_see_live_traffic() {
        let transport = InMemoryTransport::new();
        assert_eq!(transport.publish("ch", "before".into()).await.unwrap(), 0);

        let mut rx = transport.subscribe("ch").await.unwrap();
        assert_eq!(transport.publish("ch", "after".into()).await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_expiring_keys() {
        let transport = InMemoryTransport::new();
        transport
            .set_ex("k", "v".into(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(transport.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(transport.get("k").await.unwrap().is_none());
        assert_eq!(transport.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_and_closed() {
        let transport = InMemoryTransport::new();
        transport.set_reachable(false);
        assert!(transport.push("q", "x".into()).await.unwrap_err().is_transport());
        transport.set_reachable(true);
        transport.ping().await.unwrap();

        transport.close().await.unwrap();
        assert!(transport.ping().await.is_err());
        assert!(transport.close().await.is_ok());
    }
}
