//! MessageBus - point-to-point mailboxes and broadcast channels over a Transport
//!
//! Delivery rules:
//!   - a message with a receiver lands in that agent's mailbox (FIFO,
//!     at-most-once: whoever pops it owns it)
//!   - a receiver-less message is copied into the mailbox of every agent the
//!     router resolves, and when flagged broadcast it is also published on the
//!     broadcast channel and kept briefly under a lookup key
//!   - a receiver-less, non-broadcast message with no route is dropped with a
//!     warning; it is not an error
//!
//! Transport failures are returned to the caller untouched. There is no retry
//! at this layer.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::handler::MessageHandler;
use super::memory::InMemoryTransport;
use super::subscription::Subscription;
use super::transport::Transport;
use crate::config::BusConfig;
use crate::error::Result;
use crate::message::{MessageBuilder, MessagePriority, MessageType, ProtocolMessage};
use crate::router::{Router, RoutingRule};

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    broadcasts: AtomicU64,
    unroutable: AtomicU64,
    decode_failures: AtomicU64,
}

/// Bus-level statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages accepted by `publish`
    pub published: u64,
    /// Messages handed to a consumer by `receive` or a subscription
    pub delivered: u64,
    /// Channel publishes
    pub broadcasts: u64,
    /// Receiver-less messages dropped for lack of a route
    pub unroutable: u64,
    /// Payloads that could not be decoded
    pub decode_failures: u64,
    pub active_subscriptions: u64,
}

pub struct MessageBus {
    transport: Arc<dyn Transport>,
    router: RwLock<Router>,
    baseline_installed: AtomicBool,
    config: BusConfig,
    counters: Arc<BusCounters>,
    active_subscriptions: Arc<AtomicU64>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        Self {
            transport,
            router: RwLock::new(Router::new()),
            baseline_installed: AtomicBool::new(false),
            config,
            counters: Arc::new(BusCounters::default()),
            active_subscriptions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bus over an in-process transport with default settings
    pub fn in_memory() -> Self {
        let config = BusConfig::default();
        let transport = InMemoryTransport::with_capacity(config.channel_capacity);
        Self::new(Arc::new(transport), config)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn mailbox_key(&self, agent_id: &str) -> String {
        format!("{}{}", self.config.mailbox_prefix, agent_id)
    }

    fn lookup_key(&self, message_id: &str) -> String {
        format!("{}{}", self.config.lookup_prefix, message_id)
    }

    // ==================== Routing ====================

    pub async fn add_rule(&self, rule: RoutingRule) {
        self.router.write().await.add_rule(rule);
    }

    /// Install the fleet's default rules, once per bus. Patterns that already
    /// have a rule keep it. Returns false when a baseline was installed before.
    pub async fn install_baseline(&self, rules: Vec<RoutingRule>) -> bool {
        let mut router = self.router.write().await;
        if self.baseline_installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let added = rules
            .into_iter()
            .map(|rule| router.add_rule_if_absent(rule))
            .filter(|added| *added)
            .count();
        debug!("Installed {} baseline routing rules", added);
        true
    }

    pub async fn remove_rule(&self, pattern: &str) -> bool {
        self.router.write().await.remove_rule(pattern)
    }

    pub async fn route(&self, message: &ProtocolMessage) -> BTreeSet<String> {
        self.router.read().await.route(message)
    }

    pub async fn rule_count(&self) -> usize {
        self.router.read().await.len()
    }

    // ==================== Publishing ====================

    /// Deliver a message. Returns its id, or `None` when a receiver-less,
    /// non-broadcast message resolved to nobody.
    pub async fn publish(&self, message: ProtocolMessage) -> Result<Option<String>> {
        let id = message.id().to_string();

        if let Some(receiver) = message.receiver() {
            self.push_to_mailbox(receiver, &message).await?;
            self.counters.published.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Published {} message {} from {} to {}",
                message.message_type(),
                id,
                message.sender(),
                receiver
            );
            return Ok(Some(id));
        }

        let targets = self.route(&message).await;
        if targets.is_empty() && !message.broadcast {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            warn!(
                "No route for {} message {} from {}; dropping",
                message.message_type(),
                id,
                message.sender()
            );
            return Ok(None);
        }

        for target in &targets {
            self.push_to_mailbox(target, &message).await?;
        }

        if message.broadcast {
            let channel = self.config.broadcast_channel.clone();
            self.publish_to_channel(&channel, &message).await?;

            let lookup_ttl = message
                .envelope
                .ttl
                .and_then(|ttl| ttl.to_std().ok())
                .unwrap_or(Duration::from_secs(self.config.lookup_ttl_secs));
            self.transport
                .set_ex(&self.lookup_key(&id), message.to_json()?, lookup_ttl)
                .await?;
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Published {} message {} from {} to {} routed targets (broadcast: {})",
            message.message_type(),
            id,
            message.sender(),
            targets.len(),
            message.broadcast
        );
        Ok(Some(id))
    }

    /// Build and publish in one call. A missing receiver means broadcast.
    pub async fn publish_new(
        &self,
        message_type: impl Into<MessageType>,
        payload: Value,
        sender: &str,
        receiver: Option<&str>,
        priority: Option<MessagePriority>,
        ttl: Option<chrono::Duration>,
    ) -> Result<Option<String>> {
        let message = MessageBuilder::new(message_type, sender)
            .maybe_receiver(receiver.map(str::to_string))
            .broadcast(receiver.is_none())
            .payload(payload)
            .priority(priority.unwrap_or_default())
            .maybe_ttl(ttl)
            .build()?;
        self.publish(message).await
    }

    /// Fan a message out to every live subscriber of `channel`.
    /// Returns how many subscribers received it.
    pub async fn publish_to_channel(
        &self,
        channel: &str,
        message: &ProtocolMessage,
    ) -> Result<usize> {
        let receivers = self.transport.publish(channel, message.to_json()?).await?;
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Broadcast {} message {} on {} to {} subscribers",
            message.message_type(),
            message.id(),
            channel,
            receivers
        );
        Ok(receivers)
    }

    async fn push_to_mailbox(&self, agent_id: &str, message: &ProtocolMessage) -> Result<()> {
        self.transport
            .push(&self.mailbox_key(agent_id), message.to_json()?)
            .await
    }

    // ==================== Consuming ====================

    /// Wait up to `timeout` for the next message in an agent's mailbox.
    ///
    /// `Ok(None)` covers both "nothing arrived" and "arrived but undecodable"
    /// (the latter is logged and counted).
    pub async fn receive(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Option<ProtocolMessage>> {
        let raw = match self.transport.pop(&self.mailbox_key(agent_id), timeout).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        match ProtocolMessage::from_json(&raw) {
            Ok(message) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(Some(message))
            }
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding undecodable message for {}: {}", agent_id, e);
                Ok(None)
            }
        }
    }

    /// Push-subscribe `handler` to a channel on behalf of `agent_id`.
    /// Handler errors are logged; they never end the subscription.
    pub async fn subscribe(
        &self,
        channel: &str,
        agent_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        let mut rx = self.transport.subscribe(channel).await?;
        let counters = self.counters.clone();
        let channel_name = channel.to_string();
        let subscriber = agent_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => match ProtocolMessage::from_json(&raw) {
                        Ok(message) => {
                            counters.delivered.fetch_add(1, Ordering::Relaxed);
                            let id = message.id().to_string();
                            if let Err(e) = handler.handle(message).await {
                                warn!(
                                    "Subscriber {} failed on message {} from {}: {}",
                                    subscriber, id, channel_name, e
                                );
                            }
                        }
                        Err(e) => {
                            counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                            warn!("Undecodable message on {}: {}", channel_name, e);
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Subscriber {} lagged on {}, skipped {} messages",
                            subscriber, channel_name, skipped
                        );
                    }
                    Err(RecvError::Closed) => {
                        debug!("Channel {} closed for {}", channel_name, subscriber);
                        break;
                    }
                }
            }
        });

        info!("Agent {} subscribed to channel {}", agent_id, channel);
        Ok(Subscription::new(
            channel,
            agent_id,
            task,
            self.active_subscriptions.clone(),
        ))
    }

    /// Fetch a recent broadcast by id while its lookup key is alive
    pub async fn lookup(&self, message_id: &str) -> Result<Option<ProtocolMessage>> {
        match self.transport.get(&self.lookup_key(message_id)).await? {
            Some(raw) => Ok(Some(ProtocolMessage::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    // ==================== Administration ====================

    pub async fn queue_length(&self, agent_id: &str) -> Result<usize> {
        self.transport.len(&self.mailbox_key(agent_id)).await
    }

    pub async fn clear(&self, agent_id: &str) -> Result<()> {
        self.transport.delete(&self.mailbox_key(agent_id)).await?;
        info!("Cleared mailbox of {}", agent_id);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.transport.ping().await
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            unroutable: self.counters.unroutable.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::SeqCst),
        }
    }

    pub async fn close(&self) -> Result<()> {
        info!("Closing message bus at {}", Utc::now());
        self.transport.close().await
    }
}
