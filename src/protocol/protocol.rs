//! AgentProtocol - the only surface a worker uses to talk to the bus
//!
//! One instance per agent. Builds outbound messages, filters expired inbound
//! ones, dispatches by message type to registered handlers and keeps send /
//! receive / failure counters. Nothing that goes wrong while handling an
//! inbound message is returned to the caller: it is logged, counted and
//! reported as a `DispatchOutcome`.

use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::payloads::{HeartbeatPayload, SendOptions, COORDINATOR_ID, HEARTBEAT_TTL_SECS};
use super::stats::{ProtocolCounters, ProtocolStats};
use crate::agent::{AgentStatus, ResourceGauges};
use crate::bus::{handler_fn, MessageBus, MessageHandler, Subscription};
use crate::error::Result;
use crate::message::{MessageBuilder, MessagePriority, MessageType, ProtocolMessage};
use crate::router::RoutingRule;

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Expired,
    HandlerMissing,
    HandlerFailed,
    Malformed,
}

/// Illustrative fleet routing policy installed by the first `initialize` on a
/// bus. Deployments override it with `add_routing_rule` / `remove_routing_rule`.
pub fn baseline_routing_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new("market_data", ["feature_engineer", "predictor"], 10),
        RoutingRule::new("prediction", ["signal_generator"], 10),
        RoutingRule::new("signal", ["portfolio_optimizer", "risk_manager"], 20),
        RoutingRule::new("risk_*", ["risk_manager", "portfolio_optimizer"], 30),
    ]
}

pub struct AgentProtocol {
    agent_id: String,
    bus: Arc<MessageBus>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    counters: ProtocolCounters,
    initialized: AtomicBool,
}

impl AgentProtocol {
    pub fn new(agent_id: &str, bus: Arc<MessageBus>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            bus,
            handlers: RwLock::new(HashMap::new()),
            counters: ProtocolCounters::default(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Register the default HEARTBEAT / CONTROL handlers and make sure the
    /// bus carries the baseline routing rules. Only the first call does
    /// anything, so handlers registered afterwards are never replaced.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let agent_id = self.agent_id.clone();
        self.register_handler(
            MessageType::Heartbeat,
            handler_fn(move |message: ProtocolMessage| {
                let agent_id = agent_id.clone();
                async move {
                    debug!("{} saw heartbeat from {}", agent_id, message.sender());
                    Ok(())
                }
            }),
        )
        .await;

        let agent_id = self.agent_id.clone();
        self.register_handler(
            MessageType::Control,
            handler_fn(move |message: ProtocolMessage| {
                let agent_id = agent_id.clone();
                async move {
                    let command = message
                        .payload()
                        .get("command")
                        .and_then(Value::as_str)
                        .unwrap_or("<none>");
                    info!(
                        "{} received control command {} from {}",
                        agent_id,
                        command,
                        message.sender()
                    );
                    Ok(())
                }
            }),
        )
        .await;

        self.bus.install_baseline(baseline_routing_rules()).await;
        info!("Protocol initialized for {}", self.agent_id);
    }

    /// Register (or replace) the handler for a message type
    pub async fn register_handler(
        &self,
        message_type: impl Into<MessageType>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let message_type = message_type.into();
        debug!("{} registered handler for {}", self.agent_id, message_type);
        self.handlers.write().await.insert(message_type, handler);
    }

    pub async fn unregister_handler(&self, message_type: &MessageType) -> bool {
        self.handlers.write().await.remove(message_type).is_some()
    }

    pub async fn add_routing_rule(
        &self,
        pattern: &str,
        targets: &[&str],
        priority: i32,
        conditions: Option<HashMap<String, Value>>,
    ) {
        let mut rule = RoutingRule::new(pattern, targets.iter().copied(), priority);
        if let Some(conditions) = conditions {
            rule = rule.with_conditions(conditions);
        }
        self.bus.add_rule(rule).await;
    }

    pub async fn remove_routing_rule(&self, pattern: &str) -> bool {
        self.bus.remove_rule(pattern).await
    }

    // ==================== Sending ====================

    /// Send a message. Returns its id, or `None` (with a warning) when a
    /// non-broadcast message has no receiver and no matching route.
    pub async fn send(
        &self,
        message_type: impl Into<MessageType>,
        payload: Value,
        receiver: Option<&str>,
        options: SendOptions,
    ) -> Result<Option<String>> {
        let mut builder = MessageBuilder::new(message_type, self.agent_id.as_str())
            .maybe_receiver(receiver.map(str::to_string))
            .payload(payload)
            .priority(options.priority)
            .maybe_ttl(options.ttl)
            .correlation_id(options.correlation_id)
            .reply_to(options.reply_to)
            .broadcast(options.broadcast);
        if let Some(max_retries) = options.max_retries {
            builder = builder.max_retries(max_retries);
        }
        let message = builder.build()?;
        self.dispatch_outbound(message).await
    }

    async fn dispatch_outbound(&self, message: ProtocolMessage) -> Result<Option<String>> {
        let message_type = message.message_type().clone();
        match self.bus.publish(message).await {
            Ok(Some(id)) => {
                self.counters.sent();
                Ok(Some(id))
            }
            Ok(None) => {
                self.counters.failed();
                warn!(
                    "{} could not route {} message: no receiver and no matching rule",
                    self.agent_id, message_type
                );
                Ok(None)
            }
            Err(e) => {
                self.counters.failed();
                warn!("{} failed to send {} message: {}", self.agent_id, message_type, e);
                Err(e)
            }
        }
    }

    /// Trading signal, high priority
    pub async fn send_signal(&self, payload: Value, receiver: Option<&str>) -> Result<Option<String>> {
        self.send(
            MessageType::Signal,
            payload,
            receiver,
            SendOptions::with_priority(MessagePriority::High),
        )
        .await
    }

    /// Data update, normal priority
    pub async fn send_data(&self, payload: Value, receiver: Option<&str>) -> Result<Option<String>> {
        self.send(
            MessageType::Data,
            payload,
            receiver,
            SendOptions::with_priority(MessagePriority::Normal),
        )
        .await
    }

    /// Control command `{command, parameters}`, critical priority
    pub async fn send_control(
        &self,
        receiver: &str,
        command: &str,
        parameters: Value,
    ) -> Result<Option<String>> {
        self.send(
            MessageType::Control,
            json!({ "command": command, "parameters": parameters }),
            Some(receiver),
            SendOptions::with_priority(MessagePriority::Critical),
        )
        .await
    }

    /// Fleet-wide broadcast, normal priority
    pub async fn broadcast(
        &self,
        message_type: impl Into<MessageType>,
        payload: Value,
    ) -> Result<Option<String>> {
        self.send(
            message_type,
            payload,
            None,
            SendOptions::with_priority(MessagePriority::Normal).broadcast(),
        )
        .await
    }

    /// Heartbeat to the coordinator
    pub async fn send_heartbeat(
        &self,
        status: AgentStatus,
        gauges: ResourceGauges,
    ) -> Result<Option<String>> {
        let payload = serde_json::to_value(HeartbeatPayload::new(&self.agent_id, status, gauges))?;
        self.send(
            MessageType::Heartbeat,
            payload,
            Some(COORDINATOR_ID),
            SendOptions::with_priority(MessagePriority::High)
                .ttl(chrono::Duration::seconds(HEARTBEAT_TTL_SECS)),
        )
        .await
    }

    /// Answer `original` at its `reply_to` (or its sender), carrying its
    /// correlation id (or its id when it had none).
    pub async fn reply(&self, original: &ProtocolMessage, payload: Value) -> Result<Option<String>> {
        let receiver = original
            .reply_to
            .clone()
            .unwrap_or_else(|| original.sender().to_string());
        let correlation = original
            .correlation_id
            .clone()
            .unwrap_or_else(|| original.id().to_string());
        self.send(
            original.message_type().clone(),
            payload,
            Some(&receiver),
            SendOptions::with_priority(original.priority()).correlation_id(correlation),
        )
        .await
    }

    /// Re-send a message with its retry counter bumped. `Ok(None)` once the
    /// retry budget is spent.
    pub async fn retry(&self, message: &ProtocolMessage) -> Result<Option<String>> {
        match message.next_attempt() {
            Some(attempt) => {
                debug!(
                    "{} retrying message {} (attempt {}/{})",
                    self.agent_id,
                    attempt.id(),
                    attempt.retry_count,
                    attempt.max_retries
                );
                self.dispatch_outbound(attempt).await
            }
            None => {
                warn!(
                    "{} gave up on message {} after {} retries",
                    self.agent_id,
                    message.id(),
                    message.retry_count
                );
                Ok(None)
            }
        }
    }

    // ==================== Receiving ====================

    /// Next unexpired message from this agent's mailbox. Expired messages are
    /// dropped with a log line and reported as `None`.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<ProtocolMessage>> {
        let message = match self.bus.receive(&self.agent_id, timeout).await? {
            Some(message) => message,
            None => return Ok(None),
        };
        self.counters.received();

        if message.is_expired(chrono::Utc::now()) {
            info!(
                "{} dropping expired {} message {} from {}",
                self.agent_id,
                message.message_type(),
                message.id(),
                message.sender()
            );
            return Ok(None);
        }
        Ok(Some(message))
    }

    /// Decode a raw wire message and dispatch it
    pub async fn handle_incoming(&self, raw: &str) -> DispatchOutcome {
        match ProtocolMessage::from_json(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                self.counters.failed();
                warn!("{} received malformed message: {}", self.agent_id, e);
                DispatchOutcome::Malformed
            }
        }
    }

    /// Dispatch a decoded message to the handler registered for its type
    pub async fn handle_message(&self, message: ProtocolMessage) -> DispatchOutcome {
        self.counters.received();

        if message.is_expired(chrono::Utc::now()) {
            info!(
                "{} dropping expired {} message {} from {}",
                self.agent_id,
                message.message_type(),
                message.id(),
                message.sender()
            );
            return DispatchOutcome::Expired;
        }

        let handler = self.handlers.read().await.get(message.message_type()).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!(
                    "{} has no handler for {} message {}; dropping",
                    self.agent_id,
                    message.message_type(),
                    message.id()
                );
                return DispatchOutcome::HandlerMissing;
            }
        };

        let id = message.id().to_string();
        let message_type = message.message_type().clone();
        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                self.counters.failed();
                warn!(
                    "{} handler for {} failed on message {}: {}",
                    self.agent_id, message_type, id, e
                );
                DispatchOutcome::HandlerFailed
            }
            Err(_) => {
                self.counters.failed();
                warn!(
                    "{} handler for {} panicked on message {}",
                    self.agent_id, message_type, id
                );
                DispatchOutcome::HandlerFailed
            }
        }
    }

    /// Subscribe this agent's handlers to the bus broadcast channel.
    /// The subscription ends when the returned token is dropped.
    pub async fn subscribe_broadcasts(self: &Arc<Self>) -> Result<Subscription> {
        let protocol = Arc::clone(self);
        let handler = handler_fn(move |message: ProtocolMessage| {
            let protocol = protocol.clone();
            async move {
                protocol.handle_message(message).await;
                Ok(())
            }
        });
        let channel = self.bus.config().broadcast_channel.clone();
        self.bus.subscribe(&channel, &self.agent_id, handler).await
    }

    pub async fn stats(&self) -> ProtocolStats {
        let registered = self.handlers.read().await.len();
        ProtocolStats::from_counters(&self.agent_id, &self.counters, registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_millis(200);

    fn protocol(agent_id: &str, bus: &Arc<MessageBus>) -> Arc<AgentProtocol> {
        Arc::new(AgentProtocol::new(agent_id, bus.clone()))
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_m: ProtocolMessage| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_initialize_installs_defaults() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);
        p.initialize().await;

        assert_eq!(p.stats().await.registered_handlers, 2);
        assert_eq!(bus.rule_count().await, baseline_routing_rules().len());
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);
        p.initialize().await;

        let beats = Arc::new(AtomicUsize::new(0));
        p.register_handler(MessageType::Heartbeat, counting_handler(beats.clone()))
            .await;
        p.add_routing_rule("signal", &["my_trader"], 20, None).await;

        p.initialize().await;
        protocol("a2", &bus).initialize().await;

        let beat = MessageBuilder::new(MessageType::Heartbeat, "a2")
            .receiver("a1")
            .build()
            .unwrap();
        assert_eq!(p.handle_message(beat).await, DispatchOutcome::Handled);
        assert_eq!(beats.load(Ordering::SeqCst), 1);

        let signal = MessageBuilder::new(MessageType::Signal, "gen")
            .broadcast(true)
            .build()
            .unwrap();
        assert_eq!(bus.route(&signal).await.len(), 1);
        assert_eq!(bus.rule_count().await, baseline_routing_rules().len());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let bus = Arc::new(MessageBus::in_memory());
        let sender = protocol("feed", &bus);
        let receiver = protocol("agent1", &bus);

        let id = sender
            .send_data(json!({"px": 101.5}), Some("agent1"))
            .await
            .unwrap()
            .unwrap();
        let msg = receiver.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(msg.id(), id);
        assert_eq!(msg.sender(), "feed");

        assert_eq!(sender.stats().await.messages_sent, 1);
        assert_eq!(receiver.stats().await.messages_received, 1);
    }

    #[tokio::test]
    async fn test_unroutable_send_returns_none() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("gen", &bus);

        let id = p
            .send("unknown_kind", json!({}), None, SendOptions::default())
            .await
            .unwrap();
        assert!(id.is_none());

        let stats = p.stats().await;
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_routed_send_uses_rules() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("gen", &bus);
        p.add_routing_rule("signal", &["trader", "pm"], 1, None).await;

        assert!(p.send_signal(json!({"side": "buy"}), None).await.unwrap().is_some());
        assert_eq!(bus.queue_length("trader").await.unwrap(), 1);
        assert_eq!(bus.queue_length("pm").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_message_skips_handler() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);
        let calls = Arc::new(AtomicUsize::new(0));
        p.register_handler(MessageType::Data, counting_handler(calls.clone()))
            .await;

        let mut stale = MessageBuilder::new(MessageType::Data, "feed")
            .receiver("a1")
            .ttl_secs(1)
            .build()
            .unwrap();
        stale.envelope.timestamp = chrono::Utc::now() - chrono::Duration::seconds(5);

        assert_eq!(p.handle_message(stale).await, DispatchOutcome::Expired);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let fresh = MessageBuilder::new(MessageType::Data, "feed")
            .receiver("a1")
            .ttl_secs(30)
            .build()
            .unwrap();
        assert_eq!(p.handle_message(fresh).await, DispatchOutcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_receive_drops_expired() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);

        bus.publish_new(
            "data",
            json!({}),
            "feed",
            Some("a1"),
            None,
            Some(chrono::Duration::milliseconds(20)),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(p.receive(WAIT).await.unwrap().is_none());
        assert_eq!(bus.queue_length("a1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_handler_and_malformed_input() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);

        let msg = MessageBuilder::new(MessageType::Prediction, "model")
            .receiver("a1")
            .build()
            .unwrap();
        assert_eq!(
            p.handle_incoming(&msg.to_json().unwrap()).await,
            DispatchOutcome::HandlerMissing
        );
        assert_eq!(p.handle_incoming("{oops").await, DispatchOutcome::Malformed);
        assert_eq!(p.stats().await.messages_failed, 1);
    }

    #[tokio::test]
    async fn test_wire_ttl_outside_range() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);
        let calls = Arc::new(AtomicUsize::new(0));
        p.register_handler(MessageType::Data, counting_handler(calls.clone()))
            .await;

        let raw = |ttl: &str| {
            format!(
                r#"{{"id":"m1","type":"data","sender":"feed","receiver":"a1","timestamp":"{}","ttl":{}}}"#,
                chrono::Utc::now().to_rfc3339(),
                ttl
            )
        };

        assert_eq!(p.handle_incoming(&raw("1e13")).await, DispatchOutcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.handle_incoming(&raw("-5")).await, DispatchOutcome::Malformed);
        assert_eq!(p.handle_incoming(&raw("1e300")).await, DispatchOutcome::Malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_errors_are_contained() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("a1", &bus);
        p.register_handler(
            MessageType::Signal,
            handler_fn(|_m: ProtocolMessage| async {
                Err(FleetError::Internal("model not loaded".into()))
            }),
        )
        .await;

        let msg = MessageBuilder::new(MessageType::Signal, "gen")
            .receiver("a1")
            .build()
            .unwrap();
        assert_eq!(p.handle_message(msg).await, DispatchOutcome::HandlerFailed);
        assert_eq!(p.stats().await.messages_failed, 1);
    }

    #[tokio::test]
    async fn test_reply_carries_correlation() {
        let bus = Arc::new(MessageBus::in_memory());
        let asker = protocol("pm", &bus);
        let answerer = protocol("risk_manager", &bus);

        asker
            .send(
                MessageType::Data,
                json!({"q": "exposure"}),
                Some("risk_manager"),
                SendOptions::default().correlation_id("req-7").reply_to("pm"),
            )
            .await
            .unwrap();
        let request = answerer.receive(WAIT).await.unwrap().unwrap();
        answerer.reply(&request, json!({"exposure": 42})).await.unwrap();

        let answer = asker.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(answer.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(answer.payload()["exposure"], 42);
    }

    #[tokio::test]
    async fn test_retry_respects_budget() {
        let bus = Arc::new(MessageBus::in_memory());
        let p = protocol("gen", &bus);
        let msg = MessageBuilder::new(MessageType::Signal, "gen")
            .receiver("pm")
            .max_retries(1)
            .build()
            .unwrap();

        assert!(p.retry(&msg).await.unwrap().is_some());
        let resent = bus.receive("pm", WAIT).await.unwrap().unwrap();
        assert_eq!(resent.retry_count, 1);
        assert!(p.retry(&resent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_subscription_dispatches() {
        let bus = Arc::new(MessageBus::in_memory());
        let listener = protocol("listener", &bus);
        let calls = Arc::new(AtomicUsize::new(0));
        listener
            .register_handler(MessageType::Broadcast, counting_handler(calls.clone()))
            .await;
        let sub = listener.subscribe_broadcasts().await.unwrap();

        let speaker = protocol("coordinator", &bus);
        speaker.broadcast(MessageType::Broadcast, json!({"msg": "halt"})).await.unwrap();

        tokio::time::timeout(WAIT, async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(sub);
        assert_eq!(bus.stats().active_subscriptions, 0);
    }
}
