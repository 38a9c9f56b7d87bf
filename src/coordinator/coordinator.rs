//! Coordinator - fleet registry and supervisor of supervised workers
//!
//! Starts, stops and restarts workers by registered type and keeps one
//! `RegistryEntry` per running worker. `start()` spawns four loops:
//!   - inbox: drains the "coordinator" mailbox (heartbeats, control commands)
//!   - health monitor: restarts workers with stale heartbeats or repeated
//!     unhealthy checks
//!   - stats collection: aggregates worker and bus counters
//!   - system monitor: transport liveness and fleet size
//!
//! An iteration that errors or panics is logged, the loop backs off and
//! carries on.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::command::ControlCommand;
use super::config::CoordinatorConfig;
use super::state::{FleetStats, HealthReport, RegistryEntry, SystemStatus};
use crate::agent::{AgentStatus, SupervisedAgent, WorkerConfig, WorkerFactory, WorkerInfo};
use crate::bus::{handler_fn, MessageBus};
use crate::error::Result;
use crate::message::{MessageType, ProtocolMessage};
use crate::protocol::{AgentProtocol, HeartbeatPayload, SendOptions, COORDINATOR_ID};

pub struct Coordinator {
    config: CoordinatorConfig,
    bus: Arc<MessageBus>,
    protocol: Arc<AgentProtocol>,
    factories: RwLock<HashMap<String, WorkerFactory>>,
    registry: RwLock<HashMap<String, RegistryEntry>>,
    running: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    last_stats: RwLock<Option<FleetStats>>,
}

impl Coordinator {
    pub fn new(bus: Arc<MessageBus>, config: CoordinatorConfig) -> Arc<Self> {
        let protocol = Arc::new(AgentProtocol::new(COORDINATOR_ID, bus.clone()));
        Arc::new(Self {
            config,
            bus,
            protocol,
            factories: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            started_at: RwLock::new(None),
            loops: Mutex::new(Vec::new()),
            last_stats: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn protocol(&self) -> &Arc<AgentProtocol> {
        &self.protocol
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ==================== Registry ====================

    /// Register (or replace) the factory for an agent type
    pub async fn register_agent_type(&self, agent_type: &str, factory: WorkerFactory) {
        self.factories
            .write()
            .await
            .insert(agent_type.to_string(), factory);
        info!("Registered agent type {}", agent_type);
    }

    pub async fn registered_agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a worker of `agent_type` from a control-style config map and
    /// start it. `Ok(false)` for a duplicate id or an unknown type.
    pub async fn start_agent(
        &self,
        agent_type: &str,
        agent_id: &str,
        config: HashMap<String, Value>,
    ) -> Result<bool> {
        let config = WorkerConfig::from_parameters(agent_id, agent_type, config)?;
        self.start_worker(config).await
    }

    /// `start_agent` with a ready-made config
    pub async fn start_worker(&self, config: WorkerConfig) -> Result<bool> {
        let agent_id = config.agent_id.clone();
        if self.registry.read().await.contains_key(&agent_id) {
            warn!("Agent {} already exists", agent_id);
            return Ok(false);
        }

        let factory = self.factories.read().await.get(&config.agent_type).cloned();
        let Some(factory) = factory else {
            warn!("Unknown agent type {} for {}", config.agent_type, agent_id);
            return Ok(false);
        };

        let worker = factory(&config);
        let agent = SupervisedAgent::new(config, worker, self.bus.clone());
        agent.start().await?;

        let mut registry = self.registry.write().await;
        if registry.contains_key(&agent_id) {
            drop(registry);
            warn!("Agent {} registered concurrently, discarding duplicate", agent_id);
            agent.stop().await;
            return Ok(false);
        }
        info!(
            "Started agent {} ({})",
            agent_id,
            agent.config().agent_type
        );
        registry.insert(agent_id, RegistryEntry::new(agent));
        Ok(true)
    }

    /// Stop a worker and drop its registry entry. False when unknown.
    pub async fn stop_agent(&self, agent_id: &str) -> bool {
        let entry = self.registry.write().await.remove(agent_id);
        match entry {
            Some(entry) => {
                entry.agent.stop().await;
                info!("Stopped agent {}", agent_id);
                true
            }
            None => {
                warn!("Cannot stop unknown agent {}", agent_id);
                false
            }
        }
    }

    /// Restart a worker and replace its registry entry with a fresh one.
    /// A failed start leaves the entry in place, the worker in Error.
    pub async fn restart_agent(&self, agent_id: &str) -> Result<bool> {
        let agent = self
            .registry
            .read()
            .await
            .get(agent_id)
            .map(|entry| entry.agent.clone());
        let Some(agent) = agent else {
            warn!("Cannot restart unknown agent {}", agent_id);
            return Ok(false);
        };

        agent.restart().await?;

        let mut registry = self.registry.write().await;
        match registry.get_mut(agent_id) {
            Some(entry) => {
                *entry = RegistryEntry::new(agent);
                info!("Restarted agent {}", agent_id);
                Ok(true)
            }
            None => {
                drop(registry);
                warn!("Agent {} was removed while restarting, stopping it", agent_id);
                agent.stop().await;
                Ok(false)
            }
        }
    }

    /// Note a heartbeat. False when the agent is not registered. A heartbeat
    /// older than the last one recorded (queued before a restart) is ignored.
    pub async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> bool {
        match self.registry.write().await.get_mut(agent_id) {
            Some(entry) => {
                entry.last_heartbeat = entry.last_heartbeat.max(at);
                true
            }
            None => false,
        }
    }

    pub async fn agent(&self, agent_id: &str) -> Option<SupervisedAgent> {
        self.registry
            .read()
            .await
            .get(agent_id)
            .map(|entry| entry.agent.clone())
    }

    async fn entries(&self) -> Vec<(String, RegistryEntry)> {
        self.registry
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    // ==================== Monitoring ====================

    /// One health-monitor pass
    pub async fn check_health(&self) -> HealthReport {
        let now = Utc::now();
        let mut report = HealthReport::default();

        for (agent_id, entry) in self.entries().await {
            report.checked += 1;

            if entry.is_stale(now, self.config.stale_heartbeat_multiplier) {
                warn!(
                    "Agent {} heartbeat stale since {}, restarting",
                    agent_id, entry.last_heartbeat
                );
                report.stale.push(agent_id.clone());
                if let Err(e) = self.restart_agent(&agent_id).await {
                    error!("Failed to restart stale agent {}: {}", agent_id, e);
                    report.failed.push(agent_id);
                }
                continue;
            }

            let healthy = entry.agent.is_healthy().await;
            let strikes = {
                let mut registry = self.registry.write().await;
                let Some(current) = registry.get_mut(&agent_id) else {
                    continue;
                };
                if healthy {
                    current.unhealthy_checks = 0;
                    continue;
                }
                current.unhealthy_checks += 1;
                current.unhealthy_checks
            };

            warn!(
                "Agent {} unhealthy ({}/{})",
                agent_id, strikes, self.config.unhealthy_threshold
            );
            if strikes >= self.config.unhealthy_threshold {
                report.unhealthy.push(agent_id.clone());
                if let Err(e) = self.restart_agent(&agent_id).await {
                    error!("Failed to restart unhealthy agent {}: {}", agent_id, e);
                    if let Some(current) = self.registry.write().await.get_mut(&agent_id) {
                        current.unhealthy_checks = 0;
                    }
                    report.failed.push(agent_id);
                }
            }
        }

        if !report.stale.is_empty() || !report.unhealthy.is_empty() {
            info!(
                "Health check: {} agents, {} stale, {} unhealthy, {} failed restarts",
                report.checked,
                report.stale.len(),
                report.unhealthy.len(),
                report.failed.len()
            );
        }
        report
    }

    /// One stats-collection pass. The result is also kept for `last_stats`.
    pub async fn collect_stats(&self) -> FleetStats {
        let mut active_agents = 0;
        let mut total_messages_processed = 0;
        let mut total_errors = 0;

        let entries = self.entries().await;
        for (_, entry) in &entries {
            if entry.agent.status().await == AgentStatus::Running {
                active_agents += 1;
            }
            total_messages_processed += entry.agent.messages_processed();
            total_errors += entry.agent.error_count();
        }

        let stats = FleetStats {
            total_agents: entries.len(),
            active_agents,
            total_messages_processed,
            total_errors,
            bus: self.bus.stats(),
            collected_at: Utc::now(),
        };
        info!(
            "Fleet stats: {}/{} agents active, {} messages processed, {} published on bus",
            stats.active_agents, stats.total_agents, stats.total_messages_processed, stats.bus.published
        );
        *self.last_stats.write().await = Some(stats.clone());
        stats
    }

    pub async fn last_stats(&self) -> Option<FleetStats> {
        self.last_stats.read().await.clone()
    }

    /// One system-monitor pass: transport liveness and fleet size.
    /// Returns true when the fleet is over `max_agents`.
    pub async fn check_system(&self) -> Result<bool> {
        self.bus.ping().await?;

        let total = self.registry.read().await.len();
        let over_capacity = total > self.config.max_agents;
        if over_capacity {
            warn!(
                "Fleet has {} agents, above the limit of {}",
                total, self.config.max_agents
            );
        } else {
            debug!("System check: {} agents", total);
        }
        Ok(over_capacity)
    }

    /// Take one message off the coordinator mailbox and dispatch it
    async fn poll_inbox(&self) -> Result<()> {
        if let Some(message) = self.protocol.receive(self.config.inbox_timeout()).await? {
            self.protocol.handle_message(message).await;
        }
        Ok(())
    }

    async fn on_heartbeat(&self, message: &ProtocolMessage) -> Result<()> {
        let beat: HeartbeatPayload = serde_json::from_value(message.payload().clone())?;
        if !self.record_heartbeat(&beat.agent_id, beat.timestamp).await {
            debug!("Heartbeat from unregistered agent {}", beat.agent_id);
        }
        Ok(())
    }

    // ==================== Control ====================

    /// Execute a `{command, parameters}` control payload
    pub async fn handle_control(&self, payload: &Value) -> Result<()> {
        let command = ControlCommand::from_payload(payload)?;
        info!("Executing control command {}", command.name());

        match command {
            ControlCommand::StartAgent {
                agent_type,
                agent_id,
                config,
            } => {
                self.start_agent(&agent_type, &agent_id, config).await?;
            }
            ControlCommand::StopAgent { agent_id } => {
                self.stop_agent(&agent_id).await;
            }
            ControlCommand::RestartAgent { agent_id } => {
                self.restart_agent(&agent_id).await?;
            }
            ControlCommand::Broadcast {
                message_type,
                content,
                agent_types,
            } => {
                self.broadcast(&message_type, content, agent_types.as_deref())
                    .await?;
            }
        }
        Ok(())
    }

    /// Send `content` to the whole fleet, or point-to-point to every
    /// registered agent of `agent_types`. Returns how many sends went out.
    pub async fn broadcast(
        &self,
        message_type: &str,
        content: Value,
        agent_types: Option<&[String]>,
    ) -> Result<usize> {
        let Some(agent_types) = agent_types else {
            let sent = self.protocol.broadcast(message_type, content).await?;
            return Ok(usize::from(sent.is_some()));
        };

        let targets: Vec<String> = self
            .registry
            .read()
            .await
            .iter()
            .filter(|(_, entry)| agent_types.contains(&entry.agent.config().agent_type))
            .map(|(id, _)| id.clone())
            .collect();

        let mut sent = 0;
        for target in &targets {
            if self
                .protocol
                .send(message_type, content.clone(), Some(target), SendOptions::default())
                .await?
                .is_some()
            {
                sent += 1;
            }
        }
        debug!("Broadcast {} to {} agents of {:?}", message_type, sent, agent_types);
        Ok(sent)
    }

    // ==================== Run / Shutdown ====================

    /// Install the inbox handlers and spawn the monitoring loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Coordinator already running");
            return Ok(());
        }

        self.protocol.initialize().await;
        self.install_handlers().await;
        *self.started_at.write().await = Some(Utc::now());

        let loops = vec![
            self.spawn_monitor("inbox", Duration::ZERO, |c| {
                Box::pin(async move { c.poll_inbox().await })
            }),
            self.spawn_monitor("health", self.config.health_check_interval(), |c| {
                Box::pin(async move {
                    c.check_health().await;
                    Ok(())
                })
            }),
            self.spawn_monitor("stats", self.config.stats_interval(), |c| {
                Box::pin(async move {
                    c.collect_stats().await;
                    Ok(())
                })
            }),
            self.spawn_monitor("system", self.config.system_check_interval(), |c| {
                Box::pin(async move { c.check_system().await.map(|_| ()) })
            }),
        ];
        self.loops.lock().await.extend(loops);

        info!("Coordinator started");
        Ok(())
    }

    async fn install_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.protocol
            .register_handler(
                MessageType::Heartbeat,
                handler_fn(move |message: ProtocolMessage| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(coordinator) => coordinator.on_heartbeat(&message).await,
                            None => Ok(()),
                        }
                    }
                }),
            )
            .await;

        let weak = Arc::downgrade(self);
        self.protocol
            .register_handler(
                MessageType::Control,
                handler_fn(move |message: ProtocolMessage| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(coordinator) => coordinator.handle_control(message.payload()).await,
                            None => Ok(()),
                        }
                    }
                }),
            )
            .await;
    }

    fn spawn_monitor<F>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Coordinator>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        let backoff = self.config.loop_error_backoff();

        tokio::spawn(async move {
            loop {
                let Some(coordinator) = weak.upgrade() else { break };
                if !coordinator.is_running() {
                    break;
                }

                let pause = match AssertUnwindSafe(tick(coordinator)).catch_unwind().await {
                    Ok(Ok(())) => period,
                    Ok(Err(e)) => {
                        error!("Coordinator {} loop iteration failed: {}", name, e);
                        backoff
                    }
                    Err(_) => {
                        error!("Coordinator {} loop iteration panicked", name);
                        backoff
                    }
                };
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
            debug!("Coordinator {} loop exited", name);
        })
    }

    /// Cancel the loops, stop every worker, close the bus. Loops go first so
    /// a health pass cannot restart a worker this is stopping.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.running.store(false, Ordering::SeqCst);

        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            handle.abort();
            let _ = handle.await;
        }

        let entries: Vec<(String, RegistryEntry)> = self.registry.write().await.drain().collect();
        for (agent_id, entry) in entries {
            entry.agent.stop().await;
            debug!("Stopped agent {} during shutdown", agent_id);
        }

        if let Err(e) = self.bus.close().await {
            warn!("Failed to close message bus: {}", e);
        }
        info!("Coordinator stopped");
    }

    // ==================== Introspection ====================

    pub async fn get_system_status(&self) -> SystemStatus {
        let entries = self.entries().await;
        let mut active_agents = 0;
        let mut total_messages_processed = 0;
        for (_, entry) in &entries {
            if entry.agent.status().await == AgentStatus::Running {
                active_agents += 1;
            }
            total_messages_processed += entry.agent.messages_processed();
        }

        let uptime_secs = match *self.started_at.read().await {
            Some(at) if self.is_running() => {
                (Utc::now() - at).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };

        SystemStatus {
            running: self.is_running(),
            total_agents: entries.len(),
            active_agents,
            total_messages_processed,
            uptime_secs,
            registered_agent_types: self.registered_agent_types().await,
        }
    }

    pub async fn get_agent_info(&self, agent_id: &str) -> Option<WorkerInfo> {
        let agent = self.agent(agent_id).await?;
        Some(agent.info().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentContext, Worker};
    use crate::error::FleetError;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopWorker {
        fail_init: bool,
    }

    #[async_trait]
    impl Worker for NoopWorker {
        async fn initialize(&mut self, _ctx: &AgentContext) -> Result<()> {
            if self.fail_init {
                return Err(FleetError::Internal("feed offline".into()));
            }
            Ok(())
        }

        async fn process_message(&mut self, _message: &ProtocolMessage) -> Result<bool> {
            Ok(true)
        }
    }

    async fn coordinator() -> Arc<Coordinator> {
        let coordinator = Coordinator::new(
            Arc::new(MessageBus::in_memory()),
            CoordinatorConfig::default(),
        );
        coordinator
            .register_agent_type("noop", Arc::new(|_: &WorkerConfig| {
                Box::new(NoopWorker { fail_init: false }) as Box<dyn Worker>
            }))
            .await;
        coordinator
            .register_agent_type("broken", Arc::new(|_: &WorkerConfig| {
                Box::new(NoopWorker { fail_init: true }) as Box<dyn Worker>
            }))
            .await;
        coordinator
    }

    fn fast(agent_id: &str, agent_type: &str) -> WorkerConfig {
        WorkerConfig::new(agent_id, agent_type)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_restart_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_start_rejects_duplicates_and_unknown_types() {
        let c = coordinator().await;

        assert!(c.start_worker(fast("a1", "noop")).await.unwrap());
        assert!(!c.start_worker(fast("a1", "noop")).await.unwrap());
        assert!(!c.start_worker(fast("a2", "mystery")).await.unwrap());

        let status = c.get_system_status().await;
        assert_eq!(status.total_agents, 1);
        assert_eq!(status.active_agents, 1);
        assert_eq!(status.registered_agent_types, vec!["broken", "noop"]);

        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_initialize_is_not_registered() {
        let c = coordinator().await;
        let err = c.start_worker(fast("b1", "broken")).await.unwrap_err();
        assert!(matches!(err, FleetError::Initialization { .. }));
        assert!(c.get_agent_info("b1").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_and_restart_agent() {
        let c = coordinator().await;
        c.start_worker(fast("a1", "noop")).await.unwrap();
        let agent = c.agent("a1").await.unwrap();

        assert!(c.restart_agent("a1").await.unwrap());
        assert_eq!(agent.restart_count(), 1);
        assert_eq!(agent.status().await, AgentStatus::Running);

        assert!(c.stop_agent("a1").await);
        assert!(!c.stop_agent("a1").await);
        assert!(!c.restart_agent("a1").await.unwrap());
        assert_eq!(agent.status().await, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_restarts() {
        let c = coordinator().await;
        c.start_worker(fast("a1", "noop")).await.unwrap();

        // Inside the window: nothing happens
        let report = c.check_health().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.restarted(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = c.check_health().await;
        assert_eq!(report.stale, vec!["a1".to_string()]);
        assert_eq!(c.agent("a1").await.unwrap().restart_count(), 1);

        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_heartbeat_never_moves_backwards() {
        let c = coordinator().await;
        c.start_worker(fast("a1", "noop")).await.unwrap();
        let fresh = c.entries().await[0].1.last_heartbeat;

        // A heartbeat queued before a restart shows up after it
        assert!(c
            .record_heartbeat("a1", fresh - chrono::Duration::seconds(10))
            .await);
        assert_eq!(c.entries().await[0].1.last_heartbeat, fresh);
        assert_eq!(c.check_health().await.restarted(), 0);

        let later = fresh + chrono::Duration::milliseconds(20);
        c.record_heartbeat("a1", later).await;
        assert_eq!(c.entries().await[0].1.last_heartbeat, later);
        assert!(!c.record_heartbeat("ghost", later).await);

        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_unhealthy_agent_restarts_on_third_strike() {
        let c = coordinator().await;
        c.start_worker(WorkerConfig::new("a1", "noop").with_restart_delay(Duration::ZERO))
            .await
            .unwrap();
        let agent = c.agent("a1").await.unwrap();
        agent.stop().await;

        assert!(c.check_health().await.unhealthy.is_empty());
        assert!(c.check_health().await.unhealthy.is_empty());
        assert_eq!(c.check_health().await.unhealthy, vec!["a1".to_string()]);

        assert_eq!(agent.restart_count(), 1);
        assert!(agent.is_healthy().await);
        assert!(c.check_health().await.unhealthy.is_empty());

        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_payloads() {
        let c = coordinator().await;

        c.handle_control(&json!({
            "command": "start_agent",
            "parameters": {"agent_type": "noop", "agent_id": "n1", "config": {"heartbeat_interval": 0.05}}
        }))
        .await
        .unwrap();
        assert!(c.agent("n1").await.is_some());

        c.handle_control(&json!({"command": "stop_agent", "parameters": {"agent_id": "n1"}}))
            .await
            .unwrap();
        assert!(c.agent("n1").await.is_none());

        let err = c.handle_control(&json!({"command": "reboot_universe"})).await.unwrap_err();
        assert!(matches!(err, FleetError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn test_typed_broadcast_goes_point_to_point() {
        let c = coordinator().await;
        c.start_worker(fast("n1", "noop")).await.unwrap();
        c.agent("n1").await.unwrap().stop().await;

        let sent = c
            .broadcast("risk_alert", json!({"level": "high"}), Some(&["noop".to_string()]))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(c.bus().queue_length("n1").await.unwrap(), 1);
    }

    struct TeardownWorker {
        cleanups: Arc<std::sync::atomic::AtomicUsize>,
        panic_on_cleanup: bool,
    }

    #[async_trait]
    impl Worker for TeardownWorker {
        async fn process_message(&mut self, _message: &ProtocolMessage) -> Result<bool> {
            Ok(true)
        }

        async fn cleanup(&mut self) -> Result<()> {
            if self.panic_on_cleanup {
                panic!("exchange session already gone");
            }
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_survives_panicking_cleanup() {
        let c = coordinator().await;
        let cleanups = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for (agent_type, panic_on_cleanup) in [("steady", false), ("fragile", true)] {
            let cleanups = cleanups.clone();
            c.register_agent_type(
                agent_type,
                Arc::new(move |_: &WorkerConfig| {
                    Box::new(TeardownWorker {
                        cleanups: cleanups.clone(),
                        panic_on_cleanup,
                    }) as Box<dyn Worker>
                }),
            )
            .await;
        }

        for i in 0..4 {
            c.start_worker(fast(&format!("s{}", i), "steady")).await.unwrap();
        }
        c.start_worker(fast("f1", "fragile")).await.unwrap();

        c.shutdown().await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 4);
        assert_eq!(c.get_system_status().await.total_agents, 0);
        assert!(c.bus().ping().await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_collect_stats_and_system_check() {
        let c = coordinator().await;
        c.start_worker(fast("a1", "noop")).await.unwrap();

        let stats = c.collect_stats().await;
        assert_eq!(stats.total_agents, 1);
        assert_eq!(stats.active_agents, 1);
        assert_eq!(c.last_stats().await.unwrap().total_agents, 1);

        assert!(!c.check_system().await.unwrap());
        c.shutdown().await;
        assert!(c.check_system().await.unwrap_err().is_transport());
    }
}
