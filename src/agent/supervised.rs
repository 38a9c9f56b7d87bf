//! SupervisedAgent - lifecycle wrapper around a `Worker`
//!
//! A running agent owns two tasks and one subscription:
//!   - heartbeat loop: reports status and gauges to the coordinator every
//!     `heartbeat_interval`, backing off after a failed send
//!   - message pump: drains the agent's mailbox into `process_message` and
//!     restarts the agent once `error_count` reaches `max_errors`
//!   - broadcast subscription feeding the protocol handlers
//!
//! Lifecycle calls (start / stop / restart) are serialized per agent.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::context::AgentContext;
use super::traits::Worker;
use super::types::{AgentStatus, GaugeCell, WorkerConfig, WorkerInfo};
use crate::bus::{MessageBus, Subscription};
use crate::error::{FleetError, Result};
use crate::message::ProtocolMessage;
use crate::protocol::AgentProtocol;

/// How long one pump iteration waits on the mailbox
pub const PUMP_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after a failed heartbeat or mailbox read
pub const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RunningTasks {
    heartbeat: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
    /// Set by a successful start, consumed by the stop that runs cleanup
    needs_cleanup: bool,
}

struct AgentInner {
    config: Arc<WorkerConfig>,
    protocol: Arc<AgentProtocol>,
    worker: Mutex<Box<dyn Worker>>,
    status: RwLock<AgentStatus>,
    running: AtomicBool,
    messages_processed: AtomicU64,
    error_count: AtomicU64,
    restart_count: AtomicU64,
    started_at: RwLock<Option<DateTime<Utc>>>,
    gauges: Arc<GaugeCell>,
    tasks: Mutex<RunningTasks>,
    lifecycle: Mutex<()>,
}

/// Clonable handle to one supervised worker
#[derive(Clone)]
pub struct SupervisedAgent {
    inner: Arc<AgentInner>,
}

impl SupervisedAgent {
    pub fn new(config: WorkerConfig, worker: Box<dyn Worker>, bus: Arc<MessageBus>) -> Self {
        let protocol = Arc::new(AgentProtocol::new(&config.agent_id, bus));
        Self {
            inner: Arc::new(AgentInner {
                config: Arc::new(config),
                protocol,
                worker: Mutex::new(worker),
                status: RwLock::new(AgentStatus::Idle),
                running: AtomicBool::new(false),
                messages_processed: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                restart_count: AtomicU64::new(0),
                started_at: RwLock::new(None),
                gauges: Arc::new(GaugeCell::default()),
                tasks: Mutex::new(RunningTasks::default()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn protocol(&self) -> &Arc<AgentProtocol> {
        &self.inner.protocol
    }

    pub async fn status(&self) -> AgentStatus {
        *self.inner.status.read().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.inner.error_count.load(Ordering::SeqCst)
    }

    pub fn messages_processed(&self) -> u64 {
        self.inner.messages_processed.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u64 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }

    // ==================== Lifecycle ====================

    /// Initialize the worker and spawn its loops. A no-op when already running.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Stop the loops, drop the subscription and run cleanup. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked().await;
    }

    /// Stop, wait `restart_delay`, start again
    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.restart_locked().await
    }

    /// Restart requested by the pump after too many failures. Skipped when a
    /// stop got in first. Boxed: the pump spawns it and it spawns the pump.
    fn restart_after_errors(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if !self.is_running() {
                debug!("{} stopped before its error restart ran", self.agent_id());
                return;
            }
            if let Err(e) = self.restart_locked().await {
                error!("{} failed to restart after errors: {}", self.agent_id(), e);
            }
        })
    }

    async fn restart_locked(&self) -> Result<()> {
        let agent_id = self.agent_id().to_string();
        info!("Restarting agent {}", agent_id);

        self.stop_locked().await;
        self.inner.restart_count.fetch_add(1, Ordering::SeqCst);
        *self.inner.status.write().await = AgentStatus::Restarting;

        tokio::time::sleep(self.inner.config.restart_delay).await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<()> {
        let inner = &self.inner;
        let agent_id = inner.config.agent_id.clone();
        if inner.running.load(Ordering::SeqCst) {
            debug!("Agent {} already running", agent_id);
            return Ok(());
        }

        inner.messages_processed.store(0, Ordering::SeqCst);
        inner.error_count.store(0, Ordering::SeqCst);

        inner.protocol.initialize().await;
        let ctx = AgentContext::new(
            inner.config.clone(),
            inner.protocol.clone(),
            inner.gauges.clone(),
        );

        let init = {
            let mut worker = inner.worker.lock().await;
            AssertUnwindSafe(worker.initialize(&ctx)).catch_unwind().await
        };
        let failure = match init {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("initialize panicked".to_string()),
        };
        if let Some(reason) = failure {
            *inner.status.write().await = AgentStatus::Error;
            error!("Agent {} failed to initialize: {}", agent_id, reason);
            return Err(FleetError::Initialization { agent_id, reason });
        }

        inner.running.store(true, Ordering::SeqCst);
        *inner.status.write().await = AgentStatus::Running;
        *inner.started_at.write().await = Some(Utc::now());

        let subscription = match inner.protocol.subscribe_broadcasts().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Agent {} running without broadcasts: {}", agent_id, e);
                None
            }
        };

        let mut tasks = inner.tasks.lock().await;
        tasks.heartbeat = Some(tokio::spawn(heartbeat_loop(Arc::downgrade(inner))));
        tasks.pump = Some(tokio::spawn(pump_loop(Arc::downgrade(inner))));
        tasks.subscription = subscription;
        tasks.needs_cleanup = true;

        info!("Agent {} ({}) started", agent_id, inner.config.agent_type);
        Ok(())
    }

    async fn stop_locked(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        *inner.status.write().await = AgentStatus::Stopped;

        let tasks = std::mem::take(&mut *inner.tasks.lock().await);
        for handle in [tasks.heartbeat, tasks.pump].into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(subscription) = tasks.subscription {
            subscription.cancel().await;
        }

        if tasks.needs_cleanup {
            let cleanup = {
                let mut worker = inner.worker.lock().await;
                AssertUnwindSafe(worker.cleanup()).catch_unwind().await
            };
            match cleanup {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Agent {} cleanup failed: {}", inner.config.agent_id, e),
                Err(_) => error!("Agent {} panicked during cleanup", inner.config.agent_id),
            }
            info!("Agent {} stopped", inner.config.agent_id);
        }
    }

    // ==================== Introspection ====================

    /// Running, under the error budget, and not told to stop
    pub async fn is_healthy(&self) -> bool {
        self.status().await == AgentStatus::Running
            && self.error_count() < self.inner.config.max_errors
            && self.is_running()
    }

    pub fn report_resources(&self, memory_usage: f64, cpu_usage: f64) {
        self.inner.gauges.store(super::types::ResourceGauges {
            memory_usage,
            cpu_usage,
        });
    }

    pub async fn info(&self) -> WorkerInfo {
        let inner = &self.inner;
        let started_at = *inner.started_at.read().await;
        let status = self.status().await;
        let uptime_secs = match (status, started_at) {
            (AgentStatus::Running, Some(at)) => {
                (Utc::now() - at).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };
        let gauges = inner.gauges.load();

        WorkerInfo {
            agent_id: inner.config.agent_id.clone(),
            agent_type: inner.config.agent_type.clone(),
            status,
            uptime_secs,
            messages_processed: self.messages_processed(),
            error_count: self.error_count(),
            restart_count: self.restart_count(),
            memory_usage: gauges.memory_usage,
            cpu_usage: gauges.cpu_usage,
            started_at,
        }
    }
}

async fn heartbeat_loop(inner: Weak<AgentInner>) {
    loop {
        let Some(agent) = inner.upgrade() else { break };
        if !agent.running.load(Ordering::SeqCst) {
            break;
        }

        let status = *agent.status.read().await;
        let pause = match agent.protocol.send_heartbeat(status, agent.gauges.load()).await {
            Ok(_) => agent.config.heartbeat_interval,
            Err(e) => {
                warn!("Agent {} heartbeat failed: {}", agent.config.agent_id, e);
                LOOP_ERROR_BACKOFF
            }
        };
        drop(agent);
        tokio::time::sleep(pause).await;
    }
}

async fn pump_loop(inner: Weak<AgentInner>) {
    loop {
        let Some(agent) = inner.upgrade() else { break };
        if !agent.running.load(Ordering::SeqCst) {
            break;
        }
        let agent_id = agent.config.agent_id.clone();

        let received = AssertUnwindSafe(agent.protocol.receive(PUMP_RECEIVE_TIMEOUT))
            .catch_unwind()
            .await;
        let handled = match received {
            Ok(Ok(Some(message))) => process_one(&agent, message).await,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                warn!("Agent {} mailbox read failed: {}", agent_id, e);
                drop(agent);
                tokio::time::sleep(LOOP_ERROR_BACKOFF).await;
                continue;
            }
            Err(_) => {
                error!("Agent {} panicked reading its mailbox", agent_id);
                false
            }
        };
        if handled {
            continue;
        }

        let errors = agent.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        if errors >= agent.config.max_errors {
            warn!(
                "Agent {} reached {} errors (max {}), restarting",
                agent_id, errors, agent.config.max_errors
            );
            let handle = SupervisedAgent { inner: agent };
            tokio::spawn(handle.restart_after_errors());
            break;
        }
    }
}

/// Hand one message to the worker. True when it was handled.
async fn process_one(agent: &AgentInner, message: ProtocolMessage) -> bool {
    let agent_id = &agent.config.agent_id;
    let outcome = {
        let mut worker = agent.worker.lock().await;
        AssertUnwindSafe(worker.process_message(&message))
            .catch_unwind()
            .await
    };
    agent.messages_processed.fetch_add(1, Ordering::SeqCst);

    match outcome {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            warn!("Agent {} could not process message {}", agent_id, message.id());
            false
        }
        Ok(Err(e)) => {
            warn!(
                "Agent {} failed on message {}: {}",
                agent_id,
                message.id(),
                e
            );
            false
        }
        Err(_) => {
            error!("Agent {} panicked on message {}", agent_id, message.id());
            false
        }
    }
}
