use agent_fleet::{
    AgentContext, AgentStatus, Coordinator, CoordinatorConfig, FleetError, MessageBus,
    MessageType, ProtocolMessage, Result, Worker, WorkerConfig, COORDINATOR_ID,
};
use agent_fleet::protocol::AgentProtocol;
use agent_fleet::{handler_fn, DispatchOutcome};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct Spy {
    initialized: AtomicUsize,
    processed: AtomicUsize,
    cleaned_up: AtomicUsize,
}

struct EchoWorker {
    accept: bool,
    spy: Arc<Spy>,
}

#[async_trait]
impl Worker for EchoWorker {
    async fn initialize(&mut self, ctx: &AgentContext) -> Result<()> {
        self.spy.initialized.fetch_add(1, Ordering::SeqCst);
        ctx.report_resources(64.0, 0.01);
        Ok(())
    }

    async fn process_message(&mut self, _message: &ProtocolMessage) -> Result<bool> {
        self.spy.processed.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept)
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.spy.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn fleet(accept: bool) -> (Arc<Coordinator>, Arc<Spy>) {
    agent_fleet::init_logging_simple();
    let coordinator = Coordinator::new(
        Arc::new(MessageBus::in_memory()),
        CoordinatorConfig::default(),
    );
    let spy = Arc::new(Spy::default());
    let factory_spy = spy.clone();
    coordinator
        .register_agent_type(
            "Echo",
            Arc::new(move |_: &WorkerConfig| {
                Box::new(EchoWorker {
                    accept,
                    spy: factory_spy.clone(),
                }) as Box<dyn Worker>
            }),
        )
        .await;
    (coordinator, spy)
}

fn params(value: serde_json::Value) -> HashMap<String, serde_json::Value> {
    serde_json::from_value(value).unwrap()
}

async fn eventually<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn deliver(bus: &MessageBus, receiver: &str, n: usize) {
    for seq in 0..n {
        assert_ok!(
            bus.publish_new("DATA", json!({ "seq": seq }), "feed", Some(receiver), None, None)
                .await
        );
    }
}

#[tokio::test]
async fn echo_worker_processes_every_delivered_message() {
    let (coordinator, _spy) = fleet(true).await;
    assert!(assert_ok!(coordinator.start_agent("Echo", "a1", HashMap::new()).await));

    deliver(coordinator.bus(), "a1", 5).await;
    eventually("5 processed messages", || async {
        coordinator
            .get_agent_info("a1")
            .await
            .is_some_and(|info| info.messages_processed == 5)
    })
    .await;

    let info = coordinator.get_agent_info("a1").await.unwrap();
    assert_eq!(info.error_count, 0);
    assert_eq!(info.status, AgentStatus::Running);
    assert_eq!(info.memory_usage, 64.0);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn failing_worker_restarts_exactly_once_at_threshold() {
    let (coordinator, spy) = fleet(false).await;
    let started = coordinator
        .start_agent(
            "Echo",
            "a1",
            params(json!({"max_errors": 3, "restart_delay": 0.01})),
        )
        .await;
    assert!(assert_ok!(started));

    deliver(coordinator.bus(), "a1", 3).await;
    eventually("the restart", || async {
        spy.initialized.load(Ordering::SeqCst) == 2
            && coordinator
                .get_agent_info("a1")
                .await
                .is_some_and(|info| info.status == AgentStatus::Running)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let info = coordinator.get_agent_info("a1").await.unwrap();
    assert_eq!(info.restart_count, 1);
    assert_eq!(info.error_count, 0);
    assert_eq!(spy.processed.load(Ordering::SeqCst), 3);
    assert_eq!(spy.cleaned_up.load(Ordering::SeqCst), 1);

    coordinator.shutdown().await;
    assert_eq!(spy.cleaned_up.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mailbox_is_fifo_for_a_single_consumer() {
    let bus = Arc::new(MessageBus::in_memory());
    let consumer = AgentProtocol::new("consumer", bus.clone());
    deliver(&bus, "consumer", 50).await;

    for expected in 0..50 {
        let message = consumer
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload()["seq"], expected);
    }
    assert!(consumer.receive(Duration::from_millis(10)).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_messages_never_reach_handlers() {
    let bus = Arc::new(MessageBus::in_memory());
    let protocol = AgentProtocol::new("p2", bus.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    protocol
        .register_handler(
            MessageType::Data,
            handler_fn(move |_m: ProtocolMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

    let short = Some(chrono::Duration::milliseconds(40));
    bus.publish_new("data", json!({"late": true}), "feed", Some("p2"), None, short)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.publish_new("data", json!({"late": false}), "feed", Some("p2"), None, short)
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    while let Some(message) = bus.receive("p2", Duration::from_millis(20)).await.unwrap() {
        outcomes.push(protocol.handle_message(message).await);
    }

    assert_eq!(outcomes, vec![DispatchOutcome::Expired, DispatchOutcome::Handled]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn inbox_heartbeats_keep_workers_fresh() {
    let (coordinator, _spy) = fleet(true).await;
    assert_ok!(coordinator.start().await);
    let started = coordinator
        .start_agent("Echo", "a1", params(json!({"heartbeat_interval": 0.05})))
        .await;
    assert!(assert_ok!(started));

    // Well past 3 heartbeat intervals since registration
    tokio::time::sleep(Duration::from_millis(400)).await;
    let report = coordinator.check_health().await;
    assert_eq!(report.checked, 1);
    assert!(report.stale.is_empty());
    assert_eq!(coordinator.get_agent_info("a1").await.unwrap().restart_count, 0);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn control_messages_drive_the_registry() {
    let (coordinator, _spy) = fleet(true).await;
    assert_ok!(coordinator.start().await);
    let ops = AgentProtocol::new("ops", coordinator.bus().clone());

    assert_ok!(
        ops.send_control(
            COORDINATOR_ID,
            "start_agent",
            json!({"agent_type": "Echo", "agent_id": "e1", "config": {}}),
        )
        .await
    );
    eventually("e1 to start", || async { coordinator.agent("e1").await.is_some() }).await;

    assert_ok!(
        ops.send_control(COORDINATOR_ID, "stop_agent", json!({"agent_id": "e1"}))
            .await
    );
    eventually("e1 to stop", || async { coordinator.agent("e1").await.is_none() }).await;

    let status = coordinator.get_system_status().await;
    assert!(status.running);
    assert_eq!(status.total_agents, 0);
    assert_eq!(status.registered_agent_types, vec!["Echo".to_string()]);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn stop_twice_cleans_up_once() {
    let (coordinator, spy) = fleet(true).await;
    assert_ok!(coordinator.start_agent("Echo", "a1", HashMap::new()).await);
    let agent = coordinator.agent("a1").await.unwrap();

    agent.stop().await;
    agent.stop().await;
    assert_eq!(spy.cleaned_up.load(Ordering::SeqCst), 1);
    assert_eq!(agent.status().await, AgentStatus::Stopped);
}

#[tokio::test]
async fn shutdown_stops_everything_and_closes_the_bus() {
    let (coordinator, spy) = fleet(true).await;
    assert_ok!(coordinator.start().await);
    for id in ["a1", "a2", "a3"] {
        assert_ok!(coordinator.start_agent("Echo", id, HashMap::new()).await);
    }

    coordinator.shutdown().await;

    assert_eq!(spy.cleaned_up.load(Ordering::SeqCst), 3);
    let status = coordinator.get_system_status().await;
    assert!(!status.running);
    assert_eq!(status.total_agents, 0);

    let err = assert_err!(
        coordinator
            .bus()
            .publish_new("data", json!({}), "feed", Some("a1"), None, None)
            .await
    );
    assert!(matches!(err, FleetError::Transport(_)));
}
