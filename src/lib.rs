pub mod agent;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod router;

pub use agent::{
    AgentContext, AgentStatus, ResourceGauges, SupervisedAgent, Worker, WorkerConfig,
    WorkerFactory, WorkerInfo,
};
pub use bus::{
    handler_fn, BusStats, InMemoryTransport, MessageBus, MessageHandler, Subscription, Transport,
};
pub use config::{AppConfig, BusConfig, LoggingConfig};
pub use coordinator::{
    ControlCommand, Coordinator, CoordinatorConfig, FleetStats, HealthReport, SystemStatus,
};
pub use error::{FleetError, Result};
pub use logging::{init_logging, init_logging_simple};
pub use message::{Envelope, MessageBuilder, MessagePriority, MessageType, ProtocolMessage};
pub use protocol::{AgentProtocol, DispatchOutcome, ProtocolStats, SendOptions, COORDINATOR_ID};
pub use router::{Router, RoutingRule};
