//! Supervised workers
//!
//! `Worker` is the business seam, `SupervisedAgent` the lifecycle around it:
//! heartbeat, message pump, error-threshold self-restart.

pub mod context;
pub mod supervised;
pub mod traits;
pub mod types;

pub use context::AgentContext;
pub use supervised::{SupervisedAgent, LOOP_ERROR_BACKOFF, PUMP_RECEIVE_TIMEOUT};
pub use traits::{Worker, WorkerFactory};
pub use types::{
    AgentStatus, ResourceGauges, WorkerConfig, WorkerInfo, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MAX_ERRORS, DEFAULT_RESTART_DELAY,
};
