//! Coordinator - fleet registry, health monitoring and control commands

pub mod command;
pub mod config;
#[allow(clippy::module_inception)]
pub mod coordinator;
pub mod state;

pub use command::{ControlCommand, KNOWN_COMMANDS};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use state::{FleetStats, HealthReport, RegistryEntry, SystemStatus};
