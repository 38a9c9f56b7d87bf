//! Worker trait - the business logic a `SupervisedAgent` drives
//!
//! The supervisor owns the loops; a worker only reacts. It is initialized
//! once per start, handed every mailbox message in order, and cleaned up once
//! per successful start.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::message::ProtocolMessage;

use super::context::AgentContext;
use super::types::WorkerConfig;

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Prepare resources. An error aborts `start()` and leaves the agent in
    /// the Error state. Keep a clone of `ctx` to send messages later.
    async fn initialize(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// Handle one mailbox message. `Ok(false)` and `Err` both count as a
    /// processing failure.
    async fn process_message(&mut self, message: &ProtocolMessage) -> Result<bool>;

    /// Release resources. Runs on every `stop()` that follows a successful start.
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh worker for a registered agent type
pub type WorkerFactory = Arc<dyn Fn(&WorkerConfig) -> Box<dyn Worker> + Send + Sync>;
