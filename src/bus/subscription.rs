//! Scoped channel subscriptions
//!
//! A `Subscription` owns the task pumping one channel into one handler.
//! Dropping it (or calling `cancel`) unsubscribes, so a subscription cannot
//! outlive the scope that acquired it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Subscription {
    channel: String,
    agent_id: String,
    task: Option<JoinHandle<()>>,
    active: Arc<AtomicU64>,
}

impl Subscription {
    pub(crate) fn new(
        channel: &str,
        agent_id: &str,
        task: JoinHandle<()>,
        active: Arc<AtomicU64>,
    ) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            channel: channel.to_string(),
            agent_id: agent_id.to_string(),
            task: Some(task),
            active,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Still receiving (the channel has not closed under us)
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Unsubscribe and wait for the pump task to finish
    pub async fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "Agent {} unsubscribed from channel {}",
            self.agent_id, self.channel
        );
    }
}
