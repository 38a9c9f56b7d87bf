use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct ProtocolCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub failed: AtomicU64,
}

impl ProtocolCounters {
    pub fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-agent protocol statistics.
///
/// `messages_failed` counts failures at the messaging layer (undeliverable,
/// undecodable, unroutable, handler errors). It is separate from a worker's
/// `error_count`, which counts application-level processing failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub agent_id: String,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub success_rate: f64,
    pub registered_handlers: usize,
}

impl ProtocolStats {
    pub(crate) fn from_counters(
        agent_id: &str,
        counters: &ProtocolCounters,
        registered_handlers: usize,
    ) -> Self {
        let sent = counters.sent.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        Self {
            agent_id: agent_id.to_string(),
            messages_sent: sent,
            messages_received: counters.received.load(Ordering::Relaxed),
            messages_failed: failed,
            success_rate: success_rate(sent, failed),
            registered_handlers,
        }
    }
}

/// sent / (sent + failed); 1.0 before any traffic
pub fn success_rate(sent: u64, failed: u64) -> f64 {
    let total = sent + failed;
    if total == 0 {
        1.0
    } else {
        sent as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), 1.0);
        assert_eq!(success_rate(3, 1), 0.75);
        assert_eq!(success_rate(0, 4), 0.0);
    }
}
