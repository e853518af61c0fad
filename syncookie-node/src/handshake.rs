use crate::config::HandshakeConfig;
use crate::packet::FlowKey;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of the half-open connection count used by the adaptive flood check
pub trait HalfOpenCounter: Send + Sync {
    fn half_open_count(&self) -> u64;
}

impl HalfOpenCounter for AtomicU64 {
    fn half_open_count(&self) -> u64 {
        self.load(Ordering::Relaxed)
    }
}

/// Handshakes admitted to the host stack that have not completed yet
#[derive(Debug)]
pub struct HandshakeTable {
    /// SYN arrival time per flow
    pending: DashMap<FlowKey, Instant>,
    /// Rebuilt SYNs injected back toward the host, keyed by flow
    replayed: DashMap<FlowKey, Instant>,
    /// Maximum time to wait for the completing ACK
    timeout: Duration,
    /// Maximum number of tracked handshakes
    max_tracked: usize,
}

impl HandshakeTable {
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            pending: DashMap::new(),
            replayed: DashMap::new(),
            timeout: Duration::from_secs(config.timeout_seconds),
            max_tracked: config.max_tracked,
        }
    }

    /// Track a SYN; returns false when the table is full
    pub fn record_syn(&self, key: FlowKey) -> bool {
        self.record_syn_at(key, Instant::now())
    }

    pub fn record_syn_at(&self, key: FlowKey, now: Instant) -> bool {
        if self.pending.len() >= self.max_tracked && !self.pending.contains_key(&key) {
            warn!(
                src = %key.src,
                sport = key.sport,
                max_tracked = self.max_tracked,
                "Handshake table full, not tracking SYN"
            );
            return false;
        }
        self.pending.insert(key, now);
        true
    }

    /// Handshake completed (or was reset); returns whether it was tracked
    pub fn remove(&self, key: &FlowKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Remember a rebuilt SYN about to be injected so it is recognized when it comes back
    pub fn mark_replayed(&self, key: FlowKey) {
        self.replayed.insert(key, Instant::now());
    }

    /// Consume the replay mark of a flow; false when absent or older than the timeout
    pub fn take_replayed(&self, key: &FlowKey) -> bool {
        self.replayed
            .remove(key)
            .is_some_and(|(_, injected)| injected.elapsed() < self.timeout)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop handshakes older than the timeout, returning how many were removed
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        self.replayed
            .retain(|_, injected| now.saturating_duration_since(*injected) < self.timeout);

        let initial_count = self.pending.len();
        self.pending
            .retain(|_, started| now.saturating_duration_since(*started) < self.timeout);
        initial_count.saturating_sub(self.pending.len())
    }

    /// Start background task to expire stale handshakes
    pub fn start_cleanup_task(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let cleaned = self.cleanup_expired(Instant::now());
                if cleaned > 0 {
                    debug!(cleaned, "Cleaned up expired handshakes");
                }
                gauge!("syncookies_half_open", self.pending.len() as f64);
            }
        })
    }
}

impl HalfOpenCounter for HandshakeTable {
    fn half_open_count(&self) -> u64 {
        self.pending.len() as u64
    }
}
