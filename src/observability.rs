//! Tracing setup and controller counters

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A subscriber may already be installed (tests, embedding)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Counters owned by the controller
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    log_entries: AtomicU64,
    status_updates: AtomicU64,
    events_broadcast: AtomicU64,
    pumps: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_entry(&self) {
        self.log_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status_update(&self) {
        self.status_updates.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "status_updates", "Metric incremented");
    }

    pub fn event_broadcast(&self) {
        self.events_broadcast.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "events_broadcast", "Metric incremented");
    }

    pub fn pump(&self) {
        self.pumps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            log_entries: self.log_entries.load(Ordering::Relaxed),
            status_updates: self.status_updates.load(Ordering::Relaxed),
            events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
            pumps: self.pumps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub log_entries: u64,
    pub status_updates: u64,
    pub events_broadcast: u64,
    pub pumps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = PipelineMetrics::new();
        metrics.log_entry();
        metrics.log_entry();
        metrics.event_broadcast();
        metrics.pump();

        let snap = metrics.snapshot();
        assert_eq!(snap.log_entries, 2);
        assert_eq!(snap.events_broadcast, 1);
        assert_eq!(snap.status_updates, 0);
        assert_eq!(snap.pumps, 1);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing("info");
        init_tracing("debug");
    }
}
