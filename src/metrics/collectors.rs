//! Metric collectors for diff calculator operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics. `BusyFlag` is the
//! in-process busy state sampled once per second by the busy-pulse reporter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::prometheus::{BUSY_PULSES, CLS_PROCESSED, PRIMARY_PROCESSED};

/// How often the busy flag is sampled.
pub const BUSY_PULSE_INTERVAL: Duration = Duration::from_secs(1);

/// Metrics collector for recording diff calculator metrics.
///
/// Recording is a no-op until `init_metrics()` has been called.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one primary-branch grouping calculated.
    pub fn record_primary_processed(&self) {
        if let Some(counter) = PRIMARY_PROCESSED.get() {
            counter.inc();
        }
        tracing::trace!("Recorded primary-branch calculation");
    }

    /// Record one review-branch grouping calculated.
    pub fn record_cls_processed(&self) {
        if let Some(counter) = CLS_PROCESSED.get() {
            counter.inc();
        }
        tracing::trace!("Recorded review-branch calculation");
    }

    /// Record one busy-pulse sample.
    pub fn record_busy_pulse(&self, busy: bool) {
        if let Some(counter) = BUSY_PULSES.get() {
            counter.inc_by(u64::from(busy));
        }
    }

    /// Current primary-branch counter value, 0 if uninitialized.
    pub fn primary_processed(&self) -> u64 {
        PRIMARY_PROCESSED.get().map(|c| c.get()).unwrap_or(0)
    }

    /// Current review-branch counter value, 0 if uninitialized.
    pub fn cls_processed(&self) -> u64 {
        CLS_PROCESSED.get().map(|c| c.get()).unwrap_or(0)
    }

    /// Current busy-pulse counter value, 0 if uninitialized.
    pub fn busy_pulses(&self) -> u64 {
        BUSY_PULSES.get().map(|c| c.get()).unwrap_or(0)
    }
}

/// Whether the worker is currently computing (or about to compute) diffs.
///
/// Cloning shares the underlying flag.
#[derive(Debug, Clone)]
pub struct BusyFlag(Arc<AtomicBool>);

impl BusyFlag {
    /// Creates a flag; workers start busy.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self, busy: bool) {
        self.0.store(busy, Ordering::Relaxed);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for BusyFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the task that samples `flag` every `interval` until `shutdown` fires.
pub fn spawn_busy_reporter(
    flag: BusyFlag,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let collector = MetricsCollector::new();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Busy-pulse reporter stopped");
                    return;
                }
                _ = ticker.tick() => collector.record_busy_pulse(flag.is_busy()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_busy_flag_shared_between_clones() {
        let flag = BusyFlag::new();
        assert!(flag.is_busy());

        let other = flag.clone();
        other.set(false);
        assert!(!flag.is_busy());
    }

    #[test]
    fn test_counters_increase() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();

        let primary = collector.primary_processed();
        let cls = collector.cls_processed();
        collector.record_primary_processed();
        collector.record_cls_processed();

        // Other tests may record concurrently; counters never go down.
        assert!(collector.primary_processed() > primary);
        assert!(collector.cls_processed() > cls);
    }

    #[tokio::test]
    async fn test_busy_reporter_counts_busy_ticks() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();
        let before = collector.busy_pulses();

        let flag = BusyFlag::new();
        let shutdown = CancellationToken::new();
        let handle = spawn_busy_reporter(flag.clone(), Duration::from_millis(20), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(collector.busy_pulses() >= before + 3);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
