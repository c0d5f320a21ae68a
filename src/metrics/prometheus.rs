//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics exported by the diff calculator
//! and provides functions for initializing, registering, and exporting them.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all diff calculator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Primary-branch groupings whose diffs were calculated.
pub static PRIMARY_PROCESSED: OnceLock<IntCounter> = OnceLock::new();

/// Review-branch (CL) groupings whose diffs were calculated.
pub static CLS_PROCESSED: OnceLock<IntCounter> = OnceLock::new();

/// Incremented by 0 or 1 every second, depending on whether the worker was busy.
pub static BUSY_PULSES: OnceLock<IntCounter> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls are harmless: the first set of
/// metrics wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let primary_processed = IntCounter::new(
        "diffcalculator_primarybranch_processed",
        "Number of primary-branch groupings whose diffs were calculated",
    )?;
    let cls_processed = IntCounter::new(
        "diffcalculator_cls_processed",
        "Number of review-branch groupings whose diffs were calculated",
    )?;
    let busy_pulses = IntCounter::new(
        "diffcalculator_busy_pulses",
        "Seconds during which the calculator was busy",
    )?;

    registry.register(Box::new(primary_processed.clone()))?;
    registry.register(Box::new(cls_processed.clone()))?;
    registry.register(Box::new(busy_pulses.clone()))?;

    // Guarded by INIT_LOCK, so none of these are set yet
    let _ = PRIMARY_PROCESSED.set(primary_processed);
    let _ = CLS_PROCESSED.set(cls_processed);
    let _ = BUSY_PULSES.set(busy_pulses);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
