//! Metrics module for Prometheus-based monitoring.
//!
//! The diff calculator exports three counters: primary-branch groupings
//! processed, review-branch groupings processed, and busy pulses (one per
//! second spent busy).
//!
//! # Example
//!
//! ```ignore
//! use diffcalc::metrics::{init_metrics, serve_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! tokio::spawn(serve_metrics(":20000", shutdown.clone()));
//!
//! let collector = MetricsCollector::new();
//! collector.record_primary_processed();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

pub use collectors::{spawn_busy_reporter, BusyFlag, MetricsCollector, BUSY_PULSE_INTERVAL};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
pub use server::{metrics_router, parse_listen_addr, serve_metrics, MetricsError};

pub use prometheus::{BUSY_PULSES, CLS_PROCESSED, PRIMARY_PROCESSED, REGISTRY};
