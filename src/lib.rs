//! diffcalc: lease-based diff calculation scheduler for golden-image testing.
//!
//! Worker processes share two work queues in a relational database: one row
//! per primary-branch grouping and one per review-branch/grouping pair. Each
//! worker repeatedly claims the stalest eligible row under a time-bounded
//! lease, asks a diff engine to compute it, and records completion. Workers
//! that crash simply let their lease expire.
//!
//! # Modules
//!
//! - [`storage`]: work store traits and the PostgreSQL / SQLite backends
//! - [`grouping`]: grouping id to params resolution with an LRU cache
//! - [`diff`]: the diff engine seam and its HTTP implementation
//! - [`scheduler`]: the claimer and the polling loop
//! - [`metrics`]: Prometheus counters, busy pulses, `/metrics` endpoint
//! - [`config`] / [`cli`]: configuration loading and the `diffcalculator` binary

pub mod cli;
pub mod clock;
pub mod config;
pub mod diff;
pub mod error;
pub mod grouping;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, DiffCalculatorConfig, SchedulerConfig};
pub use error::{ClaimError, DiffError, PollError, ResolveError};
pub use storage::StoreError;
pub use types::{Digest, GroupingId, Params, SecondaryWork};
