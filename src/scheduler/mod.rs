//! Diff work scheduling.
//!
//! - **claimer**: claims one row from a work queue, computes its diffs, and
//!   marks it calculated
//! - **poller**: the per-process loop choosing between primary-branch and
//!   review-branch work, backing off when a queue is empty
//!
//! Any number of processes can run a poller against the same store. All
//! coordination between them goes through row leases.

pub mod claimer;
pub mod poller;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClaimError;

pub use claimer::{Claimer, ClaimerSettings, ContentionMode};
pub use poller::{Poller, PollerSettings};

/// Result of one claim-and-compute attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was claimable.
    NoWork,
    /// One unit of work was computed and marked calculated.
    Computed,
}

/// The two work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkSource {
    Primary,
    Secondary,
}

impl fmt::Display for WorkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkSource::Primary => write!(f, "primary"),
            WorkSource::Secondary => write!(f, "secondary"),
        }
    }
}

/// Runs one unit of work from either queue.
#[async_trait]
pub trait WorkRunner: Send + Sync {
    async fn run_primary(&self) -> Result<WorkOutcome, ClaimError>;

    async fn run_secondary(&self) -> Result<WorkOutcome, ClaimError>;
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(millis)
}
