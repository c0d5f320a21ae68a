//! Claim one unit of diff work, compute it, and record completion.
//!
//! Each entry point claims at most one row, resolves its grouping, runs the
//! diff engine, and marks the row calculated. A failed computation leaves the
//! row leased but not completed, so another worker picks it up once the lease
//! ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, field, info_span, Instrument, Span};

use crate::clock::Clock;
use crate::config::DiffCalculatorConfig;
use crate::diff::DiffEngine;
use crate::error::ClaimError;
use crate::grouping::GroupingResolver;
use crate::metrics::MetricsCollector;
use crate::storage::WorkStore;

use super::{to_chrono, WorkOutcome, WorkRunner};

/// How secondary-branch work is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionMode {
    /// Select and lease the oldest row in one serializable transaction.
    Low,
    /// Pick randomly among the oldest rows, then lease conditionally.
    High,
}

/// Timing and strategy of a [`Claimer`].
#[derive(Debug, Clone)]
pub struct ClaimerSettings {
    pub staleness_threshold: Duration,
    /// Lease length, and deadline for one unit of work.
    pub lease_duration: Duration,
    pub contention_mode: ContentionMode,
}

impl Default for ClaimerSettings {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(60),
            lease_duration: Duration::from_secs(600),
            contention_mode: ContentionMode::Low,
        }
    }
}

impl From<&DiffCalculatorConfig> for ClaimerSettings {
    fn from(config: &DiffCalculatorConfig) -> Self {
        Self {
            staleness_threshold: config.scheduler.staleness_threshold(),
            lease_duration: config.scheduler.lease_duration(),
            contention_mode: if config.high_contention_mode {
                ContentionMode::High
            } else {
                ContentionMode::Low
            },
        }
    }
}

/// Claims and computes diff work against a shared work store.
pub struct Claimer {
    store: Arc<dyn WorkStore>,
    resolver: Arc<GroupingResolver>,
    engine: Arc<dyn DiffEngine>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    settings: ClaimerSettings,
}

impl Claimer {
    pub fn new(
        store: Arc<dyn WorkStore>,
        resolver: Arc<GroupingResolver>,
        engine: Arc<dyn DiffEngine>,
        clock: Arc<dyn Clock>,
        settings: ClaimerSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            engine,
            clock,
            metrics: MetricsCollector::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ClaimerSettings {
        &self.settings
    }

    /// Claims the stalest primary-branch grouping and computes its diffs.
    pub async fn claim_and_compute_primary(&self) -> Result<WorkOutcome, ClaimError> {
        let span = info_span!("claim_and_compute_primary", grouping = field::Empty);
        self.with_deadline(self.compute_primary()).instrument(span).await
    }

    /// Claims secondary-branch work by random pick among the oldest rows.
    pub async fn claim_and_compute_secondary_high_contention(
        &self,
    ) -> Result<WorkOutcome, ClaimError> {
        let span = info_span!(
            "claim_and_compute_secondary_high_contention",
            branch = field::Empty,
            grouping = field::Empty
        );
        self.with_deadline(self.compute_secondary(ContentionMode::High))
            .instrument(span)
            .await
    }

    /// Claims the oldest secondary-branch row in one transaction.
    pub async fn claim_and_compute_secondary_low_contention(
        &self,
    ) -> Result<WorkOutcome, ClaimError> {
        let span = info_span!(
            "claim_and_compute_secondary_low_contention",
            branch = field::Empty,
            grouping = field::Empty
        );
        self.with_deadline(self.compute_secondary(ContentionMode::Low))
            .instrument(span)
            .await
    }

    async fn with_deadline<F>(&self, unit: F) -> Result<WorkOutcome, ClaimError>
    where
        F: std::future::Future<Output = Result<WorkOutcome, ClaimError>>,
    {
        let deadline = self.settings.lease_duration;
        tokio::time::timeout(deadline, unit)
            .await
            .map_err(|_| ClaimError::DeadlineExceeded(deadline))?
    }

    async fn compute_primary(&self) -> Result<WorkOutcome, ClaimError> {
        let claimed = self
            .store
            .claim_primary_work(
                self.clock.now(),
                to_chrono(self.settings.staleness_threshold),
                to_chrono(self.settings.lease_duration),
            )
            .await?;
        let Some(grouping) = claimed else {
            return Ok(WorkOutcome::NoWork);
        };
        Span::current().record("grouping", field::display(&grouping));

        let params = self.resolver.resolve(grouping).await?;
        self.engine
            .calculate_diffs(&params, &[])
            .await
            .map_err(|source| ClaimError::Diff { grouping, source })?;

        self.store
            .complete_primary_work(grouping, self.clock.now())
            .await?;
        self.metrics.record_primary_processed();
        debug!("Primary-branch diffs calculated");
        Ok(WorkOutcome::Computed)
    }

    async fn compute_secondary(&self, mode: ContentionMode) -> Result<WorkOutcome, ClaimError> {
        let now = self.clock.now();
        let lease = to_chrono(self.settings.lease_duration);
        let claimed = match mode {
            ContentionMode::High => {
                self.store
                    .claim_secondary_work_high_contention(now, lease)
                    .await?
            }
            ContentionMode::Low => {
                self.store
                    .claim_secondary_work_low_contention(now, lease)
                    .await?
            }
        };
        let Some(work) = claimed else {
            return Ok(WorkOutcome::NoWork);
        };
        if work.digests.is_empty() {
            return Ok(WorkOutcome::NoWork);
        }

        let span = Span::current();
        span.record("branch", work.branch.as_str());
        span.record("grouping", field::display(&work.grouping_id));

        let params = self.resolver.resolve(work.grouping_id).await?;
        self.engine
            .calculate_diffs(&params, &work.digests)
            .await
            .map_err(|source| ClaimError::Diff {
                grouping: work.grouping_id,
                source,
            })?;

        self.store
            .complete_secondary_work(&work.branch, work.grouping_id, self.clock.now())
            .await?;
        self.metrics.record_cls_processed();
        debug!(digests = work.digests.len(), "Secondary-branch diffs calculated");
        Ok(WorkOutcome::Computed)
    }
}

#[async_trait]
impl WorkRunner for Claimer {
    async fn run_primary(&self) -> Result<WorkOutcome, ClaimError> {
        self.claim_and_compute_primary().await
    }

    async fn run_secondary(&self) -> Result<WorkOutcome, ClaimError> {
        match self.settings.contention_mode {
            ContentionMode::High => self.claim_and_compute_secondary_high_contention().await,
            ContentionMode::Low => self.claim_and_compute_secondary_low_contention().await,
        }
    }
}
