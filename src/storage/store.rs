//! Storage traits shared by every backend.
//!
//! [`WorkStore`] is the consumer side used by the claimer, [`WorkProducer`] is
//! the contract the work gatherer writes through, and [`GroupingStore`] backs
//! the grouping resolver.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::seq::IndexedRandom;
use thiserror::Error;

use crate::types::{
    Digest, GroupingId, InvalidGroupingId, Params, PrimaryWorkRow, SecondaryWork,
    SecondaryWorkRow,
};

use super::migrations::MigrationError;

/// Number of oldest eligible rows the high-contention claim picks from.
///
/// Large enough that two workers rarely pick the same row.
pub const HIGH_CONTENTION_CANDIDATES: usize = 50;

/// Errors that can occur during work store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A transaction kept hitting serialization conflicts.
    #[error("{operation} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// A stored row could not be decoded.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// The database URL names no supported backend.
    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),

    /// A lease end or staleness cutoff falls outside the representable range.
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(String),
}

impl From<InvalidGroupingId> for StoreError {
    fn from(err: InvalidGroupingId) -> Self {
        StoreError::InvalidRow(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidRow(err.to_string())
    }
}

/// Database backends a store can be opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Picks the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else if url.starts_with("sqlite://") {
            Ok(Backend::Sqlite)
        } else {
            Err(StoreError::UnsupportedUrl(url.to_string()))
        }
    }
}

/// Returns `now + lease`.
pub(crate) fn lease_end(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, StoreError> {
    now.checked_add_signed(lease)
        .ok_or_else(|| StoreError::TimestampOutOfRange(format!("{now} + lease of {lease}")))
}

/// Returns `now - staleness`.
pub(crate) fn stale_cutoff(
    now: DateTime<Utc>,
    staleness: Duration,
) -> Result<DateTime<Utc>, StoreError> {
    now.checked_sub_signed(staleness)
        .ok_or_else(|| StoreError::TimestampOutOfRange(format!("{now} - staleness of {staleness}")))
}

/// Atomic claim/complete primitives over the two work queues.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Leases the primary-branch grouping calculated longest ago.
    ///
    /// Only rows whose lease has ended and whose last calculation is older
    /// than `now - staleness` are eligible. Returns `None` when nothing is.
    async fn claim_primary_work(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
        lease: Duration,
    ) -> Result<Option<GroupingId>, StoreError>;

    /// Records a successful primary-branch calculation. The lease is left alone.
    async fn complete_primary_work(
        &self,
        grouping: GroupingId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Selects the oldest eligible secondary row and leases it in one
    /// serializable unit.
    async fn claim_secondary_work_low_contention(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<SecondaryWork>, StoreError>;

    /// Reads up to `limit` of the oldest eligible secondary rows.
    ///
    /// This read is not transactional and may be slightly stale; callers must
    /// lease a candidate with [`WorkStore::lease_secondary_work`] before using it.
    async fn secondary_work_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecondaryWork>, StoreError>;

    /// Leases one specific secondary row if it is still eligible.
    ///
    /// Returns the row's digests as of the lease, which may be newer than the
    /// ones a candidate read saw. `None` means another worker leased it first
    /// (or it no longer needs calculating).
    async fn lease_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Vec<Digest>>, StoreError>;

    /// Picks one of the oldest eligible secondary rows at random and leases it.
    ///
    /// Losing the lease race to another worker yields `Ok(None)`.
    async fn claim_secondary_work_high_contention(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<SecondaryWork>, StoreError> {
        let candidates = self
            .secondary_work_candidates(now, HIGH_CONTENTION_CANDIDATES)
            .await?;
        let Some(work) = pick_candidate(&candidates) else {
            return Ok(None);
        };
        match self
            .lease_secondary_work(&work.branch, work.grouping_id, now, lease)
            .await?
        {
            Some(digests) => Ok(Some(SecondaryWork { digests, ..work })),
            None => {
                tracing::debug!(
                    branch = %work.branch,
                    grouping = %work.grouping_id,
                    "Lost lease race for secondary work"
                );
                Ok(None)
            }
        }
    }

    /// Records a successful secondary-branch calculation.
    async fn complete_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

fn pick_candidate(candidates: &[SecondaryWork]) -> Option<SecondaryWork> {
    candidates.choose(&mut rand::rng()).cloned()
}

/// Point lookups of grouping params.
#[async_trait]
pub trait GroupingStore: Send + Sync {
    /// Returns the params of a grouping, or `None` if it was never stored.
    async fn grouping_params(&self, grouping: GroupingId) -> Result<Option<Params>, StoreError>;
}

/// Write side used by the work gatherer to populate the queues.
#[async_trait]
pub trait WorkProducer: Send + Sync {
    /// Stores a grouping's params. Existing groupings are left untouched.
    async fn put_grouping(&self, grouping: GroupingId, params: &Params)
        -> Result<(), StoreError>;

    /// Makes sure every grouping has a primary-branch work row.
    ///
    /// New rows start never calculated and never leased; existing rows keep
    /// their timestamps.
    async fn ensure_primary_work(&self, groupings: &[GroupingId]) -> Result<(), StoreError>;

    /// Records new digests for a branch+grouping pair.
    ///
    /// Existing rows get their digest set and `last_updated_ts` replaced while
    /// keeping calculation and lease timestamps.
    async fn upsert_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        digests: &[Digest],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Removes every secondary row of a landed or abandoned branch.
    async fn retire_secondary_branch(&self, branch: &str) -> Result<u64, StoreError>;

    /// Reads one primary-branch row.
    async fn primary_work_row(
        &self,
        grouping: GroupingId,
    ) -> Result<Option<PrimaryWorkRow>, StoreError>;

    /// Reads one secondary-branch row.
    async fn secondary_work_row(
        &self,
        branch: &str,
        grouping: GroupingId,
    ) -> Result<Option<SecondaryWorkRow>, StoreError>;
}
