//! SQLite work store.
//!
//! Used for single-host deployments and tests. Every claim is a single
//! `UPDATE ... WHERE rowid = (SELECT ...) RETURNING` statement, so selecting and
//! leasing a row happens under one write lock. Timestamps are stored as
//! milliseconds since the epoch and digest sets as JSON arrays.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::types::{
    beginning_of_time, digests_from_strings, digests_to_strings, Digest, GroupingId, Params,
    PrimaryWorkRow, SecondaryWork, SecondaryWorkRow,
};

use super::retry::TxRetryPolicy;
use super::schema;
use super::store::{lease_end, stale_cutoff, GroupingStore, StoreError, WorkProducer, WorkStore};

/// SQLite-backed work store.
#[derive(Clone)]
pub struct SqliteWorkStore {
    pool: SqlitePool,
    retry: TxRetryPolicy,
}

impl SqliteWorkStore {
    /// Opens (creating if needed) the database file at `path` and applies the schema.
    pub async fn open(path: &str, max_connections: u32) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(StdDuration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        for statement in schema::sqlite_statements() {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::info!(path = path, "SQLite work store opened");
        Ok(Self {
            pool,
            retry: TxRetryPolicy::default(),
        })
    }

    /// Sets the retry policy for busy or locked writes.
    pub fn with_retry_policy(mut self, retry: TxRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp out of range: {millis}")))
}

fn decode_digests(raw: &str) -> Result<Vec<Digest>, StoreError> {
    let digests: Vec<String> = serde_json::from_str(raw)?;
    Ok(digests_from_strings(digests))
}

fn secondary_from_row(row: &SqliteRow) -> Result<SecondaryWork, StoreError> {
    let raw_grouping: Vec<u8> = row.try_get("grouping_id")?;
    let raw_digests: String = row.try_get("digests")?;
    Ok(SecondaryWork {
        branch: row.try_get("branch_name")?,
        grouping_id: GroupingId::try_from(raw_grouping.as_slice())?,
        digests: decode_digests(&raw_digests)?,
    })
}

#[async_trait]
impl WorkStore for SqliteWorkStore {
    async fn claim_primary_work(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
        lease: Duration,
    ) -> Result<Option<GroupingId>, StoreError> {
        let pool = &self.pool;
        let now_ms = to_millis(now);
        let stale_before = to_millis(stale_cutoff(now, staleness)?);
        let lease_ends = to_millis(lease_end(now, lease)?);

        let claimed: Option<(Vec<u8>,)> = self
            .retry
            .run("claim_primary_work", move || async move {
                sqlx::query_as(
                    r#"
                    UPDATE PrimaryBranchDiffCalculationWork
                    SET calculation_lease_ends = ?1
                    WHERE rowid = (
                        SELECT rowid FROM PrimaryBranchDiffCalculationWork
                        WHERE calculation_lease_ends < ?2 AND last_calculated_ts < ?3
                        ORDER BY last_calculated_ts ASC
                        LIMIT 1
                    )
                    RETURNING grouping_id
                    "#,
                )
                .bind(lease_ends)
                .bind(now_ms)
                .bind(stale_before)
                .fetch_optional(pool)
                .await
            })
            .await?;

        Ok(claimed
            .map(|(raw,)| GroupingId::try_from(raw.as_slice()))
            .transpose()?)
    }

    async fn complete_primary_work(
        &self,
        grouping: GroupingId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pool = &self.pool;
        let now_ms = to_millis(now);
        self.retry
            .run("complete_primary_work", move || async move {
                sqlx::query(
                    "UPDATE PrimaryBranchDiffCalculationWork SET last_calculated_ts = ? WHERE grouping_id = ?",
                )
                .bind(now_ms)
                .bind(grouping.as_bytes())
                .execute(pool)
                .await
                .map(|_| ())
            })
            .await
    }

    async fn claim_secondary_work_low_contention(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<SecondaryWork>, StoreError> {
        let pool = &self.pool;
        let now_ms = to_millis(now);
        let lease_ends = to_millis(lease_end(now, lease)?);

        let row: Option<SqliteRow> = self
            .retry
            .run("claim_secondary_work_low_contention", move || async move {
                sqlx::query(
                    r#"
                    UPDATE SecondaryBranchDiffCalculationWork
                    SET calculation_lease_ends = ?1
                    WHERE rowid = (
                        SELECT rowid FROM SecondaryBranchDiffCalculationWork
                        WHERE calculation_lease_ends < ?2
                          AND last_calculated_ts < last_updated_ts
                          AND json_array_length(digests) > 0
                        ORDER BY last_calculated_ts ASC
                        LIMIT 1
                    )
                    RETURNING branch_name, grouping_id, digests
                    "#,
                )
                .bind(lease_ends)
                .bind(now_ms)
                .fetch_optional(pool)
                .await
            })
            .await?;

        row.as_ref().map(secondary_from_row).transpose()
    }

    async fn secondary_work_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecondaryWork>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT branch_name, grouping_id, digests
            FROM SecondaryBranchDiffCalculationWork
            WHERE calculation_lease_ends < ?
              AND last_calculated_ts < last_updated_ts
              AND json_array_length(digests) > 0
            ORDER BY last_calculated_ts ASC
            LIMIT ?
            "#,
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(secondary_from_row).collect()
    }

    async fn lease_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Vec<Digest>>, StoreError> {
        let pool = &self.pool;
        let now_ms = to_millis(now);
        let lease_ends = to_millis(lease_end(now, lease)?);

        let leased: Option<(String,)> = self
            .retry
            .run("lease_secondary_work", move || async move {
                sqlx::query_as(
                    r#"
                    UPDATE SecondaryBranchDiffCalculationWork
                    SET calculation_lease_ends = ?1
                    WHERE branch_name = ?2 AND grouping_id = ?3
                      AND calculation_lease_ends < ?4
                      AND last_calculated_ts < last_updated_ts
                      AND json_array_length(digests) > 0
                    RETURNING digests
                    "#,
                )
                .bind(lease_ends)
                .bind(branch)
                .bind(grouping.as_bytes())
                .bind(now_ms)
                .fetch_optional(pool)
                .await
            })
            .await?;

        leased.map(|(raw,)| decode_digests(&raw)).transpose()
    }

    async fn complete_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pool = &self.pool;
        let now_ms = to_millis(now);
        self.retry
            .run("complete_secondary_work", move || async move {
                sqlx::query(
                    r#"
                    UPDATE SecondaryBranchDiffCalculationWork
                    SET last_calculated_ts = ?
                    WHERE branch_name = ? AND grouping_id = ?
                    "#,
                )
                .bind(now_ms)
                .bind(branch)
                .bind(grouping.as_bytes())
                .execute(pool)
                .await
                .map(|_| ())
            })
            .await
    }
}

#[async_trait]
impl GroupingStore for SqliteWorkStore {
    async fn grouping_params(&self, grouping: GroupingId) -> Result<Option<Params>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT keys FROM Groupings WHERE grouping_id = ?")
            .bind(grouping.as_bytes())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((keys,)) => Ok(Some(serde_json::from_str(&keys)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WorkProducer for SqliteWorkStore {
    async fn put_grouping(
        &self,
        grouping: GroupingId,
        params: &Params,
    ) -> Result<(), StoreError> {
        let keys = serde_json::to_string(params)?;
        let pool = &self.pool;
        let keys = keys.as_str();
        self.retry
            .run("put_grouping", move || async move {
                sqlx::query("INSERT OR IGNORE INTO Groupings (grouping_id, keys) VALUES (?, ?)")
                    .bind(grouping.as_bytes())
                    .bind(keys)
                    .execute(pool)
                    .await
                    .map(|_| ())
            })
            .await
    }

    async fn ensure_primary_work(&self, groupings: &[GroupingId]) -> Result<(), StoreError> {
        let pool = &self.pool;
        let epoch = to_millis(beginning_of_time());
        self.retry
            .run("ensure_primary_work", move || async move {
                let mut tx = pool.begin().await?;
                for grouping in groupings {
                    sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO PrimaryBranchDiffCalculationWork
                            (grouping_id, last_calculated_ts, calculation_lease_ends)
                        VALUES (?1, ?2, ?2)
                        "#,
                    )
                    .bind(grouping.as_bytes())
                    .bind(epoch)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await
            })
            .await
    }

    async fn upsert_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        digests: &[Digest],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let raw_digests = serde_json::to_string(&digests_to_strings(digests))?;
        let raw_digests = raw_digests.as_str();
        let pool = &self.pool;
        let epoch = to_millis(beginning_of_time());
        let updated_ms = to_millis(updated_at);

        self.retry
            .run("upsert_secondary_work", move || async move {
                sqlx::query(
                    r#"
                    INSERT INTO SecondaryBranchDiffCalculationWork
                        (branch_name, grouping_id, last_updated_ts, digests,
                         last_calculated_ts, calculation_lease_ends)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                    ON CONFLICT (branch_name, grouping_id) DO UPDATE SET
                        digests = excluded.digests,
                        last_updated_ts = excluded.last_updated_ts
                    "#,
                )
                .bind(branch)
                .bind(grouping.as_bytes())
                .bind(updated_ms)
                .bind(raw_digests)
                .bind(epoch)
                .execute(pool)
                .await
                .map(|_| ())
            })
            .await
    }

    async fn retire_secondary_branch(&self, branch: &str) -> Result<u64, StoreError> {
        let pool = &self.pool;
        self.retry
            .run("retire_secondary_branch", move || async move {
                sqlx::query("DELETE FROM SecondaryBranchDiffCalculationWork WHERE branch_name = ?")
                    .bind(branch)
                    .execute(pool)
                    .await
                    .map(|result| result.rows_affected())
            })
            .await
    }

    async fn primary_work_row(
        &self,
        grouping: GroupingId,
    ) -> Result<Option<PrimaryWorkRow>, StoreError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT last_calculated_ts, calculation_lease_ends
            FROM PrimaryBranchDiffCalculationWork
            WHERE grouping_id = ?
            "#,
        )
        .bind(grouping.as_bytes())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(last_calculated, lease_ends)| {
            Ok(PrimaryWorkRow {
                grouping_id: grouping,
                last_calculated_ts: from_millis(last_calculated)?,
                calculation_lease_ends: from_millis(lease_ends)?,
            })
        })
        .transpose()
    }

    async fn secondary_work_row(
        &self,
        branch: &str,
        grouping: GroupingId,
    ) -> Result<Option<SecondaryWorkRow>, StoreError> {
        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT digests, last_updated_ts, last_calculated_ts, calculation_lease_ends
            FROM SecondaryBranchDiffCalculationWork
            WHERE branch_name = ? AND grouping_id = ?
            "#,
        )
        .bind(branch)
        .bind(grouping.as_bytes())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(digests, last_updated, last_calculated, lease_ends)| {
            Ok(SecondaryWorkRow {
                branch: branch.to_string(),
                grouping_id: grouping,
                digests: decode_digests(&digests)?,
                last_updated_ts: from_millis(last_updated)?,
                last_calculated_ts: from_millis(last_calculated)?,
                calculation_lease_ends: from_millis(lease_ends)?,
            })
        })
        .transpose()
    }
}
