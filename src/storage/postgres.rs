//! PostgreSQL / CockroachDB work store.
//!
//! Claims run as `SERIALIZABLE` transactions. When two workers race for the
//! same row, one of them fails with a serialization error and is re-run by the
//! [`TxRetryPolicy`], at which point the row is already leased and it moves on
//! to the next one (or finds nothing).

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::types::{
    beginning_of_time, digests_from_strings, digests_to_strings, Digest, GroupingId, Params,
    PrimaryWorkRow, SecondaryWork, SecondaryWorkRow,
};

use super::migrations::MigrationRunner;
use super::retry::TxRetryPolicy;
use super::store::{lease_end, stale_cutoff, GroupingStore, StoreError, WorkProducer, WorkStore};

/// PostgreSQL-backed work store.
#[derive(Clone)]
pub struct PgWorkStore {
    pool: PgPool,
    retry: TxRetryPolicy,
    stale_read_offset: Option<StdDuration>,
}

impl PgWorkStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - connection string, e.g. `postgresql://root@localhost:26257/gold`
    /// * `max_connections` - upper bound of the connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(StdDuration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_pool(pool))
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry: TxRetryPolicy::default(),
            stale_read_offset: None,
        }
    }

    /// Sets the retry policy for conflicting transactions.
    pub fn with_retry_policy(mut self, retry: TxRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reads high-contention candidates `offset` in the past.
    ///
    /// Uses CockroachDB's `AS OF SYSTEM TIME`; leave unset on plain PostgreSQL.
    pub fn with_stale_read_offset(mut self, offset: Option<StdDuration>) -> Self {
        self.stale_read_offset = offset;
        self
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the work queue schema.
    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    fn candidates_query(&self) -> String {
        let as_of = self
            .stale_read_offset
            .map(|offset| format!("AS OF SYSTEM TIME '-{:.3}s'", offset.as_secs_f64()))
            .unwrap_or_default();
        format!(
            r#"
            SELECT branch_name, grouping_id, digests
            FROM SecondaryBranchDiffCalculationWork
            {as_of}
            WHERE calculation_lease_ends < $1
              AND last_calculated_ts < last_updated_ts
              AND array_length(digests, 1) > 0
            ORDER BY last_calculated_ts ASC
            LIMIT $2
            "#
        )
    }
}

async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

fn grouping_from_row(row: &PgRow) -> Result<GroupingId, StoreError> {
    let raw: Vec<u8> = row.try_get("grouping_id")?;
    Ok(GroupingId::try_from(raw.as_slice())?)
}

fn secondary_from_row(row: &PgRow) -> Result<SecondaryWork, StoreError> {
    Ok(SecondaryWork {
        branch: row.try_get("branch_name")?,
        grouping_id: grouping_from_row(row)?,
        digests: digests_from_strings(row.try_get("digests")?),
    })
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn claim_primary_work(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
        lease: Duration,
    ) -> Result<Option<GroupingId>, StoreError> {
        let pool = &self.pool;
        let stale_before = stale_cutoff(now, staleness)?;
        let lease_ends = lease_end(now, lease)?;

        let claimed: Option<Vec<u8>> = self
            .retry
            .run("claim_primary_work", move || async move {
                let mut tx = begin_serializable(pool).await?;
                let row: Option<(Vec<u8>,)> = sqlx::query_as(
                    r#"
                    SELECT grouping_id
                    FROM PrimaryBranchDiffCalculationWork
                    WHERE calculation_lease_ends < $1 AND last_calculated_ts < $2
                    ORDER BY last_calculated_ts ASC
                    LIMIT 1
                    "#,
                )
                .bind(now)
                .bind(stale_before)
                .fetch_optional(&mut *tx)
                .await?;

                let Some((grouping_id,)) = row else {
                    tx.commit().await?;
                    return Ok(None);
                };

                sqlx::query(
                    r#"
                    UPDATE PrimaryBranchDiffCalculationWork
                    SET calculation_lease_ends = $2
                    WHERE grouping_id = $1
                    "#,
                )
                .bind(grouping_id.as_slice())
                .bind(lease_ends)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(Some(grouping_id))
            })
            .await?;

        Ok(claimed
            .map(|raw| GroupingId::try_from(raw.as_slice()))
            .transpose()?)
    }

    async fn complete_primary_work(
        &self,
        grouping: GroupingId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.retry
            .run("complete_primary_work", move || async move {
                let mut tx = begin_serializable(pool).await?;
                sqlx::query(
                    r#"
                    UPDATE PrimaryBranchDiffCalculationWork
                    SET last_calculated_ts = $2
                    WHERE grouping_id = $1
                    "#,
                )
                .bind(grouping.as_bytes())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await
            })
            .await
    }

    async fn claim_secondary_work_low_contention(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<SecondaryWork>, StoreError> {
        let pool = &self.pool;
        let lease_ends = lease_end(now, lease)?;

        let claimed: Option<(String, Vec<u8>, Vec<String>)> = self
            .retry
            .run("claim_secondary_work_low_contention", move || async move {
                let mut tx = begin_serializable(pool).await?;
                let row: Option<(String, Vec<u8>, Vec<String>)> = sqlx::query_as(
                    r#"
                    SELECT branch_name, grouping_id, digests
                    FROM SecondaryBranchDiffCalculationWork
                    WHERE calculation_lease_ends < $1
                      AND last_calculated_ts < last_updated_ts
                      AND array_length(digests, 1) > 0
                    ORDER BY last_calculated_ts ASC
                    LIMIT 1
                    "#,
                )
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;

                let Some((branch, grouping_id, digests)) = row else {
                    tx.commit().await?;
                    return Ok(None);
                };

                sqlx::query(
                    r#"
                    UPDATE SecondaryBranchDiffCalculationWork
                    SET calculation_lease_ends = $3
                    WHERE branch_name = $1 AND grouping_id = $2
                    "#,
                )
                .bind(&branch)
                .bind(grouping_id.as_slice())
                .bind(lease_ends)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(Some((branch, grouping_id, digests)))
            })
            .await?;

        claimed
            .map(|(branch, raw, digests)| {
                Ok(SecondaryWork {
                    branch,
                    grouping_id: GroupingId::try_from(raw.as_slice())?,
                    digests: digests_from_strings(digests),
                })
            })
            .transpose()
    }

    async fn secondary_work_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecondaryWork>, StoreError> {
        let query = self.candidates_query();
        let rows = sqlx::query(&query)
            .bind(now)
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
        let lease_ends = lease_end(now, lease)?;

        let leased: Option<(Vec<String>,)> = self
            .retry
            .run("lease_secondary_work", move || async move {
                let mut tx = begin_serializable(pool).await?;
                let row: Option<(Vec<String>,)> = sqlx::query_as(
                    r#"
                    UPDATE SecondaryBranchDiffCalculationWork
                    SET calculation_lease_ends = $3
                    WHERE branch_name = $1 AND grouping_id = $2
                      AND calculation_lease_ends < $4
                      AND last_calculated_ts < last_updated_ts
                      AND array_length(digests, 1) > 0
                    RETURNING digests
                    "#,
                )
                .bind(branch)
                .bind(grouping.as_bytes())
                .bind(lease_ends)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(row)
            })
            .await?;

        if leased.is_none() {
            debug!(branch = branch, grouping = %grouping, "Secondary work already leased");
        }
        Ok(leased.map(|(digests,)| digests_from_strings(digests)))
    }

    async fn complete_secondary_work(
        &self,
        branch: &str,
        grouping: GroupingId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.retry
            .run("complete_secondary_work", move || async move {
                let mut tx = begin_serializable(pool).await?;
                sqlx::query(
                    r#"
                    UPDATE SecondaryBranchDiffCalculationWork
                    SET last_calculated_ts = $3
                    WHERE branch_name = $1 AND grouping_id = $2
                    "#,
                )
                .bind(branch)
                .bind(grouping.as_bytes())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await
            })
            .await
    }
}

#[async_trait]
impl GroupingStore for PgWorkStore {
    async fn grouping_params(&self, grouping: GroupingId) -> Result<Option<Params>, StoreError> {
        let row: Option<(Json<Params>,)> =
            sqlx::query_as("SELECT keys FROM Groupings WHERE grouping_id = $1")
                .bind(grouping.as_bytes())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(Json(params),)| params))
    }
}

#[async_trait]
impl WorkProducer for PgWorkStore {
    async fn put_grouping(
        &self,
        grouping: GroupingId,
        params: &Params,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO Groupings (grouping_id, keys) VALUES ($1, $2)
            ON CONFLICT (grouping_id) DO NOTHING
            "#,
        )
        .bind(grouping.as_bytes())
        .bind(Json(params))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_primary_work(&self, groupings: &[GroupingId]) -> Result<(), StoreError> {
        let pool = &self.pool;
        let epoch = beginning_of_time();
        self.retry
            .run("ensure_primary_work", move || async move {
                let mut tx = begin_serializable(pool).await?;
                for grouping in groupings {
                    sqlx::query(
                        r#"
                        INSERT INTO PrimaryBranchDiffCalculationWork
                            (grouping_id, last_calculated_ts, calculation_lease_ends)
                        VALUES ($1, $2, $2)
                        ON CONFLICT (grouping_id) DO NOTHING
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
        let pool = &self.pool;
        let epoch = beginning_of_time();
        let raw_digests = digests_to_strings(digests);
        let raw_digests = raw_digests.as_slice();

        self.retry
            .run("upsert_secondary_work", move || async move {
                let mut tx = begin_serializable(pool).await?;
                sqlx::query(
                    r#"
                    INSERT INTO SecondaryBranchDiffCalculationWork
                        (branch_name, grouping_id, last_updated_ts, digests,
                         last_calculated_ts, calculation_lease_ends)
                    VALUES ($1, $2, $3, $4, $5, $5)
                    ON CONFLICT (branch_name, grouping_id) DO UPDATE SET
                        digests = EXCLUDED.digests,
                        last_updated_ts = EXCLUDED.last_updated_ts
                    "#,
                )
                .bind(branch)
                .bind(grouping.as_bytes())
                .bind(updated_at)
                .bind(raw_digests)
                .bind(epoch)
                .execute(&mut *tx)
                .await?;
                tx.commit().await
            })
            .await
    }

    async fn retire_secondary_branch(&self, branch: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM SecondaryBranchDiffCalculationWork WHERE branch_name = $1")
            .bind(branch)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn primary_work_row(
        &self,
        grouping: GroupingId,
    ) -> Result<Option<PrimaryWorkRow>, StoreError> {
        let row: Option<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT last_calculated_ts, calculation_lease_ends
            FROM PrimaryBranchDiffCalculationWork
            WHERE grouping_id = $1
            "#,
        )
        .bind(grouping.as_bytes())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_calculated_ts, calculation_lease_ends)| PrimaryWorkRow {
            grouping_id: grouping,
            last_calculated_ts,
            calculation_lease_ends,
        }))
    }

    async fn secondary_work_row(
        &self,
        branch: &str,
        grouping: GroupingId,
    ) -> Result<Option<SecondaryWorkRow>, StoreError> {
        let row: Option<(Vec<String>, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT digests, last_updated_ts, last_calculated_ts, calculation_lease_ends
                FROM SecondaryBranchDiffCalculationWork
                WHERE branch_name = $1 AND grouping_id = $2
                "#,
            )
            .bind(branch)
            .bind(grouping.as_bytes())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(
            |(digests, last_updated_ts, last_calculated_ts, calculation_lease_ends)| {
                SecondaryWorkRow {
                    branch: branch.to_string(),
                    grouping_id: grouping,
                    digests: digests_from_strings(digests),
                    last_updated_ts,
                    last_calculated_ts,
                    calculation_lease_ends,
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_store() -> PgWorkStore {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/diffcalc_test")
            .unwrap();
        PgWorkStore::from_pool(pool)
    }

    #[tokio::test]
    async fn test_candidates_query_without_stale_read() {
        let store = lazy_store();
        let query = store.candidates_query();
        assert!(!query.contains("AS OF SYSTEM TIME"));
        assert!(query.contains("ORDER BY last_calculated_ts ASC"));
        assert!(query.contains("LIMIT $2"));
    }

    #[tokio::test]
    async fn test_candidates_query_with_stale_read() {
        let store = lazy_store().with_stale_read_offset(Some(StdDuration::from_millis(100)));
        let query = store.candidates_query();
        assert!(query.contains("AS OF SYSTEM TIME '-0.100s'"));
    }
}
