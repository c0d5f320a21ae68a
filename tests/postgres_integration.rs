//! Integration tests for the PostgreSQL work store.
//!
//! These tests need a running PostgreSQL (or CockroachDB) database. Each test
//! works in its own schema, which is dropped when the test passes.
//! Run with: DIFFCALC_TEST_DATABASE_URL=postgresql://... cargo test --test postgres_integration -- --ignored
//!
//! The stale-read test additionally needs CockroachDB and
//! DIFFCALC_TEST_STALE_READ_MS (e.g. 100).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use diffcalc::storage::{GroupingStore, PgWorkStore, WorkProducer, WorkStore};
use diffcalc::types::{beginning_of_time, Digest, GroupingId, Params};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

const CONCURRENT_WORKERS: usize = 8;

fn get_test_database_url() -> String {
    std::env::var("DIFFCALC_TEST_DATABASE_URL")
        .expect("DIFFCALC_TEST_DATABASE_URL environment variable must be set for integration tests")
}

struct TestDb {
    admin: PgPool,
    schema: String,
    options: PgConnectOptions,
}

impl TestDb {
    /// Creates an empty schema and a store whose tables live in it.
    async fn create() -> (Self, PgWorkStore) {
        let url = get_test_database_url();
        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("Should connect to test database");

        let schema = format!("diffcalc_test_{}", hex::encode(rand::random::<[u8; 6]>()));
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .expect("Should create test schema");

        let options = PgConnectOptions::from_str(&url)
            .expect("Test database URL should parse")
            .options([("search_path", schema.as_str())]);
        let db = Self {
            admin,
            schema,
            options,
        };
        let store = db.store().await;
        store.run_migrations().await.expect("Migrations should apply");
        (db, store)
    }

    /// Opens a store on the test schema.
    async fn store(&self) -> PgWorkStore {
        let pool = PgPoolOptions::new()
            .max_connections(CONCURRENT_WORKERS as u32)
            .connect_with(self.options.clone())
            .await
            .expect("Should connect to test schema");
        PgWorkStore::from_pool(pool)
    }

    async fn drop_schema(self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("Should drop test schema");
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

fn grouping(n: u8) -> GroupingId {
    GroupingId::new([n; 16])
}

fn lease() -> Duration {
    Duration::minutes(10)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_integration -- --ignored
async fn test_migrations_are_idempotent() {
    let (db, store) = TestDb::create().await;
    let applied = store.run_migrations().await.expect("Rerun should succeed");
    assert_eq!(applied, 0, "No migration should apply twice");
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_grouping_params_round_trip() {
    let (db, store) = TestDb::create().await;
    let mut params = Params::new();
    params.insert("name".to_string(), "square".to_string());
    params.insert("source_type".to_string(), "round".to_string());
    let grouping_id = GroupingId::from_params(&params);

    store.put_grouping(grouping_id, &params).await.unwrap();
    assert_eq!(
        store.grouping_params(grouping_id).await.unwrap(),
        Some(params)
    );
    assert_eq!(store.grouping_params(grouping(9)).await.unwrap(), None);
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_primary_claim_has_single_winner() {
    let (db, store) = TestDb::create().await;
    store.ensure_primary_work(&[grouping(1)]).await.unwrap();
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for _ in 0..CONCURRENT_WORKERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_primary_work(at(0), Duration::minutes(1), lease())
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle
            .await
            .unwrap()
            .expect("Conflicts should be retried, not surfaced")
            .is_some()
        {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let row = store.primary_work_row(grouping(1)).await.unwrap().unwrap();
    assert_eq!(row.calculation_lease_ends, at(0) + lease());
    assert_eq!(row.last_calculated_ts, beginning_of_time());
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_secondary_low_contention_claim_has_single_winner() {
    let (db, store) = TestDb::create().await;
    store
        .upsert_secondary_work("cl1", grouping(1), &[Digest::from("d1")], at(0))
        .await
        .unwrap();
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for _ in 0..CONCURRENT_WORKERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_secondary_work_low_contention(at(1), lease()).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(work) = handle
            .await
            .unwrap()
            .expect("Conflicts should be retried, not surfaced")
        {
            winners.push(work);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].branch, "cl1");
    assert_eq!(winners[0].digests, vec![Digest::from("d1")]);
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_secondary_high_contention_claim_has_single_winner() {
    let (db, store) = TestDb::create().await;
    store
        .upsert_secondary_work("cl1", grouping(1), &[Digest::from("d1")], at(0))
        .await
        .unwrap();
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for _ in 0..CONCURRENT_WORKERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_secondary_work_high_contention(at(1), lease()).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle
            .await
            .unwrap()
            .expect("Losing the race should not be an error")
            .is_some()
        {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_primary_claims_oldest_first_and_respects_staleness() {
    let (db, store) = TestDb::create().await;
    store
        .ensure_primary_work(&[grouping(1), grouping(2), grouping(3)])
        .await
        .unwrap();
    store.complete_primary_work(grouping(2), at(0)).await.unwrap();
    store.complete_primary_work(grouping(3), at(10)).await.unwrap();
    store.complete_primary_work(grouping(1), at(20)).await.unwrap();

    // Only grouping 2 is older than a minute at t=65.
    let claimed = store
        .claim_primary_work(at(65), Duration::minutes(1), lease())
        .await
        .unwrap();
    assert_eq!(claimed, Some(grouping(2)));
    assert!(store
        .claim_primary_work(at(65), Duration::minutes(1), lease())
        .await
        .unwrap()
        .is_none());

    let mut order = Vec::new();
    while let Some(g) = store
        .claim_primary_work(at(3600), Duration::minutes(1), lease())
        .await
        .unwrap()
    {
        order.push(g);
    }
    // Grouping 2's lease from t=65 has run out by now.
    assert_eq!(order, vec![grouping(2), grouping(3), grouping(1)]);

    // Completion records the time and leaves the lease alone.
    store.complete_primary_work(grouping(3), at(3700)).await.unwrap();
    let row = store.primary_work_row(grouping(3)).await.unwrap().unwrap();
    assert_eq!(row.last_calculated_ts, at(3700));
    assert_eq!(row.calculation_lease_ends, at(3600) + lease());
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_secondary_claims_oldest_first_and_require_drift() {
    let (db, store) = TestDb::create().await;
    for (branch, calculated) in [("cl-a", 20), ("cl-b", 0), ("cl-c", 10)] {
        store
            .upsert_secondary_work(branch, grouping(1), &[Digest::from("d1")], at(100))
            .await
            .unwrap();
        store
            .complete_secondary_work(branch, grouping(1), at(calculated))
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(work) = store
        .claim_secondary_work_low_contention(at(200), lease())
        .await
        .unwrap()
    {
        order.push(work.branch);
    }
    assert_eq!(order, vec!["cl-b", "cl-c", "cl-a"]);

    // Calculated after the last update: never claimed again, lease or not.
    store
        .complete_secondary_work("cl-b", grouping(1), at(300))
        .await
        .unwrap();
    let later = at(300) + lease() + lease();
    let remaining: Vec<String> = store
        .secondary_work_candidates(later, 50)
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.branch)
        .collect();
    assert_eq!(remaining, vec!["cl-c", "cl-a"]);
    assert!(store
        .lease_secondary_work("cl-b", grouping(1), later, lease())
        .await
        .unwrap()
        .is_none());
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_lease_returns_digests_current_at_lease_time() {
    let (db, store) = TestDb::create().await;
    store
        .upsert_secondary_work("cl1", grouping(1), &[Digest::from("d1")], at(0))
        .await
        .unwrap();
    let candidates = store.secondary_work_candidates(at(1), 50).await.unwrap();
    assert_eq!(candidates[0].digests, vec![Digest::from("d1")]);

    let current = vec![Digest::from("d1"), Digest::from("d2")];
    store
        .upsert_secondary_work("cl1", grouping(1), &current, at(1))
        .await
        .unwrap();

    let leased = store
        .lease_secondary_work("cl1", grouping(1), at(2), lease())
        .await
        .unwrap();
    assert_eq!(leased, Some(current));
    assert_eq!(
        store
            .lease_secondary_work("cl1", grouping(1), at(3), lease())
            .await
            .unwrap(),
        None
    );
    assert_eq!(store.retire_secondary_branch("cl1").await.unwrap(), 1);
    db.drop_schema().await;
}

#[tokio::test]
#[ignore]
async fn test_high_contention_claim_with_stale_read() {
    let Ok(offset_ms) = std::env::var("DIFFCALC_TEST_STALE_READ_MS") else {
        eprintln!("DIFFCALC_TEST_STALE_READ_MS not set, skipping");
        return;
    };
    let offset = StdDuration::from_millis(
        offset_ms
            .parse()
            .expect("DIFFCALC_TEST_STALE_READ_MS should be a number of milliseconds"),
    );
    let (db, store) = TestDb::create().await;
    let store = store.with_stale_read_offset(Some(offset));

    let now = Utc::now();
    store
        .upsert_secondary_work("cl1", grouping(1), &[Digest::from("d1")], now)
        .await
        .unwrap();

    // The candidate read lags by the offset.
    tokio::time::sleep(offset + StdDuration::from_millis(200)).await;
    let claimed_at = Utc::now();
    let work = store
        .claim_secondary_work_high_contention(claimed_at, lease())
        .await
        .unwrap()
        .expect("Row should be visible once the offset has passed");
    assert_eq!(work.digests, vec![Digest::from("d1")]);

    store
        .complete_secondary_work("cl1", grouping(1), claimed_at)
        .await
        .unwrap();
    let row = store.secondary_work_row("cl1", grouping(1)).await.unwrap().unwrap();
    assert!(row.last_calculated_ts >= row.last_updated_ts);
    db.drop_schema().await;
}
