//! Relational storage for the diff work queues.
//!
//! This module turns two shared tables into lease-based work queues that any
//! number of worker processes can claim from concurrently.
//!
//! # Overview
//!
//! - **store**: the [`WorkStore`], [`WorkProducer`] and [`GroupingStore`] traits
//!   plus the shared [`StoreError`]
//! - **postgres**: [`PgWorkStore`], serializable transactions against
//!   PostgreSQL / CockroachDB
//! - **sqlite**: [`SqliteWorkStore`], single-statement claims against an
//!   embedded SQLite database
//! - **retry**: the transaction retry policy for serialization conflicts
//! - **migrations** / **schema**: DDL and its application
//!
//! # Lease model
//!
//! A row is claimable only while its `calculation_lease_ends` lies in the
//! past. Claiming writes `now + lease` into that column inside the same atomic
//! unit as the selection, so at most one worker holds a row at a time. A
//! worker that dies mid-computation simply lets the lease run out.
//!
//! # Usage
//!
//! ```rust,ignore
//! use diffcalc::storage::{open_store, WorkStore};
//!
//! let stores = open_store(&config).await?;
//! if let Some(grouping) = stores
//!     .work
//!     .claim_primary_work(now, staleness, lease)
//!     .await?
//! {
//!     // compute diffs, then
//!     stores.work.complete_primary_work(grouping, now).await?;
//! }
//! ```

pub mod migrations;
pub mod postgres;
pub mod retry;
pub mod schema;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use postgres::PgWorkStore;
pub use retry::TxRetryPolicy;
pub use sqlite::SqliteWorkStore;
pub use store::{
    Backend, GroupingStore, StoreError, WorkProducer, WorkStore, HIGH_CONTENTION_CANDIDATES,
};

use crate::config::DiffCalculatorConfig;

/// Handles to one opened backend, viewed through each of its traits.
#[derive(Clone)]
pub struct StoreHandles {
    pub work: Arc<dyn WorkStore>,
    pub groupings: Arc<dyn GroupingStore>,
    pub producer: Arc<dyn WorkProducer>,
}

/// Opens the backend named by the configured database URL.
///
/// `postgres://` and `postgresql://` URLs open a [`PgWorkStore`] (which does not
/// migrate; see the `migrate` command), `sqlite://` URLs open a
/// [`SqliteWorkStore`] with its schema applied.
pub async fn open_store(config: &DiffCalculatorConfig) -> Result<StoreHandles, StoreError> {
    let retry = TxRetryPolicy::new(config.tx_max_attempts);
    match Backend::from_url(&config.database_url)? {
        Backend::Postgres => {
            let store = Arc::new(
                PgWorkStore::connect(&config.database_url, config.max_sql_connections)
                    .await?
                    .with_retry_policy(retry)
                    .with_stale_read_offset(config.stale_read_offset()),
            );
            Ok(StoreHandles {
                work: store.clone(),
                groupings: store.clone(),
                producer: store,
            })
        }
        Backend::Sqlite => {
            let path = config
                .database_url
                .trim_start_matches("sqlite://")
                .to_string();
            let store = Arc::new(
                SqliteWorkStore::open(&path, config.max_sql_connections)
                    .await?
                    .with_retry_policy(retry),
            );
            Ok(StoreHandles {
                work: store.clone(),
                groupings: store.clone(),
                producer: store,
            })
        }
    }
}
