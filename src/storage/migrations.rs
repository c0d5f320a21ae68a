//! Work queue schema migrations for PostgreSQL/CockroachDB.
//!
//! Each migration is one DDL statement recorded by name and SHA-256 checksum
//! in `_migrations`. Several workers may start at once, so every statement is
//! `IF NOT EXISTS` and recording a migration twice is a no-op.

use std::collections::HashMap;

use sha2::{Digest as _, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A recorded migration no longer matches the DDL shipped with this binary.
    #[error("Migration {name} was applied with checksum {recorded}, expected {expected}")]
    ChecksumMismatch {
        name: String,
        recorded: String,
        expected: String,
    },
}

/// A named schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    /// Hex SHA-256 of the statement, ignoring surrounding whitespace.
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.sql.trim().as_bytes()))
    }
}

/// Work queue migrations in application order.
pub fn postgres_migrations() -> Vec<Migration> {
    vec![
        Migration {
            name: "0001_create_groupings",
            sql: schema::PG_CREATE_GROUPINGS_TABLE,
        },
        Migration {
            name: "0002_create_primary_work",
            sql: schema::PG_CREATE_PRIMARY_WORK_TABLE,
        },
        Migration {
            name: "0003_create_secondary_work",
            sql: schema::PG_CREATE_SECONDARY_WORK_TABLE,
        },
        Migration {
            name: "0004_index_primary_work_claim_order",
            sql: schema::PG_CREATE_PRIMARY_WORK_INDEX,
        },
        Migration {
            name: "0005_index_secondary_work_claim_order",
            sql: schema::PG_CREATE_SECONDARY_WORK_INDEX,
        },
    ]
}

/// Returns the migrations not yet recorded, refusing to continue past one
/// whose recorded checksum differs.
pub fn pending_migrations<'a>(
    migrations: &'a [Migration],
    recorded: &HashMap<String, String>,
) -> Result<Vec<&'a Migration>, MigrationError> {
    let mut pending = Vec::new();
    for migration in migrations {
        let expected = migration.checksum();
        match recorded.get(migration.name) {
            Some(checksum) if *checksum == expected => {}
            Some(checksum) => {
                return Err(MigrationError::ChecksumMismatch {
                    name: migration.name.to_string(),
                    recorded: checksum.clone(),
                    expected,
                })
            }
            None => pending.push(migration),
        }
    }
    Ok(pending)
}

/// Applies [`postgres_migrations`] to a database.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every pending migration and returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;

        let recorded: HashMap<String, String> = self
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|m| (m.name, m.checksum))
            .collect();
        let migrations = postgres_migrations();
        let pending = pending_migrations(&migrations, &recorded)?;

        for migration in &pending {
            self.apply_migration(migration).await?;
        }

        info!(
            applied = pending.len(),
            total = migrations.len(),
            "Work queue migrations up to date"
        );
        Ok(pending.len())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        debug!(name = migration.name, "Applying migration");
        let mut tx = self.pool.begin().await?;

        sqlx::query(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", migration.name, e)))?;

        // Another worker may have recorded it in the meantime.
        sqlx::query(
            "INSERT INTO _migrations (name, checksum) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(migration.name)
        .bind(migration.checksum())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Returns the recorded migrations in application order.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_migrations_table().await?;

        let migrations: Vec<AppliedMigration> = sqlx::query_as(
            "SELECT name, checksum, applied_at FROM _migrations ORDER BY applied_at, name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(migrations)
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub checksum: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}
