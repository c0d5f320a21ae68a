//! Database schema constants.
//!
//! This module contains the DDL for the grouping table and the two diff work
//! queues, once for PostgreSQL/CockroachDB and once for SQLite. Every entry is
//! a single statement so it can run through a prepared query.

/// PostgreSQL DDL for the groupings table.
pub const PG_CREATE_GROUPINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Groupings (
    grouping_id BYTEA PRIMARY KEY,
    keys JSONB NOT NULL
)
"#;

/// PostgreSQL DDL for the primary-branch work queue.
pub const PG_CREATE_PRIMARY_WORK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS PrimaryBranchDiffCalculationWork (
    grouping_id BYTEA PRIMARY KEY,
    last_calculated_ts TIMESTAMPTZ NOT NULL,
    calculation_lease_ends TIMESTAMPTZ NOT NULL
)
"#;

/// PostgreSQL DDL for the secondary-branch work queue.
pub const PG_CREATE_SECONDARY_WORK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS SecondaryBranchDiffCalculationWork (
    branch_name TEXT NOT NULL,
    grouping_id BYTEA NOT NULL,
    last_updated_ts TIMESTAMPTZ NOT NULL,
    digests TEXT[] NOT NULL,
    last_calculated_ts TIMESTAMPTZ NOT NULL,
    calculation_lease_ends TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (branch_name, grouping_id)
)
"#;

/// Index backing the oldest-first primary claim.
pub const PG_CREATE_PRIMARY_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_primary_work_last_calculated
    ON PrimaryBranchDiffCalculationWork (last_calculated_ts)
"#;

/// Index backing the oldest-first secondary claims.
pub const PG_CREATE_SECONDARY_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_secondary_work_last_calculated
    ON SecondaryBranchDiffCalculationWork (last_calculated_ts)
"#;

/// Returns the PostgreSQL schema statements in application order.
pub fn postgres_statements() -> Vec<&'static str> {
    vec![
        PG_CREATE_GROUPINGS_TABLE,
        PG_CREATE_PRIMARY_WORK_TABLE,
        PG_CREATE_SECONDARY_WORK_TABLE,
        PG_CREATE_PRIMARY_WORK_INDEX,
        PG_CREATE_SECONDARY_WORK_INDEX,
    ]
}

// SQLite stores timestamps as integer milliseconds since the epoch and digest
// sets as JSON arrays.

/// SQLite DDL for the groupings table.
pub const SQLITE_CREATE_GROUPINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Groupings (
    grouping_id BLOB PRIMARY KEY,
    keys TEXT NOT NULL
)
"#;

/// SQLite DDL for the primary-branch work queue.
pub const SQLITE_CREATE_PRIMARY_WORK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS PrimaryBranchDiffCalculationWork (
    grouping_id BLOB PRIMARY KEY,
    last_calculated_ts INTEGER NOT NULL,
    calculation_lease_ends INTEGER NOT NULL
)
"#;

/// SQLite DDL for the secondary-branch work queue.
pub const SQLITE_CREATE_SECONDARY_WORK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS SecondaryBranchDiffCalculationWork (
    branch_name TEXT NOT NULL,
    grouping_id BLOB NOT NULL,
    last_updated_ts INTEGER NOT NULL,
    digests TEXT NOT NULL,
    last_calculated_ts INTEGER NOT NULL,
    calculation_lease_ends INTEGER NOT NULL,
    PRIMARY KEY (branch_name, grouping_id)
)
"#;

/// Index backing the oldest-first primary claim.
pub const SQLITE_CREATE_PRIMARY_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_primary_work_last_calculated
    ON PrimaryBranchDiffCalculationWork (last_calculated_ts)
"#;

/// Index backing the oldest-first secondary claims.
pub const SQLITE_CREATE_SECONDARY_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_secondary_work_last_calculated
    ON SecondaryBranchDiffCalculationWork (last_calculated_ts)
"#;

/// Returns the SQLite schema statements in application order.
pub fn sqlite_statements() -> Vec<&'static str> {
    vec![
        SQLITE_CREATE_GROUPINGS_TABLE,
        SQLITE_CREATE_PRIMARY_WORK_TABLE,
        SQLITE_CREATE_SECONDARY_WORK_TABLE,
        SQLITE_CREATE_PRIMARY_WORK_INDEX,
        SQLITE_CREATE_SECONDARY_WORK_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Grouping params table name.
    pub const GROUPINGS: &str = "Groupings";
    /// Primary-branch work queue table name.
    pub const PRIMARY_WORK: &str = "PrimaryBranchDiffCalculationWork";
    /// Secondary-branch work queue table name.
    pub const SECONDARY_WORK: &str = "SecondaryBranchDiffCalculationWork";
}
