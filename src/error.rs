//! Error types for diff calculation operations.
//!
//! Defines error types for the subsystems above the storage layer:
//! - Grouping resolution
//! - Diff computation (the external engine)
//! - Claiming and computing one unit of work
//! - The polling loop
//!
//! Storage and configuration errors live next to their modules
//! (`storage::StoreError`, `config::ConfigError`).

use std::time::Duration;

use thiserror::Error;

use crate::storage::StoreError;
use crate::types::GroupingId;

/// Errors that can occur while resolving a grouping id to its params.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Grouping {0} not found")]
    UnknownGrouping(GroupingId),

    #[error("Grouping lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Errors reported by a diff engine.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Diff service request failed: {0}")]
    RequestFailed(String),

    #[error("Diff service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("Diff calculation failed: {0}")]
    Calculation(String),
}

/// Errors that can occur while claiming and computing one unit of work.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Work store error: {0}")]
    Store(#[from] StoreError),

    #[error("Could not resolve grouping: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Diff calculation for grouping {grouping} failed: {source}")]
    Diff {
        grouping: GroupingId,
        #[source]
        source: DiffError,
    },

    #[error("Unit of work exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

/// Errors that terminate the polling loop.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Polling cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_error_display_includes_grouping() {
        let grouping = GroupingId::new([1; 16]);
        let err = ClaimError::Diff {
            grouping,
            source: DiffError::Calculation("image missing".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains(&grouping.to_string()));
        assert!(text.contains("image missing"));
    }

    #[test]
    fn test_resolve_error_display() {
        let grouping = GroupingId::new([2; 16]);
        let err = ResolveError::UnknownGrouping(grouping);
        assert!(err.to_string().contains("not found"));
    }
}
