//! Diff computation.
//!
//! The scheduler never compares images itself. It hands a grouping's params
//! (and, for review branches, the branch-only digests) to a [`DiffEngine`].

pub mod http;

use async_trait::async_trait;

use crate::error::DiffError;
use crate::types::{Digest, Params};

pub use http::HttpDiffEngine;

/// Computes and persists diff metrics for one grouping.
#[async_trait]
pub trait DiffEngine: Send + Sync {
    /// Calculates diffs for every digest in `grouping`.
    ///
    /// An empty `extra_digests` means the primary branch; otherwise the extra
    /// digests are diffed against the grouping's primary-branch digests.
    async fn calculate_diffs(
        &self,
        grouping: &Params,
        extra_digests: &[Digest],
    ) -> Result<(), DiffError>;
}
