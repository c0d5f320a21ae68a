//! Core identifiers and work-row types shared across the crate.
//!
//! Groupings and digests are opaque hashes minted elsewhere (ingestion); this
//! module only gives them strong types so that branch names, grouping ids and
//! digests cannot be mixed up at call sites.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Sorted key/value parameters describing a grouping (e.g. test name and source type).
pub type Params = BTreeMap<String, String>;

/// Length in bytes of a [`GroupingId`].
pub const GROUPING_ID_LEN: usize = 16;

/// Error returned when raw bytes cannot be interpreted as a [`GroupingId`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("grouping id must be {GROUPING_ID_LEN} bytes, got {0}")]
pub struct InvalidGroupingId(pub usize);

/// Opaque fixed-size identifier of a grouping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupingId([u8; GROUPING_ID_LEN]);

impl GroupingId {
    /// Wraps raw id bytes.
    pub const fn new(bytes: [u8; GROUPING_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derives the id for a parameter map.
    ///
    /// The id is the leading 16 bytes of the SHA-256 of the map's JSON encoding.
    /// `Params` is a `BTreeMap`, so the encoding is independent of insertion order.
    pub fn from_params(params: &Params) -> Self {
        let encoded =
            serde_json::to_vec(params).expect("a map of strings always serializes to JSON");
        let hash = Sha256::digest(&encoded);
        let mut bytes = [0u8; GROUPING_ID_LEN];
        bytes.copy_from_slice(&hash[..GROUPING_ID_LEN]);
        Self(bytes)
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for GroupingId {
    type Error = InvalidGroupingId;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; GROUPING_ID_LEN] = value
            .try_into()
            .map_err(|_| InvalidGroupingId(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for GroupingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for GroupingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupingId({})", hex::encode(self.0))
    }
}

/// Content hash identifying one rendered image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wraps a digest string.
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// Get the digest string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Digest {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Converts stored digest strings into typed digests.
pub(crate) fn digests_from_strings(raw: Vec<String>) -> Vec<Digest> {
    raw.into_iter().map(Digest::from).collect()
}

/// Converts typed digests into the string form stored in the database.
pub(crate) fn digests_to_strings(digests: &[Digest]) -> Vec<String> {
    digests.iter().map(|d| d.as_str().to_string()).collect()
}

/// A claimed (or claimable) unit of secondary-branch work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryWork {
    /// Review branch the digests were uploaded to (e.g. `gerrit_12345`).
    pub branch: String,
    /// Grouping the digests belong to.
    pub grouping_id: GroupingId,
    /// Digests on the branch that are not yet on the primary branch.
    pub digests: Vec<Digest>,
}

/// Full snapshot of a primary-branch work row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryWorkRow {
    pub grouping_id: GroupingId,
    pub last_calculated_ts: DateTime<Utc>,
    pub calculation_lease_ends: DateTime<Utc>,
}

/// Full snapshot of a secondary-branch work row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryWorkRow {
    pub branch: String,
    pub grouping_id: GroupingId,
    pub digests: Vec<Digest>,
    pub last_updated_ts: DateTime<Utc>,
    pub last_calculated_ts: DateTime<Utc>,
    pub calculation_lease_ends: DateTime<Utc>,
}

/// Timestamp used for rows that were never calculated or leased.
pub fn beginning_of_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
