//! Grouping resolution.
//!
//! Work rows only carry a grouping id; the diff engine needs the full
//! parameter map. [`GroupingResolver`] bridges the two with a bounded LRU
//! cache in front of the `Groupings` table.

pub mod cache;
pub mod resolver;

pub use cache::{CacheStats, GroupingCache, DEFAULT_CACHE_CAPACITY};
pub use resolver::GroupingResolver;
