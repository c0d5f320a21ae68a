//! Bounded LRU cache of grouping params.
//!
//! Groupings are immutable once written, so entries never go stale and are
//! only dropped to make room. Recency is tracked with a monotonically
//! increasing access tick; the tick index keeps eviction O(log n).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use crate::types::{GroupingId, Params};

/// Default number of groupings kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

#[derive(Debug)]
struct CacheEntry {
    params: Params,
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<GroupingId, CacheEntry>,
    /// access tick -> grouping, oldest first
    recency: BTreeMap<u64, GroupingId>,
    next_tick: u64,
}

impl CacheState {
    fn touch(&mut self, id: GroupingId) -> Option<&Params> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(&id)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, id);
        self.next_tick += 1;
        Some(&entry.params)
    }
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total cache hits.
    pub hits: u64,
    /// Total cache misses.
    pub misses: u64,
    /// Total entries added.
    pub entries_added: u64,
    /// Total entries evicted.
    pub entries_evicted: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if there were no accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe LRU cache from grouping id to params.
///
/// A capacity of zero disables caching.
pub struct GroupingCache {
    state: Mutex<CacheState>,
    capacity: usize,
    stats: RwLock<CacheStats>,
}

impl GroupingCache {
    /// Creates an empty cache holding at most `capacity` groupings.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Returns the cached params and marks them most recently used.
    pub fn get(&self, id: &GroupingId) -> Option<Params> {
        let found = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.touch(*id).cloned()
        };

        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Inserts params, evicting the least recently used entry when full.
    pub fn insert(&self, id: GroupingId, params: Params) {
        if self.capacity == 0 {
            return;
        }

        let mut evicted = 0;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.touch(id).is_some() {
                return;
            }

            while state.entries.len() >= self.capacity {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                evicted += 1;
            }

            let tick = state.next_tick;
            state.next_tick += 1;
            state.recency.insert(tick, id);
            state.entries.insert(id, CacheEntry { params, tick });
        }

        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        stats.entries_added += 1;
        stats.entries_evicted += evicted;
    }

    /// Number of cached groupings.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Whether the cache holds no groupings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached groupings.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for GroupingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
