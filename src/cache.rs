//! The compiled-query cache: a bounded LRU map from
//! `(query text, output mode)` to a compiled query unit.
//!
//! Grounded on `ariaandika-postro`'s `qs` connection layer, which keys an
//! `lru::LruCache` by a prepared-statement identity for the same reason:
//! eviction must never invalidate a unit an in-flight request still holds,
//! which `Arc` ownership gives us independent of cache membership.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::types::{OutputMode, QueryUnit};

const DEFAULT_CAPACITY: usize = 1000;

type CacheKey = (String, OutputMode);

pub struct QueryCache {
    entries: LruCache<CacheKey, Arc<QueryUnit>>,
}

impl QueryCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        QueryCache {
            entries: LruCache::new(cap),
        }
    }

    pub fn lookup(&mut self, query_text: &str, mode: OutputMode) -> Option<Arc<QueryUnit>> {
        self.entries.get(&(query_text.to_string(), mode)).cloned()
    }

    /// Idempotent; only stores units whose `cacheable` flag is set.
    pub fn insert(&mut self, query_text: String, mode: OutputMode, unit: Arc<QueryUnit>) {
        if !unit.cacheable {
            return;
        }
        self.entries.put((query_text, mode), unit);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        QueryCache::new(DEFAULT_CAPACITY)
    }
}
