//! Pre-rendered search page caching.
//!
//! A search renders its full result set once and stores the pages here,
//! keyed by the canonical self-link URL. Follow-up `page=N` requests are
//! served straight from the cache; a miss means the cached result set
//! expired and the client must re-run the search.
//!
//! Entries are evicted on idle TTL with probabilistic cleanup amortized
//! across inserts, so no background task is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// Seconds an entry may sit unread before it is eligible for eviction.
const DEFAULT_IDLE_TTL_SECS: u64 = 300;

/// Probability (1/N) of running cleanup on insert.
const CLEANUP_PROBABILITY: u32 = 100;

/// A fully rendered result set split into pages.
struct CacheEntry {
    /// Rendered bundle entries, one `Vec` per page.
    pages: Vec<Vec<Value>>,
    /// Total matches before paging.
    total: usize,
    /// Seconds since cache epoch of the last read, for idle eviction.
    last_access: AtomicU64,
}

/// One page pulled out of the cache.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub entries: Vec<Value>,
    pub total: usize,
    /// Number of pages held for this result set.
    pub page_count: usize,
}

/// Hit/miss counters for monitoring.
#[derive(Debug, Default)]
pub struct PageCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub insertions: AtomicU64,
}

/// A point-in-time snapshot of the counters.
#[derive(Debug, Clone)]
pub struct PageCacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub size: usize,
}

/// Concurrent page cache with idle-TTL eviction.
pub struct PageCache {
    cache: DashMap<String, CacheEntry>,
    idle_ttl_secs: u64,
    /// Epoch for `last_access` arithmetic.
    started: Instant,
    stats: Arc<PageCacheStats>,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("size", &self.cache.len())
            .field("idle_ttl_secs", &self.idle_ttl_secs)
            .finish()
    }
}

impl PageCache {
    pub fn new(idle_ttl_secs: u64) -> Self {
        Self {
            cache: DashMap::new(),
            idle_ttl_secs,
            started: Instant::now(),
            stats: Arc::new(PageCacheStats::default()),
        }
    }

    fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Stores a rendered result set under its canonical URL, replacing any
    /// previous result set for the same URL.
    pub fn insert(&self, canonical_url: &str, pages: Vec<Vec<Value>>, total: usize) {
        if fastrand::u32(0..CLEANUP_PROBABILITY) == 0 {
            self.cleanup_idle();
        }

        let entry = CacheEntry {
            pages,
            total,
            last_access: AtomicU64::new(self.elapsed_secs()),
        };
        self.cache.insert(canonical_url.to_string(), entry);
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        debug!(url = canonical_url, total, "cached search result set");
    }

    /// Fetches one page (1-based) of a cached result set. `None` on an
    /// unknown URL, an expired entry, or a page number past the end.
    pub fn get_page(&self, canonical_url: &str, page: usize) -> Option<CachedPage> {
        let now = self.elapsed_secs();

        if let Some(entry) = self.cache.get(canonical_url) {
            let last = entry.last_access.load(Ordering::Relaxed);
            if now.saturating_sub(last) > self.idle_ttl_secs {
                drop(entry);
                self.cache.remove(canonical_url);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            let index = page.max(1) - 1;
            let Some(rendered) = entry.pages.get(index) else {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };

            entry.last_access.store(now, Ordering::Relaxed);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(CachedPage {
                entries: rendered.clone(),
                total: entry.total,
                page_count: entry.pages.len(),
            });
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn contains(&self, canonical_url: &str) -> bool {
        self.cache.contains_key(canonical_url)
    }

    pub fn remove(&self, canonical_url: &str) {
        if self.cache.remove(canonical_url).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Drops every entry idle longer than the TTL.
    pub fn cleanup_idle(&self) {
        let now = self.elapsed_secs();
        let idle_keys: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_access.load(Ordering::Relaxed)) > self.idle_ttl_secs
            })
            .map(|entry| entry.key().clone())
            .collect();

        let evicted = idle_keys.len();
        for key in idle_keys {
            self.cache.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        if evicted > 0 {
            debug!(evicted, "evicted idle search result sets");
        }
    }

    pub fn stats(&self) -> PageCacheSnapshot {
        PageCacheSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            size: self.cache.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TTL_SECS)
    }
}
