use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use lru::LruCache;

/// Token count remembered for a file together with the metadata it was measured at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedCount {
    pub count: usize,
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Bounded path -> token count cache, evicting the least recently used entry
/// once the hard capacity is reached.
pub struct TokenCache {
    cache: LruCache<PathBuf, CachedCount>,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(non_zero(capacity)),
        }
    }

    /// Cached count regardless of freshness
    pub fn get(&mut self, path: &Path) -> Option<CachedCount> {
        self.cache.get(path).copied()
    }

    /// Cached count if it was measured at or after `modified`.
    ///
    /// An entry without a recorded modification time is never fresh, and
    /// neither is any entry when the current time is unknown.
    pub fn get_fresh(&mut self, path: &Path, modified: Option<SystemTime>) -> Option<usize> {
        let cached = self.cache.get(path)?;
        match (cached.modified, modified) {
            (Some(stored), Some(current)) if stored >= current => Some(cached.count),
            _ => None,
        }
    }

    pub fn put(&mut self, path: PathBuf, entry: CachedCount) {
        self.cache.put(path, entry);
    }

    pub fn invalidate(&mut self, path: &Path) {
        self.cache.pop(path);
    }

    /// Drop least recently used entries until at most `keep` remain
    pub fn trim_to(&mut self, keep: usize) -> usize {
        let mut evicted = 0;
        while self.cache.len() > keep {
            if self.cache.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// (entries, capacity)
    pub fn stats(&self) -> (usize, usize) {
        (self.cache.len(), self.cache.cap().get())
    }
}

pub(crate) fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}
