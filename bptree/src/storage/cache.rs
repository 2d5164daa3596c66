//! Optional cache of decoded block payloads, keyed by offset.
//!
//! The page store consults the cache before reading a block and invalidates
//! an entry whenever it writes that block. The cache never holds dirty data,
//! so it can be dropped at any time without losing writes.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::storage::block::Offset;

/// A cache of raw page payloads.
pub trait PageCache: Send + Sync {
    /// Cached payload for `offset`, if present.
    fn get(&mut self, offset: Offset) -> Option<Vec<u8>>;

    /// Remember the payload read from `offset`.
    fn set(&mut self, offset: Offset, payload: Vec<u8>);

    /// Forget `offset`. Called on every write to that block.
    fn invalidate(&mut self, offset: Offset);
}

/// Cache that stores nothing. Every read goes to the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl PageCache for NoCache {
    fn get(&mut self, _offset: Offset) -> Option<Vec<u8>> {
        None
    }

    fn set(&mut self, _offset: Offset, _payload: Vec<u8>) {}

    fn invalidate(&mut self, _offset: Offset) {}
}

/// Bounded least-recently-used payload cache.
pub struct LruPageCache {
    entries: LruCache<Offset, Vec<u8>>,
}

impl LruPageCache {
    /// Cache holding at most `capacity` payloads.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Number of cached payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageCache for LruPageCache {
    fn get(&mut self, offset: Offset) -> Option<Vec<u8>> {
        self.entries.get(&offset).cloned()
    }

    fn set(&mut self, offset: Offset, payload: Vec<u8>) {
        self.entries.put(offset, payload);
    }

    fn invalidate(&mut self, offset: Offset) {
        self.entries.pop(&offset);
    }
}

/// Build the cache for a configured capacity. Zero disables caching.
#[must_use]
pub fn cache_for_capacity(capacity: usize) -> Box<dyn PageCache> {
    match NonZeroUsize::new(capacity) {
        Some(capacity) => Box::new(LruPageCache::new(capacity)),
        None => Box::new(NoCache),
    }
}
