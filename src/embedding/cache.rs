//! Embedding cache with zero-copy sharing via Arc<[f32]>
//!
//! Bounded by bytes of embedding data rather than entry count, keyed by
//! content hash. Recency is tracked with a monotonic use stamp and a
//! stamp-ordered index, so eviction pops the least recently used entry
//! without any pointer chasing. Thread-safe with atomic hit/miss
//! counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Statistics for the embedding cache
#[derive(Debug, Clone)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes_used: usize,
    pub max_bytes: usize,
    pub hit_rate: f64,
}

struct CacheEntry {
    embedding: Arc<[f32]>,
    size_bytes: usize,
    /// Use stamp at last touch; also the entry's key in `recency`
    stamp: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// stamp -> key, oldest first; stamps are unique by construction
    recency: BTreeMap<u64, String>,
    bytes_used: usize,
    clock: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.stamp);
            entry.stamp = clock;
            self.recency.insert(clock, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.stamp);
        self.bytes_used -= entry.size_bytes;
        Some(entry)
    }

    /// Drop least-recently-used entries until `wanted` bytes fit
    fn make_room(&mut self, wanted: usize, max_bytes: usize) {
        while self.bytes_used + wanted > max_bytes {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes_used -= entry.size_bytes;
            }
        }
    }
}

/// Thread-safe LRU embedding cache with bytes-based capacity
pub struct EmbeddingCache {
    state: Mutex<CacheState>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache bounded to `max_bytes` of embedding data
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                bytes_used: 0,
                clock: 0,
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an embedding by content hash
    pub fn get(&self, key: &str) -> Option<Arc<[f32]>> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) => {
                let embedding = entry.embedding.clone();
                state.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(embedding)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an embedding, evicting LRU entries to respect capacity
    pub fn put(&self, key: String, embedding: Arc<[f32]>) {
        let size_bytes = embedding.len() * std::mem::size_of::<f32>();
        if size_bytes > self.max_bytes {
            return;
        }

        let mut state = self.state.lock();
        state.remove(&key);
        state.make_room(size_bytes, self.max_bytes);

        state.clock += 1;
        let stamp = state.clock;
        state.recency.insert(stamp, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                embedding,
                size_bytes,
                stamp,
            },
        );
        state.bytes_used += size_bytes;
    }

    /// Current statistics
    pub fn stats(&self) -> EmbeddingCacheStats {
        let state = self.state.lock();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        EmbeddingCacheStats {
            hits,
            misses,
            entries: state.entries.len(),
            bytes_used: state.bytes_used,
            max_bytes: self.max_bytes,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 * 100.0 / total as f64
            },
        }
    }
}
