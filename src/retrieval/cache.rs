//! Result cache
//!
//! Short-lived cache of recent query results, keyed by the normalised
//! query plus the options that affect ranking. Hits replay the stored
//! result list verbatim.

use dashmap::DashMap;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::{EngramId, ScoredEngram, SearchOptions};

/// One cached result set
struct CacheEntry {
    results: Vec<ScoredEngram>,
    created_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Default)]
pub struct ResultCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// TTL-bounded query result cache
pub struct ResultCache {
    entries: DashMap<u64, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cache key over the normalised query and ranking-relevant options
    pub fn key(query: &str, options: &SearchOptions) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        query.trim().to_lowercase().hash(&mut hasher);
        options.limit.hash(&mut hasher);
        options.strategy.map(|s| s.as_str()).hash(&mut hasher);
        options.min_score.map(|s| s.to_bits()).hash(&mut hasher);
        options.filter.category.map(|c| c.as_str()).hash(&mut hasher);
        options.filter.project_id.hash(&mut hasher);
        options.filter.thread_id.hash(&mut hasher);
        options.filter.tags.hash(&mut hasher);
        options.filter.include_superseded.hash(&mut hasher);
        options.filter.protected.hash(&mut hasher);
        options
            .from_date
            .map(|d| d.timestamp_micros())
            .hash(&mut hasher);
        options
            .to_date
            .map(|d| d.timestamp_micros())
            .hash(&mut hasher);
        hasher.finish()
    }

    /// Replay a cached result set verbatim
    pub fn get(&self, key: u64) -> Option<Vec<ScoredEngram>> {
        if let Some(entry) = self.entries.get(&key) {
            if entry.created_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.results.clone());
            }
            drop(entry);
            self.entries.remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result set
    pub fn put(&self, key: u64, results: Vec<ScoredEngram>) {
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                results,
                created_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let mut oldest: Option<(u64, Instant)> = None;
        for entry in self.entries.iter() {
            match oldest {
                Some((_, when)) if entry.created_at >= when => {}
                _ => oldest = Some((*entry.key(), entry.created_at)),
            }
        }
        if let Some((key, _)) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop expired entries
    pub fn remove_expired(&self) {
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
    }

    /// Drop entries containing an engram (after a mutation)
    pub fn invalidate_for_engram(&self, id: EngramId) {
        self.entries.retain(|_, entry| {
            let contains = entry.results.iter().any(|r| r.engram.id == id);
            if contains {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
            !contains
        });
    }

    /// Drop everything
    pub fn clear(&self) {
        let count = self.entries.len() as u64;
        self.entries.clear();
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    /// Current statistics
    pub fn stats(&self) -> ResultCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        ResultCacheStats {
            entries: self.entries.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Engram, EngramCategory, EngramFilter, RetrievalSource, RetrievalStrategy,
    };
    use chrono::Utc;
    use std::collections::HashMap;

    fn result(id: EngramId, score: f32) -> ScoredEngram {
        ScoredEngram {
            engram: Engram {
                id,
                content: format!("engram {}", id),
                category: EngramCategory::Fact,
                importance: 0.5,
                original_importance: 0.5,
                embedding: None,
                metadata: HashMap::new(),
                access_count: 0,
                last_accessed_at: None,
                inserted_at: Utc::now(),
                updated_at: Utc::now(),
                decay_rate: 0.005,
                protected: false,
                thread_id: None,
                project_id: "global".to_string(),
                tags: vec![],
                superseded_at: None,
                content_hash: None,
                has_embedding: false,
            },
            score,
            source: RetrievalSource::Vector,
        }
    }

    #[test]
    fn test_put_get_verbatim() {
        let cache = ResultCache::new(Duration::from_secs(300), 100);
        let key = ResultCache::key("what is auth", &SearchOptions::default());
        cache.put(key, vec![result(1, 0.9), result(2, 0.7)]);

        let hit = cache.get(key).unwrap();
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].engram.id, 1);
        assert_eq!(hit[0].score, 0.9);
    }

    #[test]
    fn test_query_normalisation() {
        let options = SearchOptions::default();
        assert_eq!(
            ResultCache::key("  What IS auth ", &options),
            ResultCache::key("what is auth", &options)
        );
    }

    #[test]
    fn test_different_options_different_keys() {
        let a = SearchOptions::default();
        let b = SearchOptions {
            strategy: Some(RetrievalStrategy::GraphHeavy),
            ..Default::default()
        };
        let c = SearchOptions {
            filter: EngramFilter {
                project_id: Some("alpha".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let base = ResultCache::key("q", &a);
        assert_ne!(base, ResultCache::key("q", &b));
        assert_ne!(base, ResultCache::key("q", &c));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResultCache::new(Duration::ZERO, 100);
        let key = ResultCache::key("q", &SearchOptions::default());
        cache.put(key, vec![result(1, 0.5)]);
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn test_invalidate_for_engram() {
        let cache = ResultCache::new(Duration::from_secs(300), 100);
        let key = ResultCache::key("q", &SearchOptions::default());
        cache.put(key, vec![result(7, 0.5)]);

        cache.invalidate_for_engram(7);
        assert!(cache.get(key).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = ResultCache::new(Duration::from_secs(300), 2);
        for i in 0..3 {
            let key = ResultCache::key(&format!("q{}", i), &SearchOptions::default());
            cache.put(key, vec![result(i, 0.5)]);
        }
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = ResultCache::new(Duration::from_secs(300), 100);
        let key = ResultCache::key("q", &SearchOptions::default());
        cache.get(key);
        cache.put(key, vec![result(1, 0.5)]);
        cache.get(key);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }
}
