//! # Caching Layer - LRU in front of the fallback chain
//!
//! Memories and contexts are cached in separate LRUs. Writes go through (the cache is
//! updated before the mutation returns), read misses fill lazily, deletes invalidate.
//! An entry with an in-flight sync-back is kept past capacity, up to `max_pinned` extra
//! entries; beyond that the least recently used goes regardless; reads of pending
//! entities route to their source backend anyway.

use crate::sync::{EntityKey, PendingSet};
use crate::types::{Context, ContextId, Memory, MemoryId};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_capacity: usize,
    pub context_capacity: usize,
    /// Entries with a pending sync-back that may be held beyond capacity, per cache
    pub max_pinned: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            context_capacity: 1_000,
            max_pinned: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn memory_capacity(mut self, capacity: usize) -> Self {
        self.config.memory_capacity = capacity.max(1);
        self
    }

    pub fn context_capacity(mut self, capacity: usize) -> Self {
        self.config.context_capacity = capacity.max(1);
        self
    }

    pub fn max_pinned(mut self, max_pinned: usize) -> Self {
        self.config.max_pinned = max_pinned;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

/// Entries that know whether they are fresher than another copy
trait Versioned {
    fn supersedes(&self, other: &Self) -> bool;
}

impl Versioned for Memory {
    fn supersedes(&self, other: &Self) -> bool {
        Memory::supersedes(self, other)
    }
}

impl Versioned for Context {
    fn supersedes(&self, other: &Self) -> bool {
        Context::supersedes(self, other)
    }
}

/// LRU with a soft capacity: pinned entries survive eviction until the hard limit
struct PinnedLru<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    capacity: usize,
    hard_limit: usize,
}

impl<K, V> PinnedLru<K, V>
where
    K: Hash + Eq + Clone,
    V: Versioned + Clone,
{
    fn new(capacity: usize, max_pinned: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            hard_limit: capacity.saturating_add(max_pinned),
        }
    }

    /// Insert unless a fresher copy is already cached. Returns the number of evictions.
    fn put(&mut self, key: K, value: V, pinned: impl Fn(&K) -> bool) -> (bool, u64) {
        if let Some(existing) = self.entries.peek(&key) {
            if existing.supersedes(&value) {
                self.entries.promote(&key);
                return (false, 0);
            }
        }
        self.entries.put(key, value);

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .map(|(k, _)| k)
                .find(|k| !pinned(k))
                .cloned();
            match victim {
                Some(k) => {
                    self.entries.pop(&k);
                    evicted += 1;
                }
                None if self.entries.len() > self.hard_limit => {
                    self.entries.pop_lru();
                    evicted += 1;
                }
                None => break,
            }
        }
        (true, evicted)
    }
}

/// Write-through cache for memories and contexts
pub struct CacheLayer {
    memories: Mutex<PinnedLru<MemoryId, Memory>>,
    contexts: Mutex<PinnedLru<ContextId, Context>>,
    pending: Arc<PendingSet>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer").field("stats", &self.stats()).finish()
    }
}

impl CacheLayer {
    pub fn new(config: CacheConfig, pending: Arc<PendingSet>) -> Self {
        Self {
            memories: Mutex::new(PinnedLru::new(config.memory_capacity.max(1), config.max_pinned)),
            contexts: Mutex::new(PinnedLru::new(config.context_capacity.max(1), config.max_pinned)),
            pending,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_memory(&self, id: &str) -> Option<Memory> {
        let found = self
            .memories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(id)
            .cloned();
        self.record(found.is_some());
        found
    }

    /// Cache a memory unless a fresher copy is present. Returns whether it was stored.
    pub fn put_memory(&self, memory: Memory) -> bool {
        let pending = &self.pending;
        let (stored, evicted) = self
            .memories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(memory.id.clone(), memory, |id| {
                pending.is_pinned(&EntityKey::Memory(id.clone()))
            });
        self.note_evictions(evicted);
        stored
    }

    pub fn invalidate_memory(&self, id: &str) -> bool {
        self.memories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .pop(id)
            .is_some()
    }

    pub fn get_context(&self, id: &str) -> Option<Context> {
        let found = self
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(id)
            .cloned();
        self.record(found.is_some());
        found
    }

    pub fn put_context(&self, context: Context) -> bool {
        let pending = &self.pending;
        let (stored, evicted) = self
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(context.id.clone(), context, |id| {
                pending.is_pinned(&EntityKey::Context(id.clone()))
            });
        self.note_evictions(evicted);
        stored
    }

    pub fn invalidate_context(&self, id: &str) -> bool {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .pop(id)
            .is_some()
    }

    fn note_evictions(&self, evicted: u64) {
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::trace!(evicted, "cache evicted entries");
        }
    }

    pub fn len(&self) -> (usize, usize) {
        let memories = self.memories.lock().unwrap_or_else(|e| e.into_inner()).entries.len();
        let contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner()).entries.len();
        (memories, contexts)
    }

    pub fn clear(&self) {
        self.memories.lock().unwrap_or_else(|e| e.into_inner()).entries.clear();
        self.contexts.lock().unwrap_or_else(|e| e.into_inner()).entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryKind, NewMemory};
    use chrono::Utc;

    fn layer(capacity: usize) -> (CacheLayer, Arc<PendingSet>) {
        let pending = Arc::new(PendingSet::new());
        let config = CacheConfig::builder().memory_capacity(capacity).build();
        (CacheLayer::new(config, Arc::clone(&pending)), pending)
    }

    fn memory(content: &str) -> Memory {
        NewMemory::new("a", MemoryKind::Episodic, content).into_memory(Utc::now())
    }

    #[test]
    fn evicts_least_recently_used() {
        let (cache, _) = layer(2);
        let (m1, m2, m3) = (memory("one"), memory("two"), memory("three"));
        cache.put_memory(m1.clone());
        cache.put_memory(m2.clone());
        assert!(cache.get_memory(&m1.id).is_some());
        cache.put_memory(m3.clone());

        assert!(cache.get_memory(&m2.id).is_none());
        assert!(cache.get_memory(&m1.id).is_some());
        assert!(cache.get_memory(&m3.id).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let (cache, pending) = layer(1);
        let (m1, m2) = (memory("one"), memory("two"));
        pending.mark(EntityKey::Memory(m1.id.clone()), 2);
        pending.mark(EntityKey::Memory(m2.id.clone()), 2);

        cache.put_memory(m1.clone());
        cache.put_memory(m2.clone());
        assert_eq!(cache.len().0, 2);

        pending.clear(&EntityKey::Memory(m1.id.clone()));
        cache.put_memory(memory("three"));
        assert!(cache.get_memory(&m1.id).is_none());
        assert!(cache.get_memory(&m2.id).is_some());
    }

    #[test]
    fn pinned_overflow_is_capped() {
        let pending = Arc::new(PendingSet::new());
        let config = CacheConfig::builder().memory_capacity(2).max_pinned(2).build();
        let cache = CacheLayer::new(config, Arc::clone(&pending));

        let memories: Vec<Memory> = (0..10).map(|i| memory(&format!("m{i}"))).collect();
        for m in &memories {
            pending.mark(EntityKey::Memory(m.id.clone()), 1);
            cache.put_memory(m.clone());
        }

        assert_eq!(cache.len().0, 4);
        assert_eq!(cache.stats().evictions, 6);
        assert!(cache.get_memory(&memories[0].id).is_none());
        assert!(cache.get_memory(&memories[9].id).is_some());
    }

    #[test]
    fn abandoned_syncs_no_longer_pin() {
        let (cache, pending) = layer(1);
        let (m1, m2) = (memory("one"), memory("two"));
        pending.mark(EntityKey::Memory(m1.id.clone()), 1);
        cache.put_memory(m1.clone());

        pending.abandon(&EntityKey::Memory(m1.id.clone()));
        cache.put_memory(m2.clone());
        assert!(cache.get_memory(&m1.id).is_none());
        assert!(cache.get_memory(&m2.id).is_some());
    }

    #[test]
    fn older_copies_never_replace_newer_ones() {
        let (cache, _) = layer(4);
        let old = memory("v1");
        let mut new = old.clone();
        new.version = 2;
        new.content = "v2".into();

        assert!(cache.put_memory(new.clone()));
        assert!(!cache.put_memory(old));
        assert_eq!(cache.get_memory(&new.id).unwrap().content, "v2");
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let (cache, _) = layer(4);
        let m = memory("x");
        assert!(cache.get_memory(&m.id).is_none());
        cache.put_memory(m.clone());
        assert!(cache.get_memory(&m.id).is_some());
        assert!(cache.invalidate_memory(&m.id));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }
}
