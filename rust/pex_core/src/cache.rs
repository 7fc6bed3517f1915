//! Resolution cache keyed by `(subject, normalized context set)`.
//!
//! Validity is decided by a monotonically increasing generation counter,
//! so invalidation never has to walk the entries:
//!
//! - coarse mode: an entry is valid iff its generation equals the current
//!   generation;
//! - per-subject mode: an entry is valid iff it is not older than the last
//!   whole-cache invalidation and none of the subjects its traversal
//!   consulted was written after it was computed.
//!
//! An entry's generation is read *before* its traversal starts, so a write
//! racing with a computation always leaves the entry invalid.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::InvalidationMode;
use crate::resolver::ResolutionResult;
use crate::types::{ContextSet, SubjectRef};

type CacheKey = (SubjectRef, ContextSet);

struct CacheEntry {
    result: Arc<ResolutionResult>,
    generation: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub generation: u64,
}

pub struct ResolutionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    mode: InvalidationMode,
    /// 0 disables the bound.
    max_entries: usize,
    generation: AtomicU64,
    /// Generation of the last whole-cache invalidation.
    floor: AtomicU64,
    /// Per-subject mode: generation of the last write to each subject.
    touched: DashMap<SubjectRef, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResolutionCache {
    pub fn new(mode: InvalidationMode, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            mode,
            max_entries,
            generation: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            touched: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> InvalidationMode {
        self.mode
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_valid(&self, result: &ResolutionResult, generation: u64) -> bool {
        match self.mode {
            InvalidationMode::Coarse => generation == self.current_generation(),
            InvalidationMode::PerSubject => {
                generation >= self.floor.load(Ordering::Acquire)
                    && result.dependencies().iter().all(|dep| {
                        self.touched
                            .get(dep)
                            .map_or(true, |written| *written <= generation)
                    })
            }
        }
    }

    pub fn get(&self, subject: &SubjectRef, contexts: &ContextSet) -> Option<Arc<ResolutionResult>> {
        let key = (subject.clone(), contexts.clone());
        let found = self.entries.get(&key).map(|entry| {
            let valid = self.is_valid(&entry.result, entry.generation);
            (Arc::clone(&entry.result), entry.generation, valid)
        });

        match found {
            Some((result, _, true)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(subject = %subject, contexts = %contexts, "resolution cache hit");
                Some(result)
            }
            Some((_, generation, false)) => {
                self.entries
                    .remove_if(&key, |_, entry| entry.generation == generation);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result computed at `result.generation()`. Results already
    /// invalidated by a concurrent write are dropped.
    pub fn put(&self, subject: SubjectRef, contexts: ContextSet, result: Arc<ResolutionResult>) {
        let generation = result.generation();
        if !self.is_valid(&result, generation) {
            tracing::trace!(subject = %subject, generation, "discarding stale resolution");
            return;
        }

        // Evict ~10% when full. DashMap has no ordering, so eviction is arbitrary.
        if self.max_entries > 0 && self.entries.len() >= self.max_entries {
            let to_remove = (self.max_entries / 10).max(1);
            let keys: Vec<CacheKey> = self
                .entries
                .iter()
                .take(to_remove)
                .map(|entry| entry.key().clone())
                .collect();
            for key in keys {
                self.entries.remove(&key);
            }
        }

        self.entries
            .entry((subject, contexts))
            .and_modify(|existing| {
                if existing.generation <= generation {
                    existing.result = Arc::clone(&result);
                    existing.generation = generation;
                }
            })
            .or_insert_with(|| CacheEntry {
                result: Arc::clone(&result),
                generation,
            });
    }

    /// Invalidate every cached result. Returns the new generation.
    pub fn invalidate_all(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.floor.store(generation, Ordering::Release);
        self.entries.clear();
        tracing::debug!(generation, "resolution cache invalidated");
        generation
    }

    /// Invalidate results that consulted `subject`; the whole cache in
    /// coarse mode. Returns the new generation.
    pub fn invalidate_subject(&self, subject: &SubjectRef) -> u64 {
        match self.mode {
            InvalidationMode::Coarse => self.invalidate_all(),
            InvalidationMode::PerSubject => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.touched.insert(subject.clone(), generation);
                tracing::debug!(subject = %subject, generation, "subject invalidated");
                generation
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generation: self.current_generation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextValue;

    fn subject(id: &str) -> SubjectRef {
        SubjectRef::new("user", id)
    }

    fn result(cache: &ResolutionCache, root: &str, deps: &[&str]) -> Arc<ResolutionResult> {
        Arc::new(ResolutionResult::empty(
            subject(root),
            deps.iter().map(|d| subject(d)).collect(),
            cache.current_generation(),
        ))
    }

    #[test]
    fn context_order_does_not_split_entries() {
        let cache = ResolutionCache::new(InvalidationMode::Coarse, 0);
        let a: ContextSet = vec![ContextValue::new("world", "w"), ContextValue::new("server", "s")].into();
        let b: ContextSet = vec![ContextValue::new("server", "s"), ContextValue::new("world", "w")].into();
        cache.put(subject("alice"), a, result(&cache, "alice", &["alice"]));
        assert!(cache.get(&subject("alice"), &b).is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn coarse_write_invalidates_everything() {
        let cache = ResolutionCache::new(InvalidationMode::Coarse, 0);
        let ctx = ContextSet::new();
        cache.put(subject("alice"), ctx.clone(), result(&cache, "alice", &["alice"]));
        cache.put(subject("bob"), ctx.clone(), result(&cache, "bob", &["bob"]));
        cache.invalidate_subject(&subject("carol"));
        assert!(cache.get(&subject("alice"), &ctx).is_none());
        assert!(cache.get(&subject("bob"), &ctx).is_none());
    }

    #[test]
    fn per_subject_write_spares_unrelated_entries() {
        let cache = ResolutionCache::new(InvalidationMode::PerSubject, 0);
        let ctx = ContextSet::new();
        cache.put(subject("alice"), ctx.clone(), result(&cache, "alice", &["alice", "admin"]));
        cache.put(subject("bob"), ctx.clone(), result(&cache, "bob", &["bob"]));

        cache.invalidate_subject(&subject("admin"));
        assert!(cache.get(&subject("alice"), &ctx).is_none());
        assert!(cache.get(&subject("bob"), &ctx).is_some());

        cache.invalidate_all();
        assert!(cache.get(&subject("bob"), &ctx).is_none());
    }

    #[test]
    fn result_computed_before_write_is_not_stored() {
        let cache = ResolutionCache::new(InvalidationMode::Coarse, 0);
        let stale = result(&cache, "alice", &["alice"]);
        cache.invalidate_subject(&subject("alice"));
        cache.put(subject("alice"), ContextSet::new(), stale);
        assert!(cache.is_empty());

        let cache = ResolutionCache::new(InvalidationMode::PerSubject, 0);
        let stale = result(&cache, "alice", &["alice"]);
        cache.invalidate_subject(&subject("alice"));
        cache.put(subject("alice"), ContextSet::new(), stale);
        assert!(cache.is_empty());
    }

    #[test]
    fn bounded_cache_evicts() {
        let cache = ResolutionCache::new(InvalidationMode::Coarse, 10);
        for i in 0..25 {
            let id = format!("u{}", i);
            cache.put(subject(&id), ContextSet::new(), result(&cache, &id, &[]));
        }
        assert!(cache.len() <= 10);
    }
}
