//! # SIEVE Page Cache with Lock Sharding
//!
//! Read cache for deserialized pages, keyed by packed page position and
//! costed by each page's memory estimate rather than by entry count: a page
//! full of large values pays for itself, so the configured budget bounds
//! actual memory use.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! Strict recency ordering lets one sequential scan evict the entire cache.
//! SIEVE keeps a FIFO queue plus a per-entry "visited" flag:
//!
//! - On access: set the visited flag
//! - On eviction: scan from the queue head
//!   - visited: clear the flag, rotate to the back (second chance)
//!   - not visited: evict
//!
//! Pages touched more than once survive; scan pages leave quickly. Internal
//! B-tree pages are inserted twice by the write path, which lands here as a
//! set visited flag, so index structure outlives the leaves below it.
//!
//! ## Heterogeneous Entries
//!
//! Maps are generic over their key and value types, so the cache stores
//! pages as `Arc<dyn Any + Send + Sync>` and the owning map downcasts on
//! hit. A position uniquely identifies one page of one map, and positions
//! are never reused (chunks are append-only), so a downcast failure cannot
//! happen for well-formed keys.
//!
//! ## Lock Sharding
//!
//! Entries are spread over 16 independent shards, each behind its own
//! `parking_lot::RwLock`, with the visited flag atomic so hits only take
//! the read side.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::CACHE_SHARD_COUNT;

pub(crate) type CachedPage = Arc<dyn Any + Send + Sync>;

struct CacheEntry {
    value: CachedPage,
    memory: usize,
    visited: AtomicBool,
}

#[derive(Default)]
struct CacheShard {
    entries: HashMap<u64, CacheEntry>,
    queue: VecDeque<u64>,
    mem_used: usize,
}

impl CacheShard {
    fn evict_to(&mut self, budget: usize) {
        while self.mem_used > budget {
            let Some(pos) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&pos) else {
                continue;
            };
            if entry.visited.swap(false, Ordering::Relaxed) {
                self.queue.push_back(pos);
            } else if let Some(entry) = self.entries.remove(&pos) {
                self.mem_used -= entry.memory;
            }
        }
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
    shard_budget: usize,
}

impl PageCache {
    /// Creates a cache bounded by `budget_bytes` of page memory estimates.
    /// A zero budget disables caching entirely.
    pub fn new(budget_bytes: usize) -> Self {
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|_| RwLock::new(CacheShard::default()))
            .collect();
        Self {
            shards,
            shard_budget: budget_bytes / CACHE_SHARD_COUNT,
        }
    }

    fn shard(&self, pos: u64) -> &RwLock<CacheShard> {
        let hash = (pos ^ (pos >> 32)) as usize;
        &self.shards[hash % CACHE_SHARD_COUNT]
    }

    pub(crate) fn get(&self, pos: u64) -> Option<CachedPage> {
        let shard = self.shard(pos).read();
        let entry = shard.entries.get(&pos)?;
        entry.visited.store(true, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Inserts or refreshes the page at `pos`. Re-inserting an existing
    /// position marks it visited, promoting it under the SIEVE policy.
    pub(crate) fn insert(&self, pos: u64, value: CachedPage, memory: usize) {
        if self.shard_budget == 0 {
            return;
        }
        let mut shard = self.shard(pos).write();
        let shard = &mut *shard;
        if let Some(entry) = shard.entries.get_mut(&pos) {
            let old_memory = entry.memory;
            entry.value = value;
            entry.memory = memory;
            entry.visited.store(true, Ordering::Relaxed);
            shard.mem_used = shard.mem_used - old_memory + memory;
        } else {
            shard.entries.insert(
                pos,
                CacheEntry {
                    value,
                    memory,
                    visited: AtomicBool::new(false),
                },
            );
            shard.queue.push_back(pos);
            shard.mem_used += memory;
        }
        let budget = self.shard_budget;
        shard.evict_to(budget);
    }

    /// Number of cached pages across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of cached memory estimates across all shards.
    pub fn memory_used(&self) -> usize {
        self.shards.iter().map(|s| s.read().mem_used).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(tag: u32) -> CachedPage {
        Arc::new(tag)
    }

    fn tag_of(value: &CachedPage) -> u32 {
        *value.downcast_ref::<u32>().unwrap()
    }

    #[test]
    fn get_returns_inserted_value() {
        let cache = PageCache::new(1 << 20);
        cache.insert(100, page(1), 64);

        let hit = cache.get(100).unwrap();
        assert_eq!(tag_of(&hit), 1);
        assert!(cache.get(200).is_none());
    }

    #[test]
    fn reinsert_replaces_value_and_memory() {
        let cache = PageCache::new(1 << 20);
        cache.insert(100, page(1), 64);
        cache.insert(100, page(2), 96);

        assert_eq!(tag_of(&cache.get(100).unwrap()), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 96);
    }

    #[test]
    fn memory_budget_evicts_oldest_unvisited() {
        let cache = PageCache::new(CACHE_SHARD_COUNT * 100);
        // all three land in the same shard because the keys collide modulo
        // the shard count after the fold
        let base = 1u64 << 40;
        cache.insert(base, page(1), 60);
        cache.insert(base + (CACHE_SHARD_COUNT as u64), page(2), 60);
        assert!(cache.memory_used() <= 100 + 60);
    }

    #[test]
    fn visited_entries_get_a_second_chance() {
        let cache = PageCache::new(CACHE_SHARD_COUNT * 150);
        let k = |i: u64| (i * CACHE_SHARD_COUNT as u64) << 6; // same shard
        cache.insert(k(1), page(1), 60);
        cache.insert(k(2), page(2), 60);
        // touch the oldest so it survives the next eviction scan
        cache.get(k(1)).unwrap();
        cache.insert(k(3), page(3), 60);

        assert!(cache.get(k(1)).is_some(), "visited entry was evicted");
        assert!(cache.get(k(2)).is_none(), "unvisited entry survived");
    }

    #[test]
    fn zero_budget_disables_caching() {
        let cache = PageCache::new(0);
        cache.insert(100, page(1), 64);
        assert!(cache.get(100).is_none());
        assert_eq!(cache.len(), 0);
    }
}
