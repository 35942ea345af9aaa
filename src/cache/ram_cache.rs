//! # RAM Cache (L2)
//!
//! Pinned in-memory copies of pages demoted out of L1. A hit here costs
//! one page copy instead of a flash read, so this tier absorbs the worst
//! of the fault-thrash when the working set slightly exceeds L1.
//!
//! ## Structure
//!
//! One arena of entries sized at init, with three views kept consistent
//! under the tier lock:
//!
//! - a hash index keyed by page address (lookup on fault)
//! - an intrusive LRU list (eviction order)
//! - a LIFO free list (admission)
//!
//! Entry index `i` owns buffer `i` of the pinned pool, so an entry's
//! page-aligned data buffer is implied by its position; there is no
//! separate buffer bookkeeping to diverge.
//!
//! Eviction policy lives in the tier: it scans the LRU tail through
//! [`RamCache::lru_tail`] / [`RamCache::lru_prev`], skips entries whose
//! page is still materialized in L1 (a page must never be demoted out
//! from under a live mapping), and removes the rest after pushing them
//! down to flash.

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::collections::{FreeList, LruList};
use crate::config::{INVALID_RANGE_ID, PAGE_SIZE};
use crate::memory::PinnedPool;

/// Metadata of one cached page copy. The data lives in the pool buffer
/// with the same index.
#[derive(Debug, Clone, Copy)]
pub struct L2Entry {
    pub page_addr: usize,
    pub vrange_id: u8,
}

/// Fixed-capacity cache of pinned page copies.
#[derive(Debug)]
pub struct RamCache {
    name: String,
    entries: Vec<L2Entry>,
    buffers: PinnedPool,
    index: HashMap<usize, u32>,
    lru: LruList,
    free: FreeList,
    hits: u64,
    misses: u64,
}

impl RamCache {
    /// Builds a cache holding `max_bytes / PAGE_SIZE` page copies.
    pub fn new(name: &str, max_bytes: u64) -> Result<Self> {
        let capacity = crate::config::round_up_to_page(max_bytes) / PAGE_SIZE as u64;
        ensure!(capacity > 0, "L2 '{name}' needs room for at least one page");
        let capacity = capacity as u32;

        Ok(Self {
            name: name.to_string(),
            entries: vec![
                L2Entry {
                    page_addr: 0,
                    vrange_id: INVALID_RANGE_ID,
                };
                capacity as usize
            ],
            buffers: PinnedPool::new(name, capacity)?,
            index: HashMap::with_capacity(capacity as usize),
            lru: LruList::new(capacity),
            free: FreeList::new(capacity),
            hits: 0,
            misses: 0,
        })
    }

    /// Index lookup without touching recency. Used by write-back paths
    /// that must not distort eviction order.
    #[inline]
    pub fn peek(&self, page_addr: usize) -> Option<u32> {
        self.index.get(&page_addr).copied()
    }

    /// Lookup that records a hit/miss and moves the entry to the LRU
    /// front.
    pub fn lookup(&mut self, page_addr: usize) -> Option<u32> {
        match self.index.get(&page_addr).copied() {
            Some(idx) => {
                self.lru.touch(idx);
                self.hits += 1;
                Some(idx)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Whether admission of a new page requires eviction first.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Admits a copy of `data` for `page_addr`. The caller evicts first
    /// when [`RamCache::is_full`]; call with a free entry available.
    pub fn insert(&mut self, page_addr: usize, vrange_id: u8, data: &[u8]) -> u32 {
        debug_assert!(!self.index.contains_key(&page_addr));
        let idx = self
            .free
            .take()
            .unwrap_or_else(|| panic!("L2 '{}' admitted a page while full", self.name));
        self.entries[idx as usize] = L2Entry {
            page_addr,
            vrange_id,
        };
        self.buffers.buf_mut(idx).copy_from_slice(data);
        let evicted = self.index.insert(page_addr, idx);
        debug_assert!(evicted.is_none(), "duplicate L2 key for {page_addr:#x}");
        self.lru.link_front(idx);
        idx
    }

    /// Overwrites the cached copy at `idx` with fresher bytes.
    pub fn refresh(&mut self, idx: u32, data: &[u8]) {
        self.buffers.buf_mut(idx).copy_from_slice(data);
    }

    /// The cached bytes of entry `idx`.
    #[inline]
    pub fn buffer(&self, idx: u32) -> &[u8] {
        self.buffers.buf(idx)
    }

    #[inline]
    pub fn entry(&self, idx: u32) -> &L2Entry {
        &self.entries[idx as usize]
    }

    /// Unlinks entry `idx` from the hash and LRU and frees it.
    pub fn remove(&mut self, idx: u32) {
        let entry = self.entries[idx as usize];
        let removed = self.index.remove(&entry.page_addr);
        debug_assert_eq!(removed, Some(idx), "hash and arena diverged");
        self.lru.unlink(idx);
        self.free.put(idx);
    }

    /// Least-recently-used entry index.
    #[inline]
    pub fn lru_tail(&self) -> Option<u32> {
        self.lru.tail()
    }

    /// Next entry toward the LRU front.
    #[inline]
    pub fn lru_prev(&self, idx: u32) -> Option<u32> {
        self.lru.prev_of(idx)
    }

    /// Drops every entry belonging to `vrange_id`.
    pub fn purge_range(&mut self, vrange_id: u8) -> usize {
        let doomed: Vec<u32> = self
            .index
            .values()
            .copied()
            .filter(|&idx| self.entries[idx as usize].vrange_id == vrange_id)
            .collect();
        for idx in &doomed {
            self.remove(*idx);
        }
        doomed.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.free.capacity()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// P4 validation: the hash and the LRU list describe the same entry
    /// set.
    pub fn check_consistency(&self) -> Result<()> {
        ensure!(
            self.index.len() == self.lru.len(),
            "L2 '{}': hash has {} entries but LRU has {}",
            self.name,
            self.index.len(),
            self.lru.len()
        );
        let mut walked = 0;
        let mut cursor = self.lru.tail();
        while let Some(idx) = cursor {
            let entry = &self.entries[idx as usize];
            ensure!(
                self.index.get(&entry.page_addr) == Some(&idx),
                "L2 '{}': LRU entry {} for {:#x} missing from hash",
                self.name,
                idx,
                entry.page_addr
            );
            walked += 1;
            cursor = self.lru.prev_of(idx);
        }
        ensure!(walked == self.index.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let mut cache = RamCache::new("l2", (4 * PAGE_SIZE) as u64).unwrap();

        let idx = cache.insert(0x10000, 3, &page(0xAB));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entry(idx).vrange_id, 3);

        let found = cache.lookup(0x10000).unwrap();
        assert_eq!(found, idx);
        assert!(cache.buffer(found).iter().all(|&b| b == 0xAB));
        assert_eq!(cache.hits(), 1);

        assert!(cache.lookup(0x20000).is_none());
        assert_eq!(cache.misses(), 1);

        cache.remove(idx);
        assert!(cache.lookup(0x10000).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn high_load_lookup_finds_every_key() {
        // Twice the capacity's worth of distinct keys would overflow the
        // arena, so size the cache to hold them all and hammer the index.
        let keys = 128usize;
        let mut cache = RamCache::new("l2", (keys * PAGE_SIZE) as u64).unwrap();

        for i in 0..keys {
            cache.insert(i * PAGE_SIZE, 0, &page(i as u8));
        }
        for i in 0..keys {
            let idx = cache.lookup(i * PAGE_SIZE).expect("key present");
            assert_eq!(cache.buffer(idx)[0], i as u8);
        }
        cache.check_consistency().unwrap();

        let victim = cache.peek(5 * PAGE_SIZE).unwrap();
        cache.remove(victim);
        assert!(cache.lookup(5 * PAGE_SIZE).is_none());
        cache.check_consistency().unwrap();
    }

    #[test]
    fn lru_tail_is_least_recent() {
        let mut cache = RamCache::new("l2", (3 * PAGE_SIZE) as u64).unwrap();
        let a = cache.insert(0x1000, 0, &page(1));
        let _b = cache.insert(0x2000, 0, &page(2));
        let _c = cache.insert(0x3000, 0, &page(3));

        // `a` is the tail until a lookup refreshes it.
        assert_eq!(cache.lru_tail(), Some(a));
        cache.lookup(0x1000);
        assert_ne!(cache.lru_tail(), Some(a));
    }

    #[test]
    fn refresh_overwrites_bytes() {
        let mut cache = RamCache::new("l2", (2 * PAGE_SIZE) as u64).unwrap();
        let idx = cache.insert(0x1000, 0, &page(0x11));
        cache.refresh(idx, &page(0x22));
        assert!(cache.buffer(idx).iter().all(|&b| b == 0x22));
    }

    #[test]
    fn purge_range_removes_only_that_range() {
        let mut cache = RamCache::new("l2", (6 * PAGE_SIZE) as u64).unwrap();
        for i in 0..6usize {
            cache.insert(i * PAGE_SIZE, (i % 3) as u8, &page(0));
        }

        assert_eq!(cache.purge_range(1), 2);
        assert_eq!(cache.len(), 4);
        cache.check_consistency().unwrap();
    }
}
