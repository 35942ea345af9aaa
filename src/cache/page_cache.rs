//! # Page Cache (L1)
//!
//! The set of currently materialized pages: every page the fault handler
//! has made accessible has an entry here, in fault order. When the queue
//! fills, the oldest entries demote to the RAM cache and their pages go
//! back to no-access protection.
//!
//! FIFO rather than LRU: entries turn over at page-fault rate, and the OS
//! page cache underneath already exploits recency. Tracking access order
//! here would double bookkeeping for no gain.
//!
//! Entries come from a pre-allocated arena with a LIFO free list, so
//! admission on the fault path never allocates.

use std::collections::VecDeque;

use eyre::{ensure, Result};

use crate::collections::FreeList;
use crate::config::{L1_EVICT_BATCH, PAGE_SIZE};

/// One materialized page.
#[derive(Debug, Clone, Copy)]
pub struct L1Entry {
    pub page_addr: usize,
    pub size: u32,
    pub vrange_id: u8,
}

/// Bounded FIFO of materialized pages.
#[derive(Debug)]
pub struct PageCache {
    name: String,
    entries: Vec<L1Entry>,
    free: FreeList,
    queue: VecDeque<u32>,
}

impl PageCache {
    /// Builds a cache admitting `max_bytes / PAGE_SIZE` pages.
    pub fn new(name: &str, max_bytes: u64) -> Result<Self> {
        let capacity = crate::config::round_up_to_page(max_bytes) / PAGE_SIZE as u64;
        ensure!(capacity > 0, "L1 '{name}' needs room for at least one page");
        let capacity = capacity as u32;

        Ok(Self {
            name: name.to_string(),
            entries: vec![
                L1Entry {
                    page_addr: 0,
                    size: 0,
                    vrange_id: crate::config::INVALID_RANGE_ID,
                };
                capacity as usize
            ],
            free: FreeList::new(capacity),
            queue: VecDeque::with_capacity(capacity as usize),
        })
    }

    /// Whether admission requires an eviction round first.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Enqueues a materialized page. The caller evicts first when
    /// [`PageCache::is_full`]; admission itself cannot fail.
    pub fn push(&mut self, page_addr: usize, size: u32, vrange_id: u8) {
        let index = self
            .free
            .take()
            .unwrap_or_else(|| panic!("L1 '{}' admitted a page while full", self.name));
        self.entries[index as usize] = L1Entry {
            page_addr,
            size,
            vrange_id,
        };
        self.queue.push_back(index);
    }

    /// Dequeues up to [`L1_EVICT_BATCH`] oldest entries for demotion,
    /// returning their arena slots to the free list.
    pub fn take_eviction_batch(&mut self) -> smallvec::SmallVec<[L1Entry; L1_EVICT_BATCH]> {
        let mut batch = smallvec::SmallVec::new();
        while batch.len() < L1_EVICT_BATCH {
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            batch.push(self.entries[index as usize]);
            self.free.put(index);
        }
        batch
    }

    /// Drops every entry belonging to `vrange_id`. Used when a range is
    /// released so no stale entry can reference a dead mapping.
    pub fn purge_range(&mut self, vrange_id: u8) -> usize {
        let mut purged = 0;
        let mut keep = VecDeque::with_capacity(self.queue.capacity());
        while let Some(index) = self.queue.pop_front() {
            if self.entries[index as usize].vrange_id == vrange_id {
                self.free.put(index);
                purged += 1;
            } else {
                keep.push_back(index);
            }
        }
        self.queue = keep;
        purged
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.free.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut cache = PageCache::new("l1", (4 * PAGE_SIZE) as u64).unwrap();

        for i in 0..4usize {
            cache.push(i * PAGE_SIZE, PAGE_SIZE as u32, 0);
        }
        assert!(cache.is_full());

        let batch = cache.take_eviction_batch();
        let addrs: Vec<usize> = batch.iter().map(|e| e.page_addr).collect();
        assert_eq!(addrs, vec![0, PAGE_SIZE, 2 * PAGE_SIZE, 3 * PAGE_SIZE]);
        assert!(cache.is_empty());
        assert!(!cache.is_full());
    }

    #[test]
    fn eviction_batch_is_bounded() {
        let capacity = (L1_EVICT_BATCH + 6) as u64;
        let mut cache = PageCache::new("l1", capacity * PAGE_SIZE as u64).unwrap();

        for i in 0..capacity as usize {
            cache.push(i * PAGE_SIZE, PAGE_SIZE as u32, 0);
        }

        let batch = cache.take_eviction_batch();
        assert_eq!(batch.len(), L1_EVICT_BATCH);
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn purge_drops_only_matching_range() {
        let mut cache = PageCache::new("l1", (8 * PAGE_SIZE) as u64).unwrap();
        for i in 0..6usize {
            cache.push(i * PAGE_SIZE, PAGE_SIZE as u32, (i % 2) as u8);
        }

        let purged = cache.purge_range(1);
        assert_eq!(purged, 3);
        assert_eq!(cache.len(), 3);

        let batch = cache.take_eviction_batch();
        assert!(batch.iter().all(|e| e.vrange_id == 0));
    }
}
