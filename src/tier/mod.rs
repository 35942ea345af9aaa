//! # Tier Instances
//!
//! A tier instance bundles one L1 + L2 + L3 + AIO quartet serving a shard
//! of the address space; the tier group is the array of instances plus
//! the shard routing.
//!
//! ## Sharding
//!
//! A virtual page belongs to instance
//! `((addr_offset >> PAGE_BITS) >> CHUNK_BITS) % tier_count`: 16
//! consecutive pages (one chunk) share an instance, so chunk-sized
//! prefetching stays within one lock while different chunks spread load
//! round-robin across instances.
//!
//! ## Locking
//!
//! One coarse mutex per instance, held across the whole fault servicing:
//! V2H reads, population, cache mutation, protection changes. Everything
//! inside [`TierCaches`] is therefore single-writer. The demotion cascade
//! (L1 → L2 → L3 → backing file) runs entirely under that one lock, which
//! is what makes cross-tier moves transactional: no concurrent faulter
//! can observe a page half-moved between tiers.

use eyre::{bail, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::aio::AioManager;
use crate::cache::{FlashCache, PageCache, RamCache};
use crate::config::{CHUNK_BITS, L2_EVICT_BATCH, PAGE_BITS, PAGE_SIZE};
use crate::memory::{discard, set_protection, PageProtection};
use crate::vrange::{RangeRegistry, VRange};

/// The cache quartet of one instance. All methods assume the instance
/// lock is held.
#[derive(Debug)]
pub struct TierCaches {
    pub l1: PageCache,
    pub l2: RamCache,
    pub l3: FlashCache,
    pub aio: Option<AioManager>,
}

impl TierCaches {
    /// Admits a freshly materialized page into L1, cascading demotions
    /// down the tiers as needed.
    pub fn add_to_l1(
        &mut self,
        registry: &RangeRegistry,
        range: &VRange,
        page_index: u64,
        dirty: bool,
    ) -> Result<()> {
        if self.l1.is_full() {
            self.evict_l1(registry)?;
        }
        self.l1
            .push(range.page_addr(page_index), PAGE_SIZE as u32, range.id());
        let v2h = range.v2h(page_index);
        v2h.set_in_l1(true);
        v2h.set_dirty_l1(dirty);
        Ok(())
    }

    /// Demotes the oldest L1 entries to L2, then returns their pages to
    /// the OS and to no-access protection.
    pub fn evict_l1(&mut self, registry: &RangeRegistry) -> Result<usize> {
        let batch = self.l1.take_eviction_batch();
        for entry in &batch {
            let Some(range) = registry.get(entry.vrange_id) else {
                // Entries of released ranges are purged eagerly; one here
                // means teardown raced a fault, and the mapping is gone.
                tracing::warn!(vrange_id = entry.vrange_id, "dropping orphaned L1 entry");
                continue;
            };
            let page_index = range.page_index_of(entry.page_addr);
            let v2h = range.v2h(page_index);
            let dirty = v2h.dirty_l1();

            // Copy the bytes down while the page is still mapped.
            // SAFETY: the entry being in L1 means the page is mapped, and
            // the tier lock (held by our caller) blocks concurrent
            // protection changes.
            let bytes = unsafe { range.page_bytes(page_index) };
            self.add_to_l2(registry, &range, page_index, dirty, bytes)?;

            v2h.set_in_l1(false);
            v2h.set_dirty_l1(false);
            discard(entry.page_addr as *mut u8, entry.size as usize)?;
            set_protection(
                entry.page_addr as *mut u8,
                entry.size as usize,
                PageProtection::None,
            )?;
        }
        Ok(batch.len())
    }

    /// Caches a copy of a page in L2. A page already present only pays a
    /// copy when the incoming bytes are fresher.
    pub fn add_to_l2(
        &mut self,
        registry: &RangeRegistry,
        range: &VRange,
        page_index: u64,
        dirty: bool,
        bytes: &[u8],
    ) -> Result<()> {
        let v2h = range.v2h(page_index);
        let page_addr = range.page_addr(page_index);

        if let Some(idx) = self.l2.lookup(page_addr) {
            if dirty {
                self.l2.refresh(idx, bytes);
                v2h.set_dirty_l2(true);
            }
            return Ok(());
        }

        while self.l2.is_full() {
            if self.evict_l2(registry)? == 0 {
                bail!("L2 is full and nothing is evictable");
            }
        }
        self.l2.insert(page_addr, range.id(), bytes);
        v2h.set_in_l2(true);
        v2h.set_dirty_l2(dirty);
        Ok(())
    }

    /// Scans the LRU tail for entries whose page is no longer in L1 and
    /// demotes them toward flash. Entries both clean and already flash-
    /// resident are dropped without a write.
    pub fn evict_l2(&mut self, registry: &RangeRegistry) -> Result<usize> {
        let mut victims: SmallVec<[u32; L2_EVICT_BATCH]> = SmallVec::new();
        let mut cursor = self.l2.lru_tail();
        while let Some(idx) = cursor {
            if victims.len() >= L2_EVICT_BATCH {
                break;
            }
            let entry = self.l2.entry(idx);
            match registry.get(entry.vrange_id) {
                Some(range) => {
                    let page_index = range.page_index_of(entry.page_addr);
                    let v2h = range.v2h(page_index);
                    debug_assert!(v2h.in_l2());
                    // A page still materialized in L1 must not be demoted
                    // out from under its live mapping.
                    if !v2h.in_l1() {
                        victims.push(idx);
                    }
                }
                None => victims.push(idx),
            }
            cursor = self.l2.lru_prev(idx);
        }

        for &idx in &victims {
            let entry = *self.l2.entry(idx);
            if let Some(range) = registry.get(entry.vrange_id) {
                let page_index = range.page_index_of(entry.page_addr);
                let v2h = range.v2h(page_index);
                let dirty = v2h.dirty_l2();
                if dirty || !v2h.in_l3() {
                    self.l3.add_page(
                        self.l2.buffer(idx),
                        dirty,
                        &range,
                        page_index,
                        registry,
                        self.aio.as_mut(),
                    )?;
                }
                v2h.set_in_l2(false);
                v2h.set_dirty_l2(false);
            }
            self.l2.remove(idx);
        }
        Ok(victims.len())
    }
}

/// One self-contained shard of the hierarchy.
#[derive(Debug)]
pub struct TierInstance {
    index: u32,
    caches: Mutex<TierCaches>,
}

impl TierInstance {
    pub fn new(index: u32, caches: TierCaches) -> Self {
        Self {
            index,
            caches: Mutex::new(caches),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The instance lock. Held across an entire fault servicing.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, TierCaches> {
        self.caches.lock()
    }
}

/// The array of instances plus shard routing.
#[derive(Debug)]
pub struct TierGroup {
    tiers: Vec<TierInstance>,
}

impl TierGroup {
    pub fn new(tiers: Vec<TierInstance>) -> Self {
        debug_assert!(!tiers.is_empty());
        Self { tiers }
    }

    /// The instance serving the page at byte offset `addr_offset` from
    /// its range's base.
    #[inline]
    pub fn tier_for_offset(&self, addr_offset: u64) -> &TierInstance {
        let chunk = (addr_offset >> PAGE_BITS) >> CHUNK_BITS;
        &self.tiers[(chunk % self.tiers.len() as u64) as usize]
    }

    /// The instance serving page `page_index` of a range.
    #[inline]
    pub fn tier_for_page(&self, page_index: u64) -> &TierInstance {
        &self.tiers[((page_index >> CHUNK_BITS) % self.tiers.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TierInstance> {
        self.tiers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_of(n: u32) -> TierGroup {
        let dir = tempfile::tempdir().unwrap();
        let tiers = (0..n)
            .map(|i| {
                TierInstance::new(
                    i,
                    TierCaches {
                        l1: PageCache::new(&format!("t{i}-l1"), PAGE_SIZE as u64).unwrap(),
                        l2: RamCache::new(&format!("t{i}-l2"), PAGE_SIZE as u64).unwrap(),
                        l3: FlashCache::new(
                            &format!("t{i}-l3"),
                            &dir.path().join(format!("flash-{i}")),
                            PAGE_SIZE as u64,
                        )
                        .unwrap(),
                        aio: None,
                    },
                )
            })
            .collect();
        TierGroup::new(tiers)
    }

    #[test]
    fn chunks_route_round_robin() {
        let group = group_of(4);

        // Pages 0..16 share chunk 0; pages 16..32 are chunk 1, and so on.
        assert_eq!(group.tier_for_page(0).index(), 0);
        assert_eq!(group.tier_for_page(15).index(), 0);
        assert_eq!(group.tier_for_page(16).index(), 1);
        assert_eq!(group.tier_for_page(32).index(), 2);
        assert_eq!(group.tier_for_page(48).index(), 3);
        assert_eq!(group.tier_for_page(64).index(), 0);
    }

    #[test]
    fn offset_and_page_routing_agree() {
        let group = group_of(3);
        for page in 0..200u64 {
            let offset = page << PAGE_BITS;
            assert_eq!(
                group.tier_for_offset(offset).index(),
                group.tier_for_page(page).index(),
                "page {page}"
            );
        }
    }
}
