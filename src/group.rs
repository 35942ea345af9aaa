//! # Memory Group
//!
//! The process-wide bundle: the range registry, the tier instances, and
//! the fault/hit counters. [`crate::init`] builds exactly one of these
//! and parks it in the fault module's global slot; every fault, every
//! allocation, and the final teardown route through it.
//!
//! ## Fault servicing
//!
//! [`MemoryGroup::handle_fault`] is the whole materialization pipeline:
//!
//! 1. route the address to its range (interval lookup) and tier (chunk
//!    round-robin)
//! 2. under the tier lock, fast-path pages already in L1 (a write fault
//!    upgrades protection and marks the page dirty; a read fault is a
//!    benign race with a concurrent faulter and does nothing)
//! 3. otherwise make the page writable, populate it from the freshest
//!    copy (L2 buffer, flash slot, backing file, or the zero page) and
//!    downgrade to read-only for read faults
//! 4. insert into L1, which may cascade demotions all the way to the
//!    backing file
//!
//! The page is always mapped before its L1 insert, so a concurrent
//! faulter that observes `in_l1` can safely do nothing.
//!
//! ## Release
//!
//! Releasing a range detaches it from address lookup first (no new fault
//! can route to it), then per tier writes back every page whose freshest
//! dirty copy would otherwise be lost, purges the tiers of the range's
//! entries, and finally frees the id. The registry write lock is never
//! held while a tier lock is taken.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, eyre, Result, WrapErr};

use crate::aio::AioManager;
use crate::cache::{FlashCache, PageCache, RamCache};
use crate::config::{
    round_down_to_mib, CHUNK_BITS, MAX_OUTSTANDING_AIO, MAX_TIERS, PAGE_MASK, PAGE_SIZE,
};
use crate::memory::{set_protection, PageProtection};
use crate::tier::{TierCaches, TierGroup, TierInstance};
use crate::vrange::{RangeRegistry, VRange};

/// Boot parameters for the whole hierarchy.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Directory holding the per-tier flash files.
    pub flash_dir: PathBuf,
    /// Name embedded in the flash file names
    /// (`flashcache-<group_name>-<index>`).
    pub group_name: String,
    /// Total L1 budget in bytes, split across tiers.
    pub l1_bytes: u64,
    /// Total L2 budget in bytes, split across tiers.
    pub l2_bytes: u64,
    /// Total L3 budget in bytes, split across tiers; each tier's share is
    /// rounded down to a whole mebibyte.
    pub l3_bytes: u64,
    /// Number of tier instances.
    pub tier_count: u32,
}

/// Counters surfaced by [`crate::stats`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub page_faults: u64,
    pub ram_hits: u64,
    pub flash_hits: u64,
    pub disk_hits: u64,
    pub found_pages: u64,
    pub unfound_pages: u64,
    pub flash_used_slots: u64,
    pub flash_free_slots: u64,
}

#[derive(Debug, Default)]
struct FaultCounters {
    page_faults: AtomicU64,
    ram_hits: AtomicU64,
    flash_hits: AtomicU64,
    disk_hits: AtomicU64,
    unfound_pages: AtomicU64,
}

/// The process-wide hierarchy state.
#[derive(Debug)]
pub struct MemoryGroup {
    registry: RangeRegistry,
    tiers: TierGroup,
    counters: FaultCounters,
}

impl MemoryGroup {
    /// Builds every tier instance and its flash file. Configuration
    /// problems are fatal here, before the fault handler is installed.
    pub fn new(config: &GroupConfig) -> Result<Self> {
        ensure!(
            (1..=MAX_TIERS).contains(&config.tier_count),
            "tier count {} outside 1..={}",
            config.tier_count,
            MAX_TIERS
        );
        ensure!(
            config.flash_dir.is_dir(),
            "flash directory '{}' does not exist",
            config.flash_dir.display()
        );

        let n = config.tier_count as u64;
        let l1_share = config.l1_bytes / n;
        let l2_share = config.l2_bytes / n;
        let l3_share = round_down_to_mib(config.l3_bytes / n);
        ensure!(
            l3_share > 0,
            "flash budget {} splits to less than 1 MiB per tier",
            config.l3_bytes
        );

        let mut tiers = Vec::with_capacity(config.tier_count as usize);
        for index in 0..config.tier_count {
            let name = format!("{}-{index}", config.group_name);
            let flash_path = config
                .flash_dir
                .join(format!("flashcache-{}-{index}", config.group_name));

            let aio = match AioManager::new(MAX_OUTSTANDING_AIO) {
                Ok(manager) => Some(manager),
                Err(err) => {
                    tracing::warn!(tier = index, %err, "kernel AIO unavailable; running migrations synchronously");
                    None
                }
            };
            let caches = TierCaches {
                l1: PageCache::new(&format!("{name}-l1"), l1_share)?,
                l2: RamCache::new(&format!("{name}-l2"), l2_share)?,
                l3: FlashCache::new(&format!("{name}-l3"), &flash_path, l3_share)?,
                aio,
            };
            tiers.push(TierInstance::new(index, caches));
        }
        tracing::debug!(
            group = %config.group_name,
            tiers = config.tier_count,
            l1_share,
            l2_share,
            l3_share,
            "memory group initialized"
        );

        Ok(Self {
            registry: RangeRegistry::new(),
            tiers: TierGroup::new(tiers),
            counters: FaultCounters::default(),
        })
    }

    pub fn registry(&self) -> &RangeRegistry {
        &self.registry
    }

    /// Creates an anonymous range and returns its base.
    pub fn allocate(&self, size: u64) -> Result<*mut u8> {
        Ok(self.registry.allocate(size)?.base_ptr())
    }

    /// Creates a file-backed range and returns its base.
    pub fn map(&self, path: &Path, size: u64, file_offset: u64) -> Result<*mut u8> {
        Ok(self.registry.map(path, size, file_offset)?.base_ptr())
    }

    /// Services one access violation. Returns `false` when the address is
    /// not managed here; the caller re-raises the fault.
    pub fn handle_fault(&self, fault_addr: usize, is_write: bool) -> Result<bool> {
        self.counters.page_faults.fetch_add(1, Ordering::Relaxed);

        let Some(range) = self.registry.find_by_address(fault_addr) else {
            return Ok(false);
        };
        let page_addr = fault_addr & PAGE_MASK;
        let page_index = range.page_index_of(page_addr);
        let tier = self
            .tiers
            .tier_for_offset((fault_addr - range.base_addr()) as u64);
        let mut caches = tier.lock();

        let v2h = range.v2h(page_index);
        if v2h.in_l1() {
            if is_write {
                // Write fault on a page mapped read-only: upgrade.
                set_protection(page_addr as *mut u8, PAGE_SIZE, PageProtection::ReadWrite)?;
                v2h.set_dirty_l1(true);
            }
            // A read fault here means another thread materialized the
            // page between the trap and the lock. Nothing to do.
            return Ok(true);
        }

        // Make the page writable so it can be populated.
        set_protection(page_addr as *mut u8, PAGE_SIZE, PageProtection::ReadWrite)?;

        let snap = v2h.snapshot();
        // SAFETY: the page was just mapped read-write, and the tier lock
        // keeps every other mutator out.
        let dest = unsafe { range.page_bytes_mut(page_index) };
        if snap.in_l2() {
            let idx = caches
                .l2
                .lookup(page_addr)
                .ok_or_else(|| eyre!("page {page_index} marked in L2 but the index has no entry"))?;
            dest.copy_from_slice(caches.l2.buffer(idx));
            self.counters.ram_hits.fetch_add(1, Ordering::Relaxed);
        } else if snap.in_l3() {
            caches
                .l3
                .load_page(dest, snap.flash_slot() as u64, range.id(), page_index)?;
            self.counters.flash_hits.fetch_add(1, Ordering::Relaxed);
        } else if snap.on_disk() {
            caches.l3.load_from_backing(&range, page_index, dest)?;
            self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            // Brand-new page: the OS zero-fills it on first touch.
            self.counters.unfound_pages.fetch_add(1, Ordering::Relaxed);
        }

        if !is_write {
            set_protection(page_addr as *mut u8, PAGE_SIZE, PageProtection::Read)?;
        }

        caches.add_to_l1(&self.registry, &range, page_index, is_write)?;
        Ok(true)
    }

    /// Releases the range containing `addr`: write back, purge, free id.
    pub fn release_range(&self, addr: usize) -> Result<()> {
        let range = self.registry.detach_by_address(addr)?;
        self.flush_and_purge(&range)?;
        self.registry.free_id(range.id());
        tracing::debug!(id = range.id(), "released range");
        Ok(())
    }

    /// Persists every page of `range` whose freshest copy is dirty, then
    /// removes the range's entries from all tiers.
    fn flush_and_purge(&self, range: &VRange) -> Result<()> {
        let tier_count = self.tiers.len() as u64;
        for tier in self.tiers.iter() {
            let mut caches = tier.lock();

            if range.backing().is_some() {
                for page_index in 0..range.page_count() {
                    if (page_index >> CHUNK_BITS) % tier_count != tier.index() as u64 {
                        continue;
                    }
                    self.write_back_page(&mut caches, range, page_index)?;
                }
            }

            caches.l1.purge_range(range.id());
            caches.l2.purge_range(range.id());
            caches.l3.purge_range(range);
        }
        Ok(())
    }

    /// Writes the freshest dirty copy of one page to the backing file.
    /// Priority mirrors the tier order: a dirty L1 page supersedes a
    /// dirty L2 copy, which supersedes a dirty flash slot.
    fn write_back_page(
        &self,
        caches: &mut TierCaches,
        range: &VRange,
        page_index: u64,
    ) -> Result<()> {
        let v2h = range.v2h(page_index);
        let snap = v2h.snapshot();
        let backing = range.backing().expect("caller checked");

        if snap.dirty_l1() {
            // SAFETY: dirty_l1 implies the page is mapped; the tier lock
            // is held.
            let bytes = unsafe { range.page_bytes(page_index) };
            backing
                .write_page(page_index, bytes)
                .wrap_err_with(|| format!("release write-back of page {page_index} from L1"))?;
            v2h.set_dirty_l1(false);
            v2h.set_on_disk(true);
        } else if snap.dirty_l2() {
            let idx = caches
                .l2
                .peek(range.page_addr(page_index))
                .ok_or_else(|| eyre!("page {page_index} marked dirty in L2 but not indexed"))?;
            backing
                .write_page(page_index, caches.l2.buffer(idx))
                .wrap_err_with(|| format!("release write-back of page {page_index} from L2"))?;
            v2h.set_dirty_l2(false);
            v2h.set_on_disk(true);
        } else if snap.dirty_l3() {
            caches
                .l3
                .flush_slot_to_backing(range, page_index)
                .wrap_err_with(|| format!("release write-back of page {page_index} from L3"))?;
        }
        Ok(())
    }

    /// Releases every active range. Used by [`crate::release`] teardown.
    pub fn release_all(&self) -> Result<()> {
        for id in self.registry.active_ids() {
            if let Some(range) = self.registry.get(id) {
                self.registry.detach_by_address(range.base_addr()).ok();
                self.flush_and_purge(&range)?;
                self.registry.free_id(id);
            }
        }
        Ok(())
    }

    /// Point-in-time counter and occupancy snapshot.
    pub fn stats(&self) -> MemoryStats {
        let mut flash_used = 0;
        let mut flash_free = 0;
        for tier in self.tiers.iter() {
            let caches = tier.lock();
            flash_used += caches.l3.used_slots();
            flash_free += caches.l3.free_slots();
        }
        let ram_hits = self.counters.ram_hits.load(Ordering::Relaxed);
        let flash_hits = self.counters.flash_hits.load(Ordering::Relaxed);
        let disk_hits = self.counters.disk_hits.load(Ordering::Relaxed);
        MemoryStats {
            page_faults: self.counters.page_faults.load(Ordering::Relaxed),
            ram_hits,
            flash_hits,
            disk_hits,
            found_pages: ram_hits + flash_hits + disk_hits,
            unfound_pages: self.counters.unfound_pages.load(Ordering::Relaxed),
            flash_used_slots: flash_used,
            flash_free_slots: flash_free,
        }
    }
}
