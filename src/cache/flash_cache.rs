//! # Flash Cache (L3)
//!
//! The bottom cache tier: a raw, pre-truncated flash file of `N` page
//! slots plus the metadata to run it. Pages overflowing the RAM cache
//! land here; pages evicted from here either die (clean, or re-readable
//! from the backing file) or migrate their dirty bytes down to the owning
//! range's backing file.
//!
//! ## Owned state
//!
//! - the direct-I/O slot file (`flashcache-<group>-<index>`, no header,
//!   truncated at startup, so flash contents never persist across runs)
//! - `F2V`: reverse map from slot to `(range id, page offset)`
//! - the [PAT](crate::table::PageAllocTable): which slots are free
//! - the [PST](crate::table::PageStatsTable): how hot each slot is
//! - a pinned pool of `2^CHUNK_BITS` scratch buffers for flash↔HDD moves
//!
//! ## Eviction
//!
//! When the PAT runs dry, the PST nominates the coldest slots. Slots
//! holding dirty pages whose range has a backing file migrate first
//! (§ flash→HDD below); every nominated slot is then freed and its
//! page's metadata downgraded. A page whose newer copy sits dirty above
//! this tier (L1 or L2) is never written out from here; the upper tier
//! owns that write-back obligation.
//!
//! ## Flash → HDD migration
//!
//! Each migrating slot is a read-from-flash followed by a write-to-HDD
//! through an aux buffer. With the AIO engine available and ≥ 2×batch
//! free request slots, the batch goes out as chained async pairs (the
//! write submits when its read's completion arrives), reaped in one poll
//! loop with a two-second ceiling; on timeout the batch logs and
//! proceeds. Without the engine the same moves run inline.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use eyre::{bail, ensure, Result, WrapErr};

use crate::aio::{AioCompletion, AioManager, IoDirection};
use crate::config::{
    round_up_to_page, CHUNK_BITS, FLASH_SLOT_BITS, INVALID_RANGE_ID, L3_EVICT_BATCH,
    AIO_BATCH_TIMEOUT, PAGE_BITS, PAGE_SIZE,
};
use crate::memory::PinnedPool;
use crate::vrange::{RangeRegistry, VRange};

/// Packed reverse-map entry: which virtual page occupies a flash slot.
///
/// Layout: bits 24..32 hold the range id, bits 0..24 the page offset
/// within the range. An id of 0xFF marks the slot free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct F2vEntry(u32);

impl F2vEntry {
    const OFFSET_MASK: u32 = (1 << FLASH_SLOT_BITS) - 1;

    #[inline]
    pub fn invalid() -> Self {
        Self((INVALID_RANGE_ID as u32) << FLASH_SLOT_BITS)
    }

    #[inline]
    pub fn new(vrange_id: u8, page_offset: u64) -> Self {
        debug_assert!(page_offset < 1 << FLASH_SLOT_BITS);
        Self(((vrange_id as u32) << FLASH_SLOT_BITS) | (page_offset as u32 & Self::OFFSET_MASK))
    }

    #[inline]
    pub fn vrange_id(self) -> u8 {
        (self.0 >> FLASH_SLOT_BITS) as u8
    }

    #[inline]
    pub fn page_offset(self) -> u64 {
        (self.0 & Self::OFFSET_MASK) as u64
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.vrange_id() != INVALID_RANGE_ID
    }
}

/// One slot's worth of pending flash→HDD work.
struct Migration {
    slot: u64,
    range: std::sync::Arc<VRange>,
    page_index: u64,
}

struct AsyncPending {
    aux: u32,
    write_handle: u32,
    write_submitted: bool,
    finished: bool,
}

/// The flash tier of one tier instance.
#[derive(Debug)]
pub struct FlashCache {
    name: String,
    file: File,
    total_slots: u64,
    f2v: Vec<F2vEntry>,
    pat: crate::table::PageAllocTable,
    pst: crate::table::PageStatsTable,
    aux: PinnedPool,
    aux_free: Vec<u32>,
    migrate_epoch: u32,
    migrated_pages: u64,
    max_migrate_latency: Duration,
    loads: u64,
}

impl FlashCache {
    /// Creates the slot file at `path` (truncating any previous contents)
    /// and builds the tables over its pages.
    pub fn new(name: &str, path: &Path, max_bytes: u64) -> Result<Self> {
        let total_slots = round_up_to_page(max_bytes) / PAGE_SIZE as u64;
        ensure!(total_slots > 0, "L3 '{name}' needs at least one slot");
        ensure!(
            total_slots <= 1 << FLASH_SLOT_BITS,
            "L3 '{name}': {total_slots} slots exceed the 24-bit slot space"
        );

        let file = crate::memory::open_direct(path, true, true)?;
        file.set_len(total_slots * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("failed to size flash file '{}'", path.display()))?;
        tracing::debug!(
            name,
            path = %path.display(),
            total_slots,
            "opened flash slot file"
        );

        let aux_count = 1u32 << CHUNK_BITS;
        Ok(Self {
            name: name.to_string(),
            file,
            total_slots,
            f2v: vec![F2vEntry::invalid(); total_slots as usize],
            pat: crate::table::PageAllocTable::new(&format!("{name}-pat"), total_slots)?,
            pst: crate::table::PageStatsTable::new(&format!("{name}-pst"), total_slots)?,
            aux: PinnedPool::new(&format!("{name}-aux"), aux_count)?,
            aux_free: (0..aux_count).rev().collect(),
            migrate_epoch: 0,
            migrated_pages: 0,
            max_migrate_latency: Duration::ZERO,
            loads: 0,
        })
    }

    /// Stores a page demoted from the RAM cache. Reuses the page's
    /// existing slot when one is assigned, else allocates (evicting a
    /// batch of cold slots first when the table is full). The slot file
    /// is written only when the page is new here or carries fresh bytes.
    pub fn add_page(
        &mut self,
        data: &[u8],
        dirty: bool,
        range: &VRange,
        page_index: u64,
        registry: &RangeRegistry,
        aio: Option<&mut AioManager>,
    ) -> Result<()> {
        ensure!(data.len() == PAGE_SIZE, "flash stores whole pages");
        ensure!(
            page_index < 1 << FLASH_SLOT_BITS,
            "page offset {page_index} exceeds the reverse map's 24-bit field"
        );
        let v2h = range.v2h(page_index);
        let snap = v2h.snapshot();

        let (slot, was_resident) = if snap.in_l3() {
            let slot = snap.flash_slot() as u64;
            let f2v = self.f2v[slot as usize];
            ensure!(
                f2v.vrange_id() == range.id() && f2v.page_offset() == page_index,
                "L3 '{}': slot {} reverse map {:?} disagrees with page {} of range {}",
                self.name,
                slot,
                f2v,
                page_index,
                range.id()
            );
            (slot, true)
        } else {
            let slot = match self.pat.allocate_one() {
                Some(slot) => slot,
                None => {
                    self.evict(L3_EVICT_BATCH, registry, aio)?;
                    match self.pat.allocate_one() {
                        Some(slot) => slot,
                        None => bail!(
                            "L3 '{}': no slot for page {} of range {} even after eviction",
                            self.name,
                            page_index,
                            range.id()
                        ),
                    }
                }
            };
            ensure!(
                !self.f2v[slot as usize].is_valid(),
                "L3 '{}': fresh slot {} already mapped to {:?}",
                self.name,
                slot,
                self.f2v[slot as usize]
            );
            (slot, false)
        };

        if !was_resident || dirty {
            self.file
                .write_all_at(data, slot << PAGE_BITS)
                .wrap_err_with(|| {
                    format!(
                        "L3 '{}': failed to write slot {} for page {} of range {}",
                        self.name,
                        slot,
                        page_index,
                        range.id()
                    )
                })?;
        }

        self.f2v[slot as usize] = F2vEntry::new(range.id(), page_index);
        v2h.set_in_l3(true);
        v2h.set_dirty_l3(dirty);
        v2h.set_flash_slot(slot as u32);
        self.pst.increment(slot, 1);
        Ok(())
    }

    /// Reads the page stored in `slot` into `dest`, verifying the reverse
    /// mapping first.
    pub fn load_page(
        &mut self,
        dest: &mut [u8],
        slot: u64,
        vrange_id: u8,
        page_index: u64,
    ) -> Result<()> {
        ensure!(dest.len() == PAGE_SIZE, "flash loads whole pages");
        let f2v = self.f2v[slot as usize];
        ensure!(
            f2v.vrange_id() == vrange_id && f2v.page_offset() == page_index,
            "L3 '{}': slot {} holds {:?}, not page {} of range {}",
            self.name,
            slot,
            f2v,
            page_index,
            vrange_id
        );

        self.file
            .read_exact_at(dest, slot << PAGE_BITS)
            .wrap_err_with(|| {
                format!(
                    "L3 '{}': failed to read slot {} for page {} of range {}",
                    self.name, slot, page_index, vrange_id
                )
            })?;
        self.pst.increment(slot, 1);
        self.loads += 1;
        Ok(())
    }

    /// Reads a page straight from the range's backing file into `dest`.
    pub fn load_from_backing(
        &self,
        range: &VRange,
        page_index: u64,
        dest: &mut [u8],
    ) -> Result<()> {
        let Some(backing) = range.backing() else {
            bail!(
                "L3 '{}': page {} of range {} marked on-disk but the range has no backing file",
                self.name,
                page_index,
                range.id()
            );
        };
        backing.read_page(page_index, dest)
    }

    /// Frees the `count` coldest slots, migrating dirty pages with a
    /// backing file first. Returns the number of slots reclaimed.
    pub fn evict(
        &mut self,
        count: u32,
        registry: &RangeRegistry,
        aio: Option<&mut AioManager>,
    ) -> Result<u32> {
        let mut coldest = Vec::with_capacity(count as usize);
        let reclaimed = self.pst.coldest(count as usize, &mut coldest);
        ensure!(reclaimed > 0, "L3 '{}': nothing to evict", self.name);

        // Eviction only runs with the table full, so every nominated slot
        // must be occupied.
        let mut to_migrate = Vec::new();
        for &slot in &coldest {
            let f2v = self.f2v[slot as usize];
            ensure!(
                f2v.is_valid(),
                "L3 '{}': coldest slot {} has no occupant",
                self.name,
                slot
            );
            let Some(range) = registry.get(f2v.vrange_id()) else {
                bail!(
                    "L3 '{}': slot {} maps to unregistered range {}",
                    self.name,
                    slot,
                    f2v.vrange_id()
                );
            };
            let snap = range.v2h(f2v.page_offset()).snapshot();
            if snap.dirty_l3() && range.backing().is_some() {
                to_migrate.push(Migration {
                    slot,
                    range,
                    page_index: f2v.page_offset(),
                });
            }
        }
        if !to_migrate.is_empty() {
            self.migrate_to_backing(&to_migrate, aio)?;
        }

        for &slot in &coldest {
            ensure!(
                !self.pat.is_free(slot),
                "L3 '{}': evicting slot {} twice",
                self.name,
                slot
            );
            let f2v = self.f2v[slot as usize];
            if let Some(range) = registry.get(f2v.vrange_id()) {
                let v2h = range.v2h(f2v.page_offset());
                v2h.set_in_l3(false);
                v2h.set_dirty_l3(false);
            }
            self.pat.free(slot);
            self.f2v[slot as usize] = F2vEntry::invalid();
        }
        tracing::debug!(name = %self.name, reclaimed, migrated = to_migrate.len(), "L3 eviction round");
        Ok(reclaimed as u32)
    }

    /// Moves dirty slots to their ranges' backing files. Pages whose
    /// newer copy sits dirty in L1 or L2 are skipped; the upper tier
    /// will write them back itself.
    fn migrate_to_backing(
        &mut self,
        candidates: &[Migration],
        aio: Option<&mut AioManager>,
    ) -> Result<u32> {
        let mut jobs = Vec::with_capacity(candidates.len());
        for migration in candidates {
            let snap = migration.range.v2h(migration.page_index).snapshot();
            if snap.dirty_l1() {
                // A write is in progress above; its eventual demotion
                // re-materializes the bytes.
                debug_assert!(snap.in_l1());
                continue;
            }
            if snap.dirty_l2() {
                debug_assert!(snap.in_l2());
                continue;
            }
            if snap.dirty_l3() && migration.range.backing().is_some() {
                jobs.push(migration);
            }
        }
        if jobs.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let use_async = matches!(&aio, Some(manager) if manager.free_requests() >= 2 * jobs.len());
        let migrated = if use_async {
            self.migrate_async(&jobs, aio.expect("checked above"))?
        } else {
            self.migrate_sync(&jobs)?
        };

        let latency = started.elapsed();
        if latency > self.max_migrate_latency {
            self.max_migrate_latency = latency;
        }
        self.migrated_pages += migrated as u64;
        Ok(migrated)
    }

    fn migrate_sync(&mut self, jobs: &[&Migration]) -> Result<u32> {
        for job in jobs {
            let aux = self
                .aux_free
                .pop()
                .expect("aux pool is sized to the eviction batch");
            let offset = job.slot << PAGE_BITS;
            let result = self
                .file
                .read_exact_at(self.aux.buf_mut(aux), offset)
                .wrap_err_with(|| {
                    format!(
                        "L3 '{}': failed to read slot {} for migration",
                        self.name, job.slot
                    )
                })
                .and_then(|()| {
                    job.range
                        .backing()
                        .expect("migration job has a backing file")
                        .write_page(job.page_index, self.aux.buf(aux))
                });
            self.aux_free.push(aux);
            result?;

            let v2h = job.range.v2h(job.page_index);
            v2h.set_dirty_l3(false);
            v2h.set_in_l3(false);
            v2h.set_on_disk(true);
        }
        Ok(jobs.len() as u32)
    }

    fn migrate_async(&mut self, jobs: &[&Migration], aio: &mut AioManager) -> Result<u32> {
        self.migrate_epoch += 1;
        let epoch = (self.migrate_epoch as u64) << 32;

        let mut pendings = Vec::with_capacity(jobs.len());
        let mut read_handles = Vec::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            let aux = self
                .aux_free
                .pop()
                .expect("aux pool is sized to the eviction batch");
            let read_handle = aio.get_request().expect("free slots checked by caller");
            let write_handle = aio.get_request().expect("free slots checked by caller");

            let buf = self.aux.buf_mut(aux).as_mut_ptr();
            aio.prepare(
                read_handle,
                self.file.as_raw_fd(),
                buf,
                PAGE_SIZE,
                job.slot << PAGE_BITS,
                IoDirection::Read,
                epoch | (2 * i) as u64,
            );
            let backing = job.range.backing().expect("migration job has a backing file");
            aio.prepare(
                write_handle,
                backing.raw_fd(),
                buf,
                PAGE_SIZE,
                backing.file_offset() + (job.page_index << PAGE_BITS),
                IoDirection::Write,
                epoch | (2 * i + 1) as u64,
            );
            read_handles.push(read_handle);
            pendings.push(AsyncPending {
                aux,
                write_handle,
                write_submitted: false,
                finished: false,
            });
        }
        aio.submit_batch(&read_handles)?;

        let deadline = Instant::now() + AIO_BATCH_TIMEOUT;
        let mut finished = 0usize;
        let mut events: Vec<AioCompletion> = Vec::with_capacity(2 * jobs.len());
        while finished < pendings.len() && Instant::now() < deadline {
            events.clear();
            aio.poll(2 * pendings.len(), &mut events)?;
            for event in &events {
                if event.token >> 32 != self.migrate_epoch as u64 {
                    // Straggler from an older, timed-out batch.
                    continue;
                }
                let sequence = (event.token & 0xffff_ffff) as usize;
                let index = sequence / 2;
                if sequence % 2 == 0 {
                    // Flash read done; chain the HDD write.
                    aio.submit(pendings[index].write_handle)?;
                    pendings[index].write_submitted = true;
                } else {
                    let job = jobs[index];
                    let v2h = job.range.v2h(job.page_index);
                    v2h.set_dirty_l3(false);
                    v2h.set_in_l3(false);
                    v2h.set_on_disk(true);
                    self.aux_free.push(pendings[index].aux);
                    pendings[index].finished = true;
                    finished += 1;
                }
            }
        }

        if finished < pendings.len() {
            // Unfinished requests may still complete; their aux buffers
            // stay out of the pool so a late DMA cannot land in reused
            // scratch memory.
            tracing::warn!(
                name = %self.name,
                finished,
                total = pendings.len(),
                "flash→HDD migration batch timed out"
            );
            for pending in &pendings {
                if !pending.finished && !pending.write_submitted {
                    aio.put_request(pending.write_handle);
                }
            }
        }
        Ok(finished as u32)
    }

    /// Drops every slot occupied by `range` without migrating. Callers
    /// write dirty pages back first when the range has a backing file.
    pub fn purge_range(&mut self, range: &VRange) -> usize {
        let mut purged = 0;
        for page_index in 0..range.page_count() {
            let v2h = range.v2h(page_index);
            let snap = v2h.snapshot();
            if !snap.in_l3() {
                continue;
            }
            let slot = snap.flash_slot() as u64;
            let f2v = self.f2v[slot as usize];
            // Pages routed to other tier instances carry their own slots
            // in those instances' tables.
            if f2v.vrange_id() != range.id() || f2v.page_offset() != page_index {
                continue;
            }
            self.pat.free(slot);
            self.f2v[slot as usize] = F2vEntry::invalid();
            v2h.set_in_l3(false);
            v2h.set_dirty_l3(false);
            purged += 1;
        }
        purged
    }

    /// Reads the slot currently assigned to a page into one of this
    /// tier's aux buffers and writes it to the range's backing file.
    /// Used by release-time write-back for pages whose only dirty copy
    /// is in flash.
    pub fn flush_slot_to_backing(&mut self, range: &VRange, page_index: u64) -> Result<()> {
        let v2h = range.v2h(page_index);
        let snap = v2h.snapshot();
        ensure!(snap.in_l3(), "page {page_index} has no flash copy");
        let slot = snap.flash_slot() as u64;

        let aux = self
            .aux_free
            .pop()
            .expect("aux pool is sized to the eviction batch");
        let result = self
            .file
            .read_exact_at(self.aux.buf_mut(aux), slot << PAGE_BITS)
            .wrap_err_with(|| {
                format!(
                    "L3 '{}': failed to read slot {slot} for write-back",
                    self.name
                )
            })
            .and_then(|()| {
                let Some(backing) = range.backing() else {
                    bail!("range {} has no backing file", range.id());
                };
                backing.write_page(page_index, self.aux.buf(aux))
            });
        self.aux_free.push(aux);
        result?;

        v2h.set_dirty_l3(false);
        v2h.set_on_disk(true);
        Ok(())
    }

    pub fn total_slots(&self) -> u64 {
        self.total_slots
    }

    pub fn used_slots(&self) -> u64 {
        self.pat.used_pages()
    }

    pub fn free_slots(&self) -> u64 {
        self.pat.free_pages()
    }

    pub fn loads(&self) -> u64 {
        self.loads
    }

    pub fn migrated_pages(&self) -> u64 {
        self.migrated_pages
    }

    pub fn max_migrate_latency(&self) -> Duration {
        self.max_migrate_latency
    }

    /// P3 validation: V2H and F2V agree in both directions for `range`.
    pub fn check_reverse_map(&self, range: &VRange) -> Result<()> {
        for page_index in 0..range.page_count() {
            let snap = range.v2h(page_index).snapshot();
            if snap.in_l3() {
                let f2v = self.f2v[snap.flash_slot() as usize];
                if f2v.vrange_id() == range.id() {
                    ensure!(
                        f2v.page_offset() == page_index,
                        "slot {} points at page {} but page {} points at the slot",
                        snap.flash_slot(),
                        f2v.page_offset(),
                        page_index
                    );
                }
            }
        }
        for (slot, f2v) in self.f2v.iter().enumerate() {
            if f2v.is_valid() && f2v.vrange_id() == range.id() {
                let snap = range.v2h(f2v.page_offset()).snapshot();
                ensure!(
                    snap.in_l3() && snap.flash_slot() as u64 == slot as u64,
                    "slot {} claims page {} of range {} but the page disagrees",
                    slot,
                    f2v.page_offset(),
                    range.id()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f2v_entry_packs_and_unpacks() {
        let entry = F2vEntry::new(7, 0x123456);
        assert_eq!(entry.vrange_id(), 7);
        assert_eq!(entry.page_offset(), 0x123456);
        assert!(entry.is_valid());

        assert!(!F2vEntry::invalid().is_valid());
    }

    #[test]
    fn add_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RangeRegistry::new();
        let range = registry.allocate((4 * PAGE_SIZE) as u64).unwrap();

        let mut l3 = FlashCache::new(
            "l3-test",
            &dir.path().join("flash.dat"),
            (8 * PAGE_SIZE) as u64,
        )
        .unwrap();

        let mut pool = PinnedPool::new("test-data", 2).unwrap();
        pool.buf_mut(0).fill(0x7E);
        l3.add_page(pool.buf(0), true, &range, 2, &registry, None)
            .unwrap();

        let snap = range.v2h(2).snapshot();
        assert!(snap.in_l3());
        assert!(snap.dirty_l3());
        assert_eq!(l3.used_slots(), 1);
        l3.check_reverse_map(&range).unwrap();

        let slot = snap.flash_slot() as u64;
        l3.load_page(pool.buf_mut(1), slot, range.id(), 2).unwrap();
        assert!(pool.buf(1).iter().all(|&b| b == 0x7E));
        assert_eq!(l3.loads(), 1);
    }

    #[test]
    fn clean_readd_reuses_slot_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RangeRegistry::new();
        let range = registry.allocate((2 * PAGE_SIZE) as u64).unwrap();

        let mut l3 = FlashCache::new(
            "l3-reuse",
            &dir.path().join("flash.dat"),
            (4 * PAGE_SIZE) as u64,
        )
        .unwrap();

        let mut pool = PinnedPool::new("test-data", 1).unwrap();
        pool.buf_mut(0).fill(0x11);
        l3.add_page(pool.buf(0), true, &range, 0, &registry, None)
            .unwrap();
        let slot = range.v2h(0).snapshot().flash_slot();

        // Clean re-add: same slot, no new allocation.
        l3.add_page(pool.buf(0), false, &range, 0, &registry, None)
            .unwrap();
        assert_eq!(range.v2h(0).snapshot().flash_slot(), slot);
        assert_eq!(l3.used_slots(), 1);
        assert!(!range.v2h(0).snapshot().dirty_l3());
    }

    #[test]
    fn eviction_migrates_dirty_pages_to_backing() {
        let dir = tempfile::tempdir().unwrap();
        let backing_path = dir.path().join("backing.dat");
        std::fs::write(&backing_path, vec![0u8; 8 * PAGE_SIZE]).unwrap();

        let registry = RangeRegistry::new();
        let range = registry
            .map(&backing_path, (8 * PAGE_SIZE) as u64, 0)
            .unwrap();

        // Two slots only: the third add must evict.
        let mut l3 = FlashCache::new(
            "l3-evict",
            &dir.path().join("flash.dat"),
            (2 * PAGE_SIZE) as u64,
        )
        .unwrap();

        let mut pool = PinnedPool::new("test-data", 1).unwrap();
        for page in 0..3u64 {
            pool.buf_mut(0).fill(0xA0 + page as u8);
            l3.add_page(pool.buf(0), true, &range, page, &registry, None)
                .unwrap();
        }

        // Both original slots were nominated; their dirty bytes must be
        // in the backing file now.
        let evicted: Vec<u64> = (0..2)
            .filter(|&p| !range.v2h(p).snapshot().in_l3())
            .collect();
        assert!(!evicted.is_empty());
        let mut check = PinnedPool::new("check", 1).unwrap();
        for &page in &evicted {
            assert!(range.v2h(page).snapshot().on_disk());
            range
                .backing()
                .unwrap()
                .read_page(page, check.buf_mut(0))
                .unwrap();
            assert!(check.buf(0).iter().all(|&b| b == 0xA0 + page as u8));
        }
        assert_eq!(l3.migrated_pages() as usize, evicted.len());
    }

    #[test]
    fn purge_range_frees_slots_without_migration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RangeRegistry::new();
        let range = registry.allocate((4 * PAGE_SIZE) as u64).unwrap();

        let mut l3 = FlashCache::new(
            "l3-purge",
            &dir.path().join("flash.dat"),
            (8 * PAGE_SIZE) as u64,
        )
        .unwrap();

        let mut pool = PinnedPool::new("test-data", 1).unwrap();
        for page in 0..3u64 {
            l3.add_page(pool.buf(0), true, &range, page, &registry, None)
                .unwrap();
        }
        assert_eq!(l3.used_slots(), 3);

        assert_eq!(l3.purge_range(&range), 3);
        assert_eq!(l3.used_slots(), 0);
        assert!(!range.v2h(0).snapshot().in_l3());
        l3.check_reverse_map(&range).unwrap();
    }
}
