//! # Page Allocation Table (PAT)
//!
//! Hierarchical free-slot allocator over a tier's flash file. The table is
//! a 1-, 2-, or 3-level tree:
//!
//! ```text
//! level 3:              pgd            per-child free counts
//!                     /  |  \
//! level 2:         pmd  pmd  pmd       per-child free counts
//!                 / | \
//! level 1:      bitmap bitmap ...      one bit per slot (1 = free)
//! ```
//!
//! Leaves are bitmaps of 2^12 bits. Level count follows the slot count:
//! one level when `N <= 2^12`, two when `N <= 2^16`, otherwise three with
//! the remaining bits split roughly evenly between pgd and pmd.
//!
//! A slot index decomposes into bit fields from MSB to LSB:
//! `| pgd | pmd | bitmap |`. Allocation walks the counters down, takes
//! find-first-set at the leaf, and composes the absolute index by OR-ing
//! the node offsets back together. Interior entries always equal the free
//! count of the child subtree; [`PageAllocTable::sanity_check`] validates
//! this along with `used + free == total`.
//!
//! Batch allocation prefers a single child that can satisfy the whole
//! request (keeping allocations clustered), and only otherwise accumulates
//! `min(child_free, remaining)` across children left to right.
//!
//! Not thread safe; the owning tier serializes access under its lock.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::collections::Bitmap;
use crate::config::BITMAP_BITS;

/// Per-node scratch list: (child index, pages taken from that child).
type ChildTake = SmallVec<[(u64, u64); 8]>;

/// One interior node: a free-page counter per child plus subtree totals.
#[derive(Debug)]
struct PatNode {
    entries: Vec<u64>,
    free_pages: u64,
    used_pages: u64,
    total_pages: u64,
}

impl PatNode {
    fn init(number_entries: u64, max_per_entry: u64, total_pages: u64) -> Self {
        debug_assert!(max_per_entry * (number_entries - 1) < total_pages);
        debug_assert!(total_pages <= max_per_entry * number_entries);

        let mut entries = Vec::with_capacity(number_entries as usize);
        let mut remain = total_pages;
        for _ in 0..number_entries {
            let take = remain.min(max_per_entry);
            entries.push(take);
            remain -= take;
        }
        Self {
            entries,
            free_pages: total_pages,
            used_pages: 0,
            total_pages,
        }
    }

    /// Reserves `wanted` free pages from this node's children. The chosen
    /// children and their contributions land in `taken`.
    fn get_pages(&mut self, wanted: u64, taken: &mut ChildTake) -> Result<()> {
        if wanted == 0 {
            return Ok(());
        }
        ensure!(
            wanted <= self.free_pages,
            "cannot reserve {} pages from {} available",
            wanted,
            self.free_pages
        );

        // First-match: a single child that satisfies the whole request.
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if *entry >= wanted {
                *entry -= wanted;
                taken.push((i as u64, wanted));
                self.free_pages -= wanted;
                self.used_pages += wanted;
                return Ok(());
            }
        }

        // Otherwise accumulate across children left to right.
        let mut remain = wanted;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if remain == 0 {
                break;
            }
            if *entry > 0 {
                let take = (*entry).min(remain);
                *entry -= take;
                taken.push((i as u64, take));
                remain -= take;
            }
        }
        debug_assert_eq!(remain, 0);
        self.free_pages -= wanted;
        self.used_pages += wanted;
        Ok(())
    }

    fn release_pages(&mut self, child_index: u64, pages: u64) {
        self.entries[child_index as usize] += pages;
        self.free_pages += pages;
        self.used_pages -= pages;
        debug_assert_eq!(self.free_pages + self.used_pages, self.total_pages);
    }
}

/// Free-slot allocator over `N` flash slots.
#[derive(Debug)]
pub struct PageAllocTable {
    name: String,

    levels: u32,
    pmd_bits: u32,
    bitmap_bits: u32,
    pgd_mask: u64,
    pmd_mask: u64,
    bitmap_mask: u64,

    pgd: Option<PatNode>,
    pmds: Vec<PatNode>,
    bitmaps: Vec<Bitmap>,

    total_pages: u64,
    used_pages: u64,
    free_pages: u64,
}

impl PageAllocTable {
    /// Builds the table over `total_pages` slots, all initially free.
    pub fn new(name: &str, total_pages: u64) -> Result<Self> {
        ensure!(total_pages > 0, "PAT '{name}' needs at least one slot");

        let mut total_bits = 0u32;
        let mut i = total_pages - 1;
        while i > 0 {
            total_bits += 1;
            i >>= 1;
        }

        let (levels, pgd_bits, pmd_bits, bitmap_bits) = if total_bits <= BITMAP_BITS {
            (1, 0, 0, total_bits)
        } else if total_bits <= BITMAP_BITS + 4 {
            (2, total_bits - BITMAP_BITS, 0, BITMAP_BITS)
        } else {
            let pgd = (total_bits - BITMAP_BITS) / 2;
            (3, pgd, total_bits - pgd - BITMAP_BITS, BITMAP_BITS)
        };
        tracing::debug!(
            name,
            total_pages,
            levels,
            "PAT layout {pgd_bits}-{pmd_bits}-{bitmap_bits}"
        );

        let pages_per_bitmap = 1u64 << BITMAP_BITS;
        let number_bitmaps = total_pages.div_ceil(pages_per_bitmap);
        let mut bitmaps = Vec::with_capacity(number_bitmaps as usize);
        for _ in 0..number_bitmaps {
            let mut map = Bitmap::new(pages_per_bitmap);
            map.set_all();
            bitmaps.push(map);
        }
        // The final bitmap may cover slots past the end; mask them out so
        // they can never be handed out.
        let tail = total_pages % pages_per_bitmap;
        if tail != 0 {
            let last = bitmaps.last_mut().expect("at least one bitmap");
            for pos in tail + 1..=pages_per_bitmap {
                last.clear(pos);
            }
        }

        let (pgd, pmds) = match levels {
            1 => (None, Vec::new()),
            2 => {
                let pgd = PatNode::init(number_bitmaps, pages_per_bitmap, total_pages);
                (Some(pgd), Vec::new())
            }
            _ => {
                let entries_per_pmd = 1u64 << pmd_bits;
                let number_pmds = number_bitmaps.div_ceil(entries_per_pmd);
                let max_pages_per_pmd = entries_per_pmd * pages_per_bitmap;
                let pgd = PatNode::init(number_pmds, max_pages_per_pmd, total_pages);

                let mut pmds = Vec::with_capacity(number_pmds as usize);
                let mut remain_entries = number_bitmaps;
                let mut remain_pages = total_pages;
                for _ in 0..number_pmds {
                    let entries = remain_entries.min(entries_per_pmd);
                    let pages = remain_pages.min(max_pages_per_pmd);
                    pmds.push(PatNode::init(entries, pages_per_bitmap, pages));
                    remain_entries -= entries;
                    remain_pages -= pages;
                }
                (Some(pgd), pmds)
            }
        };

        let table = Self {
            name: name.to_string(),
            levels,
            pmd_bits,
            bitmap_bits,
            pgd_mask: (1u64 << pgd_bits) - 1,
            pmd_mask: (1u64 << pmd_bits) - 1,
            bitmap_mask: (1u64 << bitmap_bits) - 1,
            pgd,
            pmds,
            bitmaps,
            total_pages,
            used_pages: 0,
            free_pages: total_pages,
        };
        table.sanity_check()?;
        Ok(table)
    }

    /// Allocates `wanted` free slots, appending their indices to `out`.
    /// Fails without side effects when fewer than `wanted` slots are free.
    pub fn allocate(&mut self, wanted: u64, out: &mut Vec<u64>) -> Result<()> {
        if self.free_pages < wanted {
            bail!(
                "PAT '{}': want {} slots, only {} free",
                self.name,
                wanted,
                self.free_pages
            );
        }

        match self.levels {
            1 => {
                for _ in 0..wanted {
                    let pos = self.bitmaps[0].ffs_toggle();
                    debug_assert!(pos > 0, "counter says free but bitmap is empty");
                    out.push(pos - 1);
                }
            }
            2 => {
                let mut taken = ChildTake::new();
                self.pgd
                    .as_mut()
                    .expect("2-level PAT has a pgd")
                    .get_pages(wanted, &mut taken)?;
                for &(bitmap_index, count) in &taken {
                    let map = &mut self.bitmaps[bitmap_index as usize];
                    for _ in 0..count {
                        let pos = map.ffs_toggle();
                        debug_assert!(pos > 0);
                        out.push((bitmap_index << self.bitmap_bits) | (pos - 1));
                    }
                }
            }
            _ => {
                let mut pmd_taken = ChildTake::new();
                self.pgd
                    .as_mut()
                    .expect("3-level PAT has a pgd")
                    .get_pages(wanted, &mut pmd_taken)?;
                for &(pmd_index, from_pmd) in &pmd_taken {
                    let mut bitmap_taken = ChildTake::new();
                    self.pmds[pmd_index as usize].get_pages(from_pmd, &mut bitmap_taken)?;
                    for &(offset_in_pmd, count) in &bitmap_taken {
                        let bitmap_index = (pmd_index << self.pmd_bits) | offset_in_pmd;
                        let map = &mut self.bitmaps[bitmap_index as usize];
                        for _ in 0..count {
                            let pos = map.ffs_toggle();
                            ensure!(
                                pos > 0,
                                "PAT '{}': pmd[{}] promised {} slots in bitmap {} but it ran dry",
                                self.name,
                                pmd_index,
                                count,
                                bitmap_index
                            );
                            out.push(
                                (pmd_index << (self.pmd_bits + self.bitmap_bits))
                                    | (offset_in_pmd << self.bitmap_bits)
                                    | (pos - 1),
                            );
                        }
                    }
                }
            }
        }

        self.free_pages -= wanted;
        self.used_pages += wanted;
        Ok(())
    }

    /// Grabs one free slot.
    pub fn allocate_one(&mut self) -> Option<u64> {
        if self.free_pages == 0 {
            return None;
        }
        let mut out = Vec::with_capacity(1);
        self.allocate(1, &mut out).ok()?;
        Some(out[0])
    }

    /// Returns a slot to the table. Panics on double free: the callers
    /// own the slot lifecycle, and a stray free means the F2V map and the
    /// table have diverged.
    pub fn free(&mut self, slot: u64) {
        assert!(slot < self.total_pages, "slot {slot} out of range");
        let offset_in_bitmap = slot & self.bitmap_mask;
        let bitmap_index = (slot >> self.bitmap_bits) as usize;

        let map = &mut self.bitmaps[bitmap_index];
        assert!(
            !map.get(offset_in_bitmap + 1),
            "PAT '{}': slot {} freed twice",
            self.name,
            slot
        );
        map.set(offset_in_bitmap + 1);

        match self.levels {
            1 => {}
            2 => {
                self.pgd
                    .as_mut()
                    .expect("2-level PAT has a pgd")
                    .release_pages(bitmap_index as u64, 1);
            }
            _ => {
                let pgd_offset = (slot >> (self.bitmap_bits + self.pmd_bits)) & self.pgd_mask;
                let pmd_offset = (slot >> self.bitmap_bits) & self.pmd_mask;
                self.pmds[pgd_offset as usize].release_pages(pmd_offset, 1);
                self.pgd
                    .as_mut()
                    .expect("3-level PAT has a pgd")
                    .release_pages(pgd_offset, 1);
            }
        }
        self.free_pages += 1;
        self.used_pages -= 1;
    }

    /// Whether `slot` is currently free.
    pub fn is_free(&self, slot: u64) -> bool {
        assert!(slot < self.total_pages, "slot {slot} out of range");
        let offset_in_bitmap = slot & self.bitmap_mask;
        let bitmap_index = (slot >> self.bitmap_bits) as usize;
        self.bitmaps[bitmap_index].get(offset_in_bitmap + 1)
    }

    pub fn used_pages(&self) -> u64 {
        self.used_pages
    }

    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Validates the tree: every interior entry equals the popcount of its
    /// subtree's bitmaps, and `used + free == total`.
    pub fn sanity_check(&self) -> Result<()> {
        ensure!(
            self.used_pages + self.free_pages == self.total_pages,
            "PAT '{}': used {} + free {} != total {}",
            self.name,
            self.used_pages,
            self.free_pages,
            self.total_pages
        );

        match self.levels {
            1 => {
                ensure!(
                    self.bitmaps[0].count_set() == self.free_pages,
                    "PAT '{}': bitmap popcount disagrees with free counter",
                    self.name
                );
            }
            2 => {
                let pgd = self.pgd.as_ref().expect("2-level PAT has a pgd");
                ensure!(pgd.entries.len() == self.bitmaps.len());
                let mut sum = 0;
                for (i, map) in self.bitmaps.iter().enumerate() {
                    let set = map.count_set();
                    ensure!(
                        pgd.entries[i] == set,
                        "PAT '{}': pgd[{}] = {} but bitmap has {} free",
                        self.name,
                        i,
                        pgd.entries[i],
                        set
                    );
                    sum += set;
                }
                ensure!(sum == pgd.free_pages);
            }
            _ => {
                let pgd = self.pgd.as_ref().expect("3-level PAT has a pgd");
                ensure!(pgd.entries.len() == self.pmds.len());
                let (mut sum_free, mut sum_used, mut sum_total) = (0, 0, 0);
                for (i, pmd) in self.pmds.iter().enumerate() {
                    ensure!(
                        pgd.entries[i] == pmd.free_pages,
                        "PAT '{}': pgd[{}] = {} but pmd holds {} free",
                        self.name,
                        i,
                        pgd.entries[i],
                        pmd.free_pages
                    );
                    sum_free += pmd.free_pages;
                    sum_used += pmd.used_pages;
                    sum_total += pmd.total_pages;
                }
                ensure!(sum_free == pgd.free_pages);
                ensure!(sum_used == pgd.used_pages);
                ensure!(sum_total == pgd.total_pages);

                for (i, pmd) in self.pmds.iter().enumerate() {
                    let start_bitmap = (i as u64) << self.pmd_bits;
                    let mut set_bits = 0;
                    for j in 0..(1u64 << self.pmd_bits) {
                        match self.bitmaps.get((start_bitmap + j) as usize) {
                            Some(map) => set_bits += map.count_set(),
                            None => break,
                        }
                    }
                    ensure!(
                        pmd.free_pages == set_bits,
                        "PAT '{}': pmd[{}] counter {} != bitmap popcount {}",
                        self.name,
                        i,
                        pmd.free_pages,
                        set_bits
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_table_exhausts_and_refills() {
        let mut pat = PageAllocTable::new("small", 17).unwrap();
        assert_eq!(pat.free_pages(), 17);

        let mut slots = Vec::new();
        for _ in 0..17 {
            let slot = pat.allocate_one().expect("slot available");
            assert!(slot < 17);
            slots.push(slot);
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 17);

        assert!(pat.allocate_one().is_none());
        pat.sanity_check().unwrap();

        for slot in &slots {
            pat.free(*slot);
        }
        assert_eq!(pat.free_pages(), 17);

        for _ in 0..17 {
            assert!(pat.allocate_one().is_some());
        }
        assert!(pat.allocate_one().is_none());
    }

    #[test]
    fn two_level_batch_allocation_spans_bitmaps() {
        // 5000 slots: 12 bits is not enough, so two levels with a partial
        // second bitmap of 904 slots.
        let mut pat = PageAllocTable::new("two-level", 5000).unwrap();

        let mut out = Vec::new();
        pat.allocate(4500, &mut out).unwrap();
        assert_eq!(out.len(), 4500);
        assert_eq!(pat.free_pages(), 500);
        pat.sanity_check().unwrap();

        let mut seen = out.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4500);
        assert!(*seen.last().unwrap() < 5000);

        assert!(pat.allocate(501, &mut Vec::new()).is_err());

        for slot in out {
            pat.free(slot);
        }
        assert_eq!(pat.free_pages(), 5000);
        pat.sanity_check().unwrap();
    }

    #[test]
    fn three_level_round_trip() {
        // Forces three levels with partial pmd and bitmap tails.
        let total = (1u64 << 17) + 4096 + 5;
        let mut pat = PageAllocTable::new("three-level", total).unwrap();

        let mut out = Vec::new();
        pat.allocate(total, &mut out).unwrap();
        assert_eq!(out.len() as u64, total);
        assert!(pat.allocate_one().is_none());
        pat.sanity_check().unwrap();

        let mut seen = out.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len() as u64, total);

        for slot in out {
            pat.free(slot);
        }
        assert_eq!(pat.free_pages(), total);
        assert_eq!(pat.used_pages(), 0);
        pat.sanity_check().unwrap();
    }

    #[test]
    fn is_free_tracks_allocation() {
        let mut pat = PageAllocTable::new("track", 64).unwrap();
        let slot = pat.allocate_one().unwrap();

        assert!(!pat.is_free(slot));
        pat.free(slot);
        assert!(pat.is_free(slot));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let mut pat = PageAllocTable::new("double", 8).unwrap();
        let slot = pat.allocate_one().unwrap();
        pat.free(slot);
        pat.free(slot);
    }
}
