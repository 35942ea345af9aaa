//! # Page Stats Table (PST)
//!
//! Access-frequency recorder over a tier's flash slots, structurally
//! parallel to the allocation table: one-byte counters per slot at the
//! leaves (PTE nodes), 16-bit aggregates per child at the PMD and PGD
//! levels. An interior entry is the sum of access counts of every slot
//! beneath it, so "coldest region" lookup is one minimum scan per level
//! instead of a sweep over all `N` slots.
//!
//! ## Decay
//!
//! Counters saturate by halving: when adding `delta` to an entry would
//! overflow its width, every entry in that node is right-shifted by one
//! bit first. Relative ordering inside the node survives, absolute counts
//! fade: an approximate LFU with bounded memory.
//!
//! ## Compensation
//!
//! When the slot count is not a multiple of a subtree's capacity, the last
//! PMD/PGD entry aggregates fewer slots than its siblings and would win
//! every "coldest" comparison by default. Such an entry carries a
//! multiplier (full capacity / actual capacity) applied only while
//! ranking, never stored back.
//!
//! Not thread safe; the owning tier serializes access under its lock.

use eyre::{ensure, Result};

use crate::config::PTE_BITS;

trait Counter: Copy {
    const LIMIT: u64;
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

impl Counter for u8 {
    const LIMIT: u64 = u8::MAX as u64;
    fn to_u64(self) -> u64 {
        self as u64
    }
    fn from_u64(v: u64) -> Self {
        v as u8
    }
}

impl Counter for u16 {
    const LIMIT: u64 = u16::MAX as u64;
    fn to_u64(self) -> u64 {
        self as u64
    }
    fn from_u64(v: u64) -> Self {
        v as u16
    }
}

/// One node of the table: a counter per child (or per slot at a leaf).
#[derive(Debug)]
struct StatsNode<T: Counter> {
    entries: Vec<T>,
    // Multiplier applied to the last entry while ranking when it covers a
    // partially-filled subtree.
    last_entry_compensation: Option<f64>,
}

impl<T: Counter> StatsNode<T> {
    fn new(number_entries: u64) -> Self {
        Self {
            entries: vec![T::from_u64(0); number_entries as usize],
            last_entry_compensation: None,
        }
    }

    fn increase(&mut self, index: usize, delta: u64) {
        debug_assert!(delta <= T::LIMIT);
        while self.entries[index].to_u64() + delta > T::LIMIT {
            self.shift_right();
        }
        let v = self.entries[index].to_u64() + delta;
        self.entries[index] = T::from_u64(v);
    }

    fn shift_right(&mut self) {
        for entry in &mut self.entries {
            *entry = T::from_u64(entry.to_u64() >> 1);
        }
    }

    fn value(&self, index: usize) -> u64 {
        self.entries[index].to_u64()
    }

    /// Index of the minimum entry, with compensation applied to a
    /// partially-filled last entry. Ties resolve to the earliest index.
    fn min_entry_index(&self) -> usize {
        let n = self.entries.len();
        if n == 1 {
            return 0;
        }
        let mut min_index = 0;
        let mut min_value = T::LIMIT;
        for (i, entry) in self.entries[..n - 1].iter().enumerate() {
            if entry.to_u64() < min_value {
                min_value = entry.to_u64();
                min_index = i;
            }
        }
        let mut last_value = self.entries[n - 1].to_u64();
        if let Some(comp) = self.last_entry_compensation {
            last_value = T::LIMIT.min((comp * last_value as f64) as u64);
        }
        if min_value > last_value {
            min_index = n - 1;
        }
        min_index
    }

    /// Positions of the `wanted` smallest entries, ascending by value.
    fn smallest_positions(&self, wanted: usize, positions: &mut Vec<usize>) {
        let mut ranked: Vec<(u64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.to_u64(), i))
            .collect();
        ranked.sort_unstable();
        positions.clear();
        positions.extend(ranked.iter().take(wanted).map(|&(_, i)| i));
    }
}

/// Access-frequency table over `N` flash slots.
#[derive(Debug)]
pub struct PageStatsTable {
    name: String,

    pmd_bits: u32,
    pte_bits: u32,
    pmd_mask: u64,
    pte_mask: u64,

    pgd: StatsNode<u16>,
    pmds: Vec<StatsNode<u16>>,
    ptes: Vec<StatsNode<u8>>,

    total_pages: u64,
}

impl PageStatsTable {
    /// Builds the table over `total_pages` slots, all counters zero.
    pub fn new(name: &str, total_pages: u64) -> Result<Self> {
        ensure!(total_pages > 0, "PST '{name}' needs at least one slot");

        let mut total_bits = 0u32;
        let mut i = total_pages - 1;
        while i > 0 {
            total_bits += 1;
            i >>= 1;
        }
        let pte_bits = PTE_BITS;
        let pmd_bits = if total_bits > pte_bits {
            (total_bits - pte_bits) / 2
        } else {
            0
        };

        let entries_per_pte = 1u64 << pte_bits;
        let number_ptes = total_pages.div_ceil(entries_per_pte);
        let mut ptes = Vec::with_capacity(number_ptes as usize);
        let mut remain = total_pages;
        for _ in 0..number_ptes {
            let entries = remain.min(entries_per_pte);
            ptes.push(StatsNode::<u8>::new(entries));
            remain -= entries;
        }

        let entries_per_pmd = 1u64 << pmd_bits;
        let number_pmds = number_ptes.div_ceil(entries_per_pmd);
        let mut pmds = Vec::with_capacity(number_pmds as usize);
        let mut remain = number_ptes;
        for _ in 0..number_pmds {
            let entries = remain.min(entries_per_pmd);
            pmds.push(StatsNode::<u16>::new(entries));
            remain -= entries;
        }

        let mut pgd = StatsNode::<u16>::new(number_pmds);

        // A trailing partial PTE node under-counts relative to full
        // siblings; the partial fill propagates to the PGD level too.
        if total_pages % entries_per_pte != 0 {
            let pages_at_last = total_pages % entries_per_pte;
            let comp = entries_per_pte as f64 / pages_at_last as f64;
            pmds.last_mut()
                .expect("at least one pmd node")
                .last_entry_compensation = Some(comp);
            tracing::debug!(name, comp, "PST last pmd entry compensation");
        }
        let pages_per_full_pmd = 1u64 << (pte_bits + pmd_bits);
        if total_pages % pages_per_full_pmd != 0 {
            let pages_at_last = total_pages % pages_per_full_pmd;
            let comp = pages_per_full_pmd as f64 / pages_at_last as f64;
            pgd.last_entry_compensation = Some(comp);
            tracing::debug!(name, comp, "PST pgd last entry compensation");
        }

        Ok(Self {
            name: name.to_string(),
            pmd_bits,
            pte_bits,
            pmd_mask: (1u64 << pmd_bits) - 1,
            pte_mask: (1u64 << pte_bits) - 1,
            pgd,
            pmds,
            ptes,
            total_pages,
        })
    }

    /// Adds `delta` to the slot's counter, propagating the same add (with
    /// the same overflow-decay rule) to the PMD and PGD aggregates.
    pub fn increment(&mut self, slot: u64, delta: u32) {
        assert!(slot < self.total_pages, "slot {slot} out of range");
        let pte_node = (slot >> self.pte_bits) as usize;
        let offset_in_pte = (slot & self.pte_mask) as usize;
        self.ptes[pte_node].increase(offset_in_pte, delta as u64);

        let pmd_node = (slot >> (self.pte_bits + self.pmd_bits)) as usize;
        let offset_in_pmd = ((slot >> self.pte_bits) & self.pmd_mask) as usize;
        self.pmds[pmd_node].increase(offset_in_pmd, delta as u64);

        self.pgd.increase(pmd_node, delta as u64);
    }

    /// The slot's leaf counter.
    pub fn access_count(&self, slot: u64) -> u64 {
        assert!(slot < self.total_pages, "slot {slot} out of range");
        let pte_node = (slot >> self.pte_bits) as usize;
        self.ptes[pte_node].value((slot & self.pte_mask) as usize)
    }

    /// Aggregate count of the PMD entry enclosing the slot.
    pub fn pmd_access_count(&self, slot: u64) -> u64 {
        assert!(slot < self.total_pages, "slot {slot} out of range");
        let pmd_node = (slot >> (self.pte_bits + self.pmd_bits)) as usize;
        self.pmds[pmd_node].value(((slot >> self.pte_bits) & self.pmd_mask) as usize)
    }

    /// Aggregate count of the PGD entry enclosing the slot.
    pub fn pgd_access_count(&self, slot: u64) -> u64 {
        assert!(slot < self.total_pages, "slot {slot} out of range");
        let pmd_node = (slot >> (self.pte_bits + self.pmd_bits)) as usize;
        self.pgd.value(pmd_node)
    }

    /// Reports up to `wanted` coldest slots into `out` and bumps each
    /// reported slot's counter by one so an immediate repeat query does
    /// not return the same set. Returns the number reported (less than
    /// `wanted` only when the chosen leaf is a smaller trailing node).
    pub fn coldest(&mut self, wanted: usize, out: &mut Vec<u64>) -> usize {
        let pmd_node = self.pgd.min_entry_index();
        let rel_pte = self.pmds[pmd_node].min_entry_index();
        let pte_node = (pmd_node << self.pmd_bits) | rel_pte;

        let leaf = &self.ptes[pte_node];
        let report = wanted.min(leaf.entries.len());
        let mut positions = Vec::with_capacity(report);
        leaf.smallest_positions(report, &mut positions);

        out.clear();
        for &pos in &positions {
            out.push(((pte_node as u64) << self.pte_bits) | pos as u64);
            self.ptes[pte_node].increase(pos, 1);
            self.pmds[pmd_node].increase(rel_pte, 1);
            self.pgd.increase(pmd_node, 1);
        }
        report
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_propagate_to_all_levels() {
        let mut pst = PageStatsTable::new("propagate", 3 * 4096).unwrap();

        pst.increment(0, 3);
        pst.increment(1, 2);
        pst.increment(4096, 7);

        assert_eq!(pst.access_count(0), 3);
        assert_eq!(pst.access_count(1), 2);
        assert_eq!(pst.access_count(4096), 7);
        assert_eq!(pst.pmd_access_count(0), 5);
        assert_eq!(pst.pmd_access_count(4096), 7);
        assert_eq!(pst.pgd_access_count(0), 12);
    }

    #[test]
    fn coldest_returns_least_touched_slots() {
        let mut pst = PageStatsTable::new("coldest", 256).unwrap();

        // Heat everything except slots 10, 11, 12.
        for slot in 0..256u64 {
            if !(10..=12).contains(&slot) {
                pst.increment(slot, 5);
            }
        }

        let mut out = Vec::new();
        let n = pst.coldest(3, &mut out);
        assert_eq!(n, 3);
        out.sort_unstable();
        assert_eq!(out, vec![10, 11, 12]);

        // Reported slots were bumped: the next query must move on.
        for slot in 10..=12u64 {
            assert_eq!(pst.access_count(slot), 1);
        }
    }

    #[test]
    fn leaf_overflow_halves_whole_node() {
        let mut pst = PageStatsTable::new("decay", 64).unwrap();
        pst.increment(2, 100);
        pst.increment(3, 200);

        // 200 + 100 would overflow the u8 counter, so the node halves
        // once before the add.
        pst.increment(3, 100);

        assert_eq!(pst.access_count(2), 50);
        assert_eq!(pst.access_count(3), 200);
    }

    #[test]
    fn compensation_protects_partial_tail() {
        // 4096 + 16 slots: the second PTE node has 16 slots, so raw sums
        // would make it look permanently cold.
        let mut pst = PageStatsTable::new("partial", 4096 + 16).unwrap();

        // Touch the tail slots twice each; leave the full node at one
        // touch per slot. Raw pmd sums: 4096 vs 32, but compensated the
        // tail reads as 32 * 256 = 8192, so the full node is colder.
        for slot in 0..4096u64 {
            pst.increment(slot, 1);
        }
        for slot in 4096..4112u64 {
            pst.increment(slot, 2);
        }

        let mut out = Vec::new();
        pst.coldest(4, &mut out);
        assert!(out.iter().all(|&slot| slot < 4096));
    }

    #[test]
    fn single_node_table_degenerates_cleanly() {
        let mut pst = PageStatsTable::new("tiny", 8).unwrap();
        pst.increment(5, 1);

        let mut out = Vec::new();
        // Asking for more than the leaf holds clamps to the leaf size.
        let n = pst.coldest(16, &mut out);
        assert_eq!(n, 8);
        assert!(!out.contains(&5) || out.len() == 8);
    }
}
