//! # Three-Level PAT Stress
//!
//! Drains and refills a three-level allocation table slot by slot,
//! re-validating the counter/bitmap invariants every million operations.
//! The odd slot count exercises the partial trailing bitmap, the partial
//! trailing PMD node, and the partial PGD entry at once.

use tiermem::table::PageAllocTable;

const TOTAL: u64 = (3 << 20) | (4 << 12) | 5;
const CHECK_EVERY: u64 = 1_000_000;

#[test]
fn drain_refill_drain_with_periodic_sanity() {
    let mut pat = PageAllocTable::new("stress", TOTAL).unwrap();
    assert_eq!(pat.free_pages(), TOTAL);

    let mut ops: u64 = 0;
    let check = |pat: &PageAllocTable, ops: u64| {
        if ops % CHECK_EVERY == 0 {
            pat.sanity_check().unwrap();
        }
    };

    let mut slots = Vec::with_capacity(TOTAL as usize);
    for _ in 0..TOTAL {
        let slot = pat.allocate_one().expect("table not yet full");
        slots.push(slot);
        ops += 1;
        check(&pat, ops);
    }
    assert!(pat.allocate_one().is_none());
    assert_eq!(pat.used_pages(), TOTAL);
    pat.sanity_check().unwrap();

    // Every slot handed out exactly once.
    let mut seen = slots.clone();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len() as u64, TOTAL);
    assert_eq!(*seen.last().unwrap(), TOTAL - 1);

    for &slot in &slots {
        pat.free(slot);
        ops += 1;
        check(&pat, ops);
    }
    assert_eq!(pat.free_pages(), TOTAL);
    assert_eq!(pat.used_pages(), 0);
    pat.sanity_check().unwrap();

    for _ in 0..TOTAL {
        assert!(pat.allocate_one().is_some());
        ops += 1;
        check(&pat, ops);
    }
    assert!(pat.allocate_one().is_none());
    pat.sanity_check().unwrap();
}
