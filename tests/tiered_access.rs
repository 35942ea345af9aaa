//! # End-to-End Tiered Access Tests
//!
//! These tests drive the whole hierarchy through the public API: real
//! SIGSEGV faults, real demotions, real files. The fault handler and the
//! group slot are process-wide, so every test serializes on one mutex
//! and tears its group down before releasing it.
//!
//! Covered here:
//!
//! 1. Write/read round-trip through demotion pressure: a tiny L1 forces
//!    every page through the cascade, and release persists dirty pages
//!    to the backing file.
//! 2. File-backed first reads: pages marked on-disk at map time are
//!    served straight from the file without consuming flash slots.
//! 3. An anonymous range sharded across four tiers with enough pressure
//!    to exercise the flash tier on the read path.

use std::sync::Mutex;

use tiermem::{GroupConfig, PAGE_SIZE};

static SERIAL: Mutex<()> = Mutex::new(());

fn serialize() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_u64(base: *mut u8, page: usize, value: u64) {
    // Volatile keeps the compiler from caching bytes the fault handler
    // materializes behind its back.
    unsafe { (base.add(page * PAGE_SIZE + 16) as *mut u64).write_volatile(value) }
}

fn read_u64(base: *mut u8, page: usize) -> u64 {
    unsafe { (base.add(page * PAGE_SIZE + 16) as *const u64).read_volatile() }
}

#[test]
fn demotion_write_read_roundtrip_persists_on_release() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("hdd.dat");

    let size: u64 = 50 << 20;
    let pages = (size as usize) / PAGE_SIZE;
    let file = std::fs::File::create(&backing).unwrap();
    file.set_len(size).unwrap();
    drop(file);

    tiermem::init(&GroupConfig {
        flash_dir: dir.path().to_path_buf(),
        group_name: "roundtrip".into(),
        l1_bytes: (16 * PAGE_SIZE) as u64,
        l2_bytes: 96 << 20,
        l3_bytes: size,
        tier_count: 1,
    })
    .unwrap();

    let base = tiermem::map(&backing, size, 0).unwrap();

    for page in 0..pages {
        write_u64(base, page, page as u64);
    }
    let after_writes = tiermem::stats().unwrap();
    assert!(
        after_writes.page_faults >= pages as u64,
        "every page must fault at least once during the write pass"
    );

    for page in 0..pages {
        assert_eq!(read_u64(base, page), page as u64, "page {page}");
    }
    let after_reads = tiermem::stats().unwrap();
    let refaults = after_reads.page_faults - after_writes.page_faults;
    // Every page not still materialized in L1 re-faults exactly once.
    assert!(
        refaults <= pages as u64,
        "read pass re-faulted {refaults} times for {pages} pages"
    );
    assert!(
        refaults >= (pages - 16) as u64,
        "read pass re-faulted only {refaults} times for {pages} pages"
    );

    // Release writes every dirty page back to the backing file.
    tiermem::free(base).unwrap();
    tiermem::release().unwrap();

    let data = std::fs::read(&backing).unwrap();
    for page in (0..pages).step_by(97) {
        let offset = page * PAGE_SIZE + 16;
        let value = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
        assert_eq!(value, page as u64, "backing file page {page}");
    }
}

#[test]
fn file_backed_first_reads_bypass_flash() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("prefilled.dat");

    let size: u64 = 8 << 20;
    let pages = (size as usize) / PAGE_SIZE;
    std::fs::write(&backing, vec![0xFFu8; size as usize]).unwrap();

    tiermem::init(&GroupConfig {
        flash_dir: dir.path().to_path_buf(),
        group_name: "prefilled".into(),
        l1_bytes: (16 * PAGE_SIZE) as u64,
        l2_bytes: 32 << 20,
        l3_bytes: 8 << 20,
        tier_count: 1,
    })
    .unwrap();

    let base = tiermem::map(&backing, size, 0).unwrap();

    for page in 0..pages {
        assert_eq!(read_u64(base, page), u64::MAX, "page {page}");
    }

    let stats = tiermem::stats().unwrap();
    assert_eq!(stats.page_faults, pages as u64);
    assert_eq!(stats.disk_hits, pages as u64);
    assert_eq!(stats.found_pages, pages as u64);
    // The data came straight from the file; no flash slot was spent.
    assert_eq!(stats.flash_used_slots, 0);

    tiermem::free(base).unwrap();
    tiermem::release().unwrap();
}

#[test]
fn anonymous_range_round_trips_across_four_tiers() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();

    tiermem::init(&GroupConfig {
        flash_dir: dir.path().to_path_buf(),
        group_name: "sharded".into(),
        l1_bytes: (8 * PAGE_SIZE) as u64,
        // Small enough that each tier's L2 overflows into flash.
        l2_bytes: 1 << 20,
        l3_bytes: 8 << 20,
        tier_count: 4,
    })
    .unwrap();

    let size: u64 = 4 << 20;
    let pages = (size as usize) / PAGE_SIZE;
    let base = tiermem::alloc(size).unwrap();

    for page in 0..pages {
        write_u64(base, page, (page as u64) * 31 + 7);
    }
    for page in 0..pages {
        assert_eq!(read_u64(base, page), (page as u64) * 31 + 7, "page {page}");
    }

    let stats = tiermem::stats().unwrap();
    assert!(
        stats.flash_used_slots > 0,
        "working set exceeds L2, flash must be in use"
    );
    assert!(stats.ram_hits + stats.flash_hits > 0);

    tiermem::free(base).unwrap();
    tiermem::release().unwrap();
}

#[test]
fn release_without_init_is_a_no_op() {
    let _guard = serialize();
    tiermem::release().unwrap();
    assert!(tiermem::stats().is_err());
}
