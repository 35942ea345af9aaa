//! # Tiermem Configuration Constants
//!
//! This module centralizes all configuration constants, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_BITS (12)
//!       │
//!       ├─> PAGE_SIZE (derived: 1 << PAGE_BITS)
//!       │
//!       ├─> PAGE_MASK (derived: !(PAGE_SIZE - 1))
//!       │
//!       └─> CHUNK_BITS (4)
//!             2^CHUNK_BITS consecutive pages form one chunk, the unit of
//!             round-robin spreading of a virtual range across tier
//!             instances. Also sizes the flash cache's aux buffer pool.
//!
//! FLASH_SLOT_BITS (24)
//!       │
//!       └─> A V2H record stores the flash slot in 24 bits, so one tier's
//!           flash file is capped at 2^24 pages (64 GiB at 4 KiB pages).
//!
//! BITMAP_BITS (12)            PAT leaf bitmaps cover 2^12 slots each
//! PTE_BITS (12)               PST leaf nodes cover 2^12 slots each
//!       These two must stay equal to keep the PAT and PST trees
//!       structurally parallel over the same slot array.
//!
//! RANGE_ID_BITS (8)
//!       │
//!       └─> INVALID_RANGE_ID (0xFF); usable ids are 0..=254
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `PAGE_SIZE == 1 << PAGE_BITS` (derived correctly)
//! 2. `BITMAP_BITS == PTE_BITS` (PAT and PST stay parallel)
//! 3. `MAX_RANGES > INVALID_RANGE_ID as usize` (the id pool can hold every
//!    usable id)

/// Log2 of the page size. All offset arithmetic in the crate uses this
/// shift rather than division.
pub const PAGE_BITS: u32 = 12;

/// Size of one page in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Mask that rounds an address down to its page base.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Log2 of the chunk size in pages. 2^4 = 16 consecutive pages form one
/// chunk; chunks are the unit of round-robin assignment of virtual pages
/// to tier instances, and size the flash↔HDD aux buffer pool.
pub const CHUNK_BITS: u32 = 4;

/// Width of the flash-slot field inside a packed V2H record.
pub const FLASH_SLOT_BITS: u32 = 24;

/// Number of bits in a PAT leaf bitmap: each leaf covers 2^12 flash slots.
pub const BITMAP_BITS: u32 = 12;

/// Number of slots covered by one PST leaf node.
pub const PTE_BITS: u32 = 12;

/// Reserved range id meaning "no range".
pub const INVALID_RANGE_ID: u8 = 0xFF;

/// Capacity of the range registry's slot pool. Usable id space is
/// `0..=254` regardless; the pool is sized so an id always indexes it
/// directly.
pub const MAX_RANGES: usize = 1024;

/// Upper bound on tier instances per group.
pub const MAX_TIERS: u32 = 128;

/// Entries handed from L1 to L2 per eviction round.
pub const L1_EVICT_BATCH: usize = 10;

/// Entries pushed from L2 toward L3 per eviction round.
pub const L2_EVICT_BATCH: usize = 16;

/// Flash slots reclaimed per L3 eviction round.
pub const L3_EVICT_BATCH: u32 = 16;

/// Ceiling on outstanding kernel-AIO requests per tier.
pub const MAX_OUTSTANDING_AIO: usize = 2048;

/// Per-batch timeout for asynchronous flash→HDD migration.
pub const AIO_BATCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

const _: () = assert!(PAGE_SIZE == 1 << PAGE_BITS, "PAGE_SIZE derivation mismatch");

const _: () = assert!(
    BITMAP_BITS == PTE_BITS,
    "PAT and PST leaves must cover the same slot span"
);

const _: () = assert!(
    MAX_RANGES > INVALID_RANGE_ID as usize,
    "range pool must be indexable by every usable id"
);

const _: () = assert!(
    L1_EVICT_BATCH >= 1 && L2_EVICT_BATCH >= 1 && L3_EVICT_BATCH >= 1,
    "eviction must always make progress"
);

/// Rounds a byte size up to the next page boundary.
#[inline]
pub const fn round_up_to_page(size: u64) -> u64 {
    (size + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Rounds a byte size down to a whole number of mebibytes.
#[inline]
pub const fn round_down_to_mib(size: u64) -> u64 {
    (size >> 20) << 20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_constants_agree() {
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(0x12345usize & PAGE_MASK, 0x12000);
    }

    #[test]
    fn round_up_to_page_boundary_cases() {
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(1), PAGE_SIZE as u64);
        assert_eq!(round_up_to_page(PAGE_SIZE as u64), PAGE_SIZE as u64);
        assert_eq!(round_up_to_page(PAGE_SIZE as u64 + 1), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn round_down_to_mib_truncates() {
        assert_eq!(round_down_to_mib(50 << 20), 50 << 20);
        assert_eq!(round_down_to_mib((50 << 20) + 4095), 50 << 20);
        assert_eq!(round_down_to_mib((1 << 20) - 1), 0);
    }
}
