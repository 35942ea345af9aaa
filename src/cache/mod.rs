//! # Cache Tiers
//!
//! The three storage layers a page moves through, hottest first:
//!
//! ```text
//! L1  page cache   materialized pages the OS is currently backing
//! L2  RAM cache    pinned in-memory copies of demoted pages
//! L3  flash cache  slots in a direct-I/O flash file
//!  ↓
//! HDD backing file (canonical bytes, mapped ranges only)
//! ```
//!
//! Each struct here is a passive container: it owns its entries, buffers,
//! and bookkeeping, and exposes primitive operations. The demotion
//! cascade that connects them (L1 overflow → L2, L2 overflow → L3, L3
//! overflow → backing file) is orchestrated by the tier instance, which
//! holds all three behind one mutex, so every cross-tier move is
//! transactional with respect to the fault handler.
//!
//! Dirty bits travel downward on demotion and are never dropped: a page
//! evicted from L1 carries `dirty_l1` into `dirty_l2`, and so on until the
//! bytes reach the backing file.

pub mod flash_cache;
pub mod page_cache;
pub mod ram_cache;

pub use flash_cache::FlashCache;
pub use page_cache::{L1Entry, PageCache};
pub use ram_cache::RamCache;
