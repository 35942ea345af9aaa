//! # Slot Tables
//!
//! The two hierarchical tables a flash cache keeps over its slot array:
//!
//! - [`alloc`]: the page allocation table (PAT), which slots are free
//! - [`stats`]: the page stats table (PST), how hot each slot is
//!
//! Both decompose a slot index into the same MSB→LSB bit fields
//! (`pgd | pmd | leaf`), so a slot's position in one table maps directly
//! to its position in the other. The PAT answers "give me `k` free slots"
//! without scanning; the PST answers "give me the `k` coldest slots"
//! without scanning. Together they drive flash eviction.

pub mod alloc;
pub mod stats;

pub use alloc::PageAllocTable;
pub use stats::PageStatsTable;
