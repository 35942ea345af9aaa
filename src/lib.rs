//! # Tiermem - User-Space Hybrid Memory
//!
//! Tiermem extends a process's effective address space beyond physical
//! RAM by spilling cold pages through a RAM-resident cache down to an
//! SSD-backed cache, and ultimately to an optional HDD file that owns the
//! canonical bytes. Applications allocate a virtual range, touch it like
//! ordinary memory, and the page-fault handler materializes pages from
//! whichever tier holds the freshest copy.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tiermem::GroupConfig;
//!
//! tiermem::init(&GroupConfig {
//!     flash_dir: "/ssd/cache".into(),
//!     group_name: "worker".into(),
//!     l1_bytes: 64 << 20,
//!     l2_bytes: 256 << 20,
//!     l3_bytes: 4 << 30,
//!     tier_count: 4,
//! })?;
//!
//! let base = tiermem::map("/data/huge.dat", 2 << 30, 0)?;
//! // Loads and stores through `base` fault pages in transparently.
//!
//! tiermem::free(base)?;
//! tiermem::release()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Application loads/stores (raw memory)  │
//! ├──────────────────────────────────────────┤
//! │   SIGSEGV Fault Handler (fault)          │
//! ├──────────────────────────────────────────┤
//! │   Range Registry + Interval Tree (vrange)│
//! ├──────────────────────────────────────────┤
//! │   Tier Group / chunk round-robin (tier)  │
//! ├────────────┬────────────┬────────────────┤
//! │ L1 page    │ L2 RAM     │ L3 flash cache │
//! │ cache      │ cache      │ (PAT+PST+F2V)  │
//! ├────────────┴────────────┴────────────────┤
//! │   Backing HDD file (canonical bytes)     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! On a fault: locate the range, route the page to its tier instance,
//! populate from L2 / flash / the backing file, adjust protection, and
//! enqueue in L1. Demotion is eager: L1 overflow pushes to L2, L2
//! overflow to flash, and flash eviction migrates dirty pages to the
//! backing file, dirty bits carried downward at every step.
//!
//! ## Module Overview
//!
//! - [`collections`]: bitmap, free list, LRU list, interval tree
//! - [`table`]: hierarchical slot tables (allocation + access stats)
//! - [`memory`]: pinned buffer pools, protection, direct I/O opens
//! - [`vrange`]: ranges, packed per-page metadata, the registry
//! - [`cache`]: the three tiers
//! - [`aio`]: batched kernel AIO for flash↔HDD migration
//! - [`tier`]: instances, the group, the demotion cascade
//! - [`fault`]: SIGSEGV installation and dispatch
//! - [`group`]: the process-wide bundle behind the public API
//!
//! ## Guarantees and Limits
//!
//! - Nothing in the flash files persists across restarts; they are
//!   truncated at [`init`].
//! - One active group per process (all threads share one SIGSEGV
//!   disposition).
//! - Cached pages are private to the process; concurrent writers to a
//!   backing file are out of contract.
//! - Reads and writes after [`free`] are undefined by contract.

pub mod aio;
pub mod cache;
pub mod collections;
pub mod config;
pub mod fault;
pub mod group;
pub mod memory;
pub mod table;
pub mod tier;
pub mod vrange;

use std::path::Path;

use eyre::{eyre, Result};

pub use config::constants::{CHUNK_BITS, PAGE_BITS, PAGE_SIZE};
pub use group::{GroupConfig, MemoryStats};

/// Boots the hierarchy and installs the fault handler. Exactly one group
/// may be active per process.
pub fn init(config: &GroupConfig) -> Result<()> {
    let group = std::sync::Arc::new(group::MemoryGroup::new(config)?);
    fault::activate(group)
}

/// Allocates an anonymous range of at least `size` bytes and returns its
/// page-aligned base. Pages materialize (zero-filled) on first touch.
pub fn alloc(size: u64) -> Result<*mut u8> {
    active()?.allocate(size)
}

/// Maps a window of `file` starting at byte `file_offset` as a range.
/// The file is the canonical store: pre-existing bytes are served on
/// first read, and dirty pages migrate back to it under pressure.
pub fn map<P: AsRef<Path>>(file: P, size: u64, file_offset: u64) -> Result<*mut u8> {
    active()?.map(file.as_ref(), size, file_offset)
}

/// Releases the range containing `addr`, writing dirty pages back to the
/// backing file first.
pub fn free(addr: *mut u8) -> Result<()> {
    active()?.release_range(addr as usize)
}

/// Tears down the whole group: releases every range and restores the
/// previous SIGSEGV disposition.
pub fn release() -> Result<()> {
    match fault::deactivate() {
        Some(group) => group.release_all(),
        None => Ok(()),
    }
}

/// Counter and flash-occupancy snapshot of the active group.
pub fn stats() -> Result<MemoryStats> {
    Ok(active()?.stats())
}

fn active() -> Result<std::sync::Arc<group::MemoryGroup>> {
    fault::active_group().ok_or_else(|| eyre!("no hybrid memory group is active; call init first"))
}
