//! # Pinned Buffer Pool
//!
//! Pre-allocated, page-aligned buffers for everything that moves page
//! bytes between tiers: the RAM cache's data buffers and the flash
//! cache's scratch buffers for flash↔HDD traffic.
//!
//! ## Why one mapping
//!
//! The pool is a single anonymous mapping carved into `PAGE_SIZE` slices.
//! One mapping keeps every buffer aligned for direct I/O, costs one
//! `mlock` call to pin, and hands the fault path fixed buffer indices so
//! no allocation ever happens while a page fault is being serviced.
//!
//! ## Pinning
//!
//! Buffers are `mlock`ed so servicing a fault never takes a nested major
//! fault on its own scratch memory. Containerized environments routinely
//! cap `RLIMIT_MEMLOCK` below useful cache sizes; a failed pin degrades to
//! a warning rather than refusing to start.

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::PAGE_SIZE;

/// Fixed array of page-sized, page-aligned buffers addressed by index.
#[derive(Debug)]
pub struct PinnedPool {
    region: MmapMut,
    buf_count: u32,
}

impl PinnedPool {
    /// Maps and pins `buf_count` page buffers.
    pub fn new(name: &str, buf_count: u32) -> Result<Self> {
        ensure!(buf_count > 0, "pool '{name}' needs at least one buffer");

        let len = buf_count as usize * PAGE_SIZE;
        let region = MmapMut::map_anon(len)
            .wrap_err_with(|| format!("pool '{name}': failed to map {len} bytes"))?;

        // SAFETY: the region pointer and length come from the live mapping
        // above; mlock does not move or alias memory.
        let rc = unsafe { libc::mlock(region.as_ptr() as *const libc::c_void, len) };
        if rc != 0 {
            tracing::warn!(
                name,
                len,
                errno = std::io::Error::last_os_error().raw_os_error(),
                "failed to pin buffer pool; continuing unpinned"
            );
        }

        Ok(Self { region, buf_count })
    }

    #[inline]
    pub fn buf_count(&self) -> u32 {
        self.buf_count
    }

    /// The buffer at `index`.
    #[inline]
    pub fn buf(&self, index: u32) -> &[u8] {
        assert!(index < self.buf_count, "buffer index {index} out of range");
        let offset = index as usize * PAGE_SIZE;
        &self.region[offset..offset + PAGE_SIZE]
    }

    /// The buffer at `index`, writable.
    #[inline]
    pub fn buf_mut(&mut self, index: u32) -> &mut [u8] {
        assert!(index < self.buf_count, "buffer index {index} out of range");
        let offset = index as usize * PAGE_SIZE;
        &mut self.region[offset..offset + PAGE_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_page_aligned_and_distinct() {
        let mut pool = PinnedPool::new("test", 4).unwrap();

        for i in 0..4 {
            let ptr = pool.buf(i).as_ptr() as usize;
            assert_eq!(ptr % PAGE_SIZE, 0, "buffer {i} misaligned");
        }

        pool.buf_mut(1).fill(0xAA);
        pool.buf_mut(2).fill(0xBB);

        assert!(pool.buf(0).iter().all(|&b| b == 0));
        assert!(pool.buf(1).iter().all(|&b| b == 0xAA));
        assert!(pool.buf(2).iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn zero_buffers_is_an_error() {
        assert!(PinnedPool::new("empty", 0).is_err());
    }
}
