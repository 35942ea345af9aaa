//! # Virtual Address Ranges
//!
//! A `VRange` is one contiguous window of virtual address space managed by
//! the hierarchy. The application receives the base pointer from
//! [`crate::alloc`] or [`crate::map`] and uses it like ordinary memory;
//! every page starts inaccessible, and the first touch of a page raises
//! the fault that materializes it.
//!
//! ## Anatomy
//!
//! ```text
//! VRange
//! ├── anonymous mapping, page-aligned, initially PROT_NONE
//! ├── V2H array: one packed record per page (see v2h module)
//! └── optional backing file: (fd, byte offset); page k of the range
//!     corresponds to file offset `file_offset + k * PAGE_SIZE`
//! ```
//!
//! ## Registry
//!
//! The `RangeRegistry` owns every active range: a slot pool indexed by the
//! one-byte range id (0xFF reserved as "invalid"), plus an interval tree
//! that maps a faulting address to its range. The registry carries its own
//! reader-writer lock: the fault handler only ever reads it; allocation
//! and release write it. The write lock is never held while a tier lock is
//! taken, which keeps the handler/teardown lock order acyclic.
//!
//! ## Invariants
//!
//! - at most one active range per id; ids are `0..=254`
//! - the interval tree contains exactly the active ranges
//! - two active ranges never overlap

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::collections::IntervalTree;
use crate::config::{round_up_to_page, INVALID_RANGE_ID, PAGE_BITS, PAGE_SIZE};
use crate::memory::open_direct;

mod v2h;

pub use v2h::{V2hRecord, V2hSnapshot};

/// The backing HDD file of a mapped range. The file is the authoritative
/// store: pages demoted out of the flash tier land here.
#[derive(Debug)]
pub struct Backing {
    file: File,
    file_offset: u64,
    path: PathBuf,
}

impl Backing {
    /// Reads the page at `page_index` of the owning range into `dest`.
    pub fn read_page(&self, page_index: u64, dest: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dest.len(), PAGE_SIZE);
        let offset = self.file_offset + (page_index << PAGE_BITS);
        self.file
            .read_exact_at(dest, offset)
            .wrap_err_with(|| {
                format!(
                    "failed to read page {page_index} at offset {offset} from '{}'",
                    self.path.display()
                )
            })
    }

    /// Writes `src` as the page at `page_index` of the owning range.
    pub fn write_page(&self, page_index: u64, src: &[u8]) -> Result<()> {
        debug_assert_eq!(src.len(), PAGE_SIZE);
        let offset = self.file_offset + (page_index << PAGE_BITS);
        self.file
            .write_all_at(src, offset)
            .wrap_err_with(|| {
                format!(
                    "failed to write page {page_index} at offset {offset} to '{}'",
                    self.path.display()
                )
            })
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw descriptor for asynchronous submission.
    pub fn raw_fd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }
}

/// One registered virtual-address range and its per-page metadata.
#[derive(Debug)]
pub struct VRange {
    id: u8,
    // Kept alive for the mapping's lifetime; all access goes through
    // `base` because the handler works from raw fault addresses.
    _mapping: MmapMut,
    base: *mut u8,
    size: u64,
    pages: u64,
    v2h: Box<[V2hRecord]>,
    backing: Option<Backing>,
}

// SAFETY: `base` points into `_mapping`, which lives exactly as long as
// the VRange. Page bytes are only touched under the owning tier's lock
// (or by the application, which the protection bits police), and the V2H
// records are atomics.
unsafe impl Send for VRange {}
unsafe impl Sync for VRange {}

impl VRange {
    fn new_anonymous(id: u8, size: u64) -> Result<Self> {
        let size = round_up_to_page(size);
        ensure!(
            size >= PAGE_SIZE as u64,
            "range size {size} is smaller than one page"
        );

        let mut mapping = MmapMut::map_anon(size as usize)
            .wrap_err_with(|| format!("failed to reserve {size} bytes for range {id}"))?;
        let base = mapping.as_mut_ptr();
        crate::memory::set_protection(base, size as usize, crate::memory::PageProtection::None)?;

        let pages = size >> PAGE_BITS;
        let v2h: Box<[V2hRecord]> = (0..pages).map(|_| V2hRecord::new()).collect();
        // Pin the metadata: the handler reads it on every fault.
        // SAFETY: the box's allocation is live and exactly this large.
        let rc = unsafe {
            libc::mlock(
                v2h.as_ptr() as *const libc::c_void,
                pages as usize * std::mem::size_of::<V2hRecord>(),
            )
        };
        if rc != 0 {
            tracing::warn!(id, pages, "failed to pin V2H array; continuing unpinned");
        }

        tracing::debug!(id, base = ?base, size, pages, "created anonymous range");
        Ok(Self {
            id,
            _mapping: mapping,
            base,
            size,
            pages,
            v2h,
            backing: None,
        })
    }

    fn new_mapped(id: u8, size: u64, path: &Path, file_offset: u64) -> Result<Self> {
        ensure!(
            file_offset % PAGE_SIZE as u64 == 0,
            "file offset {file_offset} is not page aligned"
        );
        let metadata = std::fs::metadata(path)
            .wrap_err_with(|| format!("failed to stat backing file '{}'", path.display()))?;
        ensure!(
            metadata.is_file(),
            "backing path '{}' is not a regular file",
            path.display()
        );

        let mut range = Self::new_anonymous(id, size)?;

        let file = open_direct(path, false, false)?;
        let old_len = metadata.len();
        let needed = file_offset + range.size;
        if needed > old_len {
            tracing::warn!(
                path = %path.display(),
                old_len,
                needed,
                "backing file shorter than mapped window; extending"
            );
            file.set_len(needed)
                .wrap_err_with(|| format!("failed to extend '{}'", path.display()))?;
        }

        // Pages that lay within the file's pre-existing size already have
        // canonical bytes on disk; first reads come straight from the file.
        if old_len > file_offset {
            let covered = (old_len - file_offset).div_ceil(PAGE_SIZE as u64);
            let covered = covered.min(range.pages);
            for page in 0..covered {
                range.v2h[page as usize].set_on_disk(true);
            }
            tracing::debug!(id, covered, "marked pre-existing file pages on-disk");
        }

        range.backing = Some(Backing {
            file,
            file_offset,
            path: path.to_path_buf(),
        });
        Ok(range)
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Base of the range as an address.
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    /// Base of the range as a pointer, handed to the application.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Byte length (page-rounded).
    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn page_count(&self) -> u64 {
        self.pages
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr < self.base_addr() + self.size as usize
    }

    /// Page index of a page-aligned address inside this range.
    #[inline]
    pub fn page_index_of(&self, page_addr: usize) -> u64 {
        debug_assert!(self.contains(page_addr));
        ((page_addr - self.base_addr()) >> PAGE_BITS) as u64
    }

    /// Address of the page at `page_index`.
    #[inline]
    pub fn page_addr(&self, page_index: u64) -> usize {
        debug_assert!(page_index < self.pages);
        self.base_addr() + (page_index << PAGE_BITS) as usize
    }

    /// The V2H record of the page at `page_index`.
    #[inline]
    pub fn v2h(&self, page_index: u64) -> &V2hRecord {
        &self.v2h[page_index as usize]
    }

    #[inline]
    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    /// Bytes of a materialized page.
    ///
    /// # Safety
    ///
    /// The page must currently be readable (`in_l1`) and the caller must
    /// hold the owning tier's lock so no concurrent protection change or
    /// demotion can invalidate the view.
    #[inline]
    pub unsafe fn page_bytes(&self, page_index: u64) -> &[u8] {
        std::slice::from_raw_parts(self.page_addr(page_index) as *const u8, PAGE_SIZE)
    }

    /// Writable bytes of a materialized page; same contract as
    /// [`VRange::page_bytes`] plus write access.
    ///
    /// # Safety
    ///
    /// See [`VRange::page_bytes`]; the page must be mapped writable.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_bytes_mut(&self, page_index: u64) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.page_addr(page_index) as *mut u8, PAGE_SIZE)
    }
}

/// Registry of active ranges: id slots plus the address-interval index.
#[derive(Debug)]
pub struct RangeRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    slots: Vec<Option<Arc<VRange>>>,
    tree: IntervalTree<u8>,
    active: u32,
}

impl RangeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                slots: (0..INVALID_RANGE_ID as usize).map(|_| None).collect(),
                tree: IntervalTree::new(),
                active: 0,
            }),
        }
    }

    /// Creates an anonymous range of at least `size` bytes.
    pub fn allocate(&self, size: u64) -> Result<Arc<VRange>> {
        self.install(|id| VRange::new_anonymous(id, size))
    }

    /// Creates a range backed by `path` starting at `file_offset`.
    pub fn map(&self, path: &Path, size: u64, file_offset: u64) -> Result<Arc<VRange>> {
        self.install(|id| VRange::new_mapped(id, size, path, file_offset))
    }

    fn install<F>(&self, build: F) -> Result<Arc<VRange>>
    where
        F: FnOnce(u8) -> Result<VRange>,
    {
        let mut inner = self.inner.write();
        let Some(id) = inner.slots.iter().position(|s| s.is_none()) else {
            bail!("all {} range ids are in use", INVALID_RANGE_ID);
        };

        let range = Arc::new(build(id as u8)?);
        let inserted = inner
            .tree
            .insert(range.base_addr(), range.len() as usize, id as u8);
        debug_assert!(inserted, "fresh mapping overlapped an active range");
        inner.slots[id] = Some(Arc::clone(&range));
        inner.active += 1;
        Ok(range)
    }

    /// The range containing `addr`, if any.
    pub fn find_by_address(&self, addr: usize) -> Option<Arc<VRange>> {
        let inner = self.inner.read();
        let id = inner.tree.find(addr)?;
        inner.slots[id as usize].clone()
    }

    /// Direct lookup by id.
    pub fn get(&self, id: u8) -> Option<Arc<VRange>> {
        if id == INVALID_RANGE_ID {
            return None;
        }
        self.inner.read().slots[id as usize].clone()
    }

    /// Removes the range containing `addr` from address lookup, so no new
    /// fault can route to it, and returns it. The id slot stays occupied
    /// until [`RangeRegistry::free_id`]; callers flush and purge the
    /// tiers in between.
    pub fn detach_by_address(&self, addr: usize) -> Result<Arc<VRange>> {
        let mut inner = self.inner.write();
        let Some(id) = inner.tree.find(addr) else {
            bail!("address {addr:#x} is not inside any registered range");
        };
        let range = inner.slots[id as usize]
            .clone()
            .expect("tree entry without a slot");
        inner.tree.remove(range.base_addr());
        Ok(range)
    }

    /// Releases an id slot previously detached.
    pub fn free_id(&self, id: u8) {
        let mut inner = self.inner.write();
        debug_assert!(inner.slots[id as usize].is_some());
        inner.slots[id as usize] = None;
        inner.active -= 1;
    }

    /// Ids of every active range. Used by teardown.
    pub fn active_ids(&self) -> Vec<u8> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id as u8))
            .collect()
    }

    pub fn active_count(&self) -> u32 {
        self.inner.read().active
    }

    /// Ids still available for new ranges.
    pub fn free_count(&self) -> u32 {
        INVALID_RANGE_ID as u32 - self.active_count()
    }

    /// Total id slots, active or not.
    pub fn capacity(&self) -> u32 {
        INVALID_RANGE_ID as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn anonymous_range_lifecycle() {
        let registry = RangeRegistry::new();
        let range = registry.allocate(10 * PAGE_SIZE as u64).unwrap();

        assert_eq!(range.id(), 0);
        assert_eq!(range.page_count(), 10);
        assert_eq!(range.base_addr() % PAGE_SIZE, 0);
        assert_eq!(registry.active_count(), 1);

        let inside = range.base_addr() + 3 * PAGE_SIZE + 17;
        let found = registry.find_by_address(inside).unwrap();
        assert_eq!(found.id(), range.id());
        assert!(registry.find_by_address(range.base_addr() - 1).is_none());

        let detached = registry.detach_by_address(inside).unwrap();
        assert!(registry.find_by_address(inside).is_none());
        registry.free_id(detached.id());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn sizes_round_up_to_pages() {
        let registry = RangeRegistry::new();
        let range = registry.allocate(PAGE_SIZE as u64 + 1).unwrap();
        assert_eq!(range.page_count(), 2);
        assert_eq!(range.len(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn ids_are_reused_lowest_first() {
        let registry = RangeRegistry::new();
        let a = registry.allocate(PAGE_SIZE as u64).unwrap();
        let b = registry.allocate(PAGE_SIZE as u64).unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));

        let detached = registry.detach_by_address(a.base_addr()).unwrap();
        registry.free_id(detached.id());
        drop(a);

        let c = registry.allocate(PAGE_SIZE as u64).unwrap();
        assert_eq!(c.id(), 0);
    }

    #[test]
    fn mapped_range_marks_existing_pages_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.dat");
        let mut file = std::fs::File::create(&path).unwrap();
        // Three pages and a bit of pre-existing content.
        file.write_all(&vec![0xCC; 3 * PAGE_SIZE + 100]).unwrap();
        drop(file);

        let registry = RangeRegistry::new();
        let range = registry
            .map(&path, 8 * PAGE_SIZE as u64, 0)
            .unwrap();

        // Pages 0..=3 overlap the old file content (page 3 partially).
        for page in 0..4 {
            assert!(range.v2h(page).snapshot().on_disk(), "page {page}");
        }
        for page in 4..8 {
            assert!(!range.v2h(page).snapshot().on_disk(), "page {page}");
        }

        // The file was extended to cover the whole window.
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 8 * PAGE_SIZE as u64);
    }

    #[test]
    fn mapped_range_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RangeRegistry::new();
        let missing = dir.path().join("missing.dat");
        assert!(registry.map(&missing, PAGE_SIZE as u64, 0).is_err());
    }

    #[test]
    fn mapped_range_rejects_unaligned_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.dat");
        std::fs::write(&path, b"x").unwrap();

        let registry = RangeRegistry::new();
        assert!(registry.map(&path, PAGE_SIZE as u64, 123).is_err());
    }

    #[test]
    fn backing_page_io_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing.dat");
        std::fs::write(&path, vec![0u8; 4 * PAGE_SIZE]).unwrap();

        let registry = RangeRegistry::new();
        let range = registry.map(&path, 4 * PAGE_SIZE as u64, 0).unwrap();
        let backing = range.backing().unwrap();

        // Direct I/O needs page-aligned buffers, same as the real tiers.
        let mut pool = crate::memory::PinnedPool::new("test-io", 2).unwrap();
        pool.buf_mut(0)[16..24].copy_from_slice(&0xDEADBEEFu64.to_le_bytes());
        backing.write_page(2, pool.buf(0)).unwrap();

        backing.read_page(2, pool.buf_mut(1)).unwrap();
        assert_eq!(pool.buf(0), pool.buf(1));
    }
}
