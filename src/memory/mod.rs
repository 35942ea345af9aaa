//! # Memory
//!
//! Pre-allocated memory backing for the fault path. The signal handler
//! may not call the general-purpose allocator, so every byte it touches
//! (cache entry metadata, page copies, direct-I/O scratch space) comes
//! from pools sized and mapped at init time.
//!
//! - [`pool`]: page-aligned, best-effort-pinned buffer arrays
//! - [`protect`]: the shared `mprotect`/`madvise` surface
//! - [`directio`]: `O_DIRECT` opens with a buffered fallback

pub mod directio;
pub mod pool;
pub mod protect;

pub use directio::open_direct;
pub use pool::PinnedPool;
pub use protect::{discard, set_protection, PageProtection};
