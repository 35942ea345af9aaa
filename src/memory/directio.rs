//! Direct-I/O file opening with a buffered fallback.
//!
//! The flash file and the backing HDD files are opened `O_DIRECT` so page
//! traffic bypasses the OS page cache; the whole point of the hierarchy
//! is that *we* decide what stays resident. Filesystems without direct
//! I/O support (tmpfs being the common case in test environments) refuse
//! the flag with `EINVAL`; those opens retry buffered with a warning.
//! Callers keep their buffers page-aligned either way.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use eyre::{Result, WrapErr};

/// Opens `path` read-write for direct I/O, falling back to buffered I/O
/// when the filesystem refuses `O_DIRECT`.
pub fn open_direct(path: &Path, create: bool, truncate: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(true)
        .create(create)
        .truncate(truncate);

    let mut direct = options.clone();
    direct.custom_flags(libc::O_DIRECT);
    match direct.open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            tracing::warn!(
                path = %path.display(),
                "filesystem refused O_DIRECT; falling back to buffered I/O"
            );
            options
                .open(path)
                .wrap_err_with(|| format!("failed to open '{}'", path.display()))
        }
        Err(err) => {
            Err(err).wrap_err_with(|| format!("failed to open '{}' for direct I/O", path.display()))
        }
    }
}
