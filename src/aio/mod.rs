//! # Asynchronous I/O Engine
//!
//! Thin wrapper around the Linux kernel AIO interface (`io_setup` /
//! `io_submit` / `io_getevents`), used to batch flash→HDD page migrations
//! so a 16-page eviction round costs one submit and one reap instead of
//! 32 synchronous syscalls.
//!
//! ## Model
//!
//! Requests come from a fixed slab with LIFO reuse, bounded by a
//! configured ceiling; [`AioManager::get_request`] returns `None` when
//! saturated and callers fall back to the synchronous path. Each request
//! carries `{fd, buffer, len, offset, direction}` plus a caller-chosen
//! token. Completions surface as `(token, result)` events from
//! [`AioManager::poll`] (non-blocking) or [`AioManager::wait`]
//! (bounded block); the submitter interprets tokens and schedules any
//! follow-up requests; the flash-read to hdd-write chain submits its
//! paired write when the read's token completes.
//!
//! ## Optionality
//!
//! The engine is an accelerator, not a dependency. When `io_setup` fails
//! (unsupported kernel, seccomp, exhausted `aio-max-nr`) the tier logs
//! and runs every migration synchronously with identical semantics.
//!
//! Buffers handed to requests must stay alive and untouched until the
//! request's completion event has been reaped; the flash cache satisfies
//! this with its pinned aux pool.

use std::time::Duration;

use eyre::{ensure, Result};

use crate::collections::FreeList;

/// Direction of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// One slot in the request slab.
#[derive(Debug, Clone, Copy)]
struct Request {
    fd: i32,
    buf: *mut u8,
    len: usize,
    offset: u64,
    direction: IoDirection,
    token: u64,
    active: bool,
}

impl Request {
    const fn idle() -> Self {
        Self {
            fd: -1,
            buf: std::ptr::null_mut(),
            len: 0,
            offset: 0,
            direction: IoDirection::Read,
            token: 0,
            active: false,
        }
    }
}

/// A reaped completion: the submitter's token and the kernel's result
/// (bytes transferred, or a negative errno).
#[derive(Debug, Clone, Copy)]
pub struct AioCompletion {
    pub token: u64,
    pub result: i64,
}

/// Batched kernel AIO over a bounded request slab.
#[derive(Debug)]
pub struct AioManager {
    ctx: sys::aio_context_t,
    requests: Vec<Request>,
    free: FreeList,
    outstanding: usize,
}

// SAFETY: the raw buffer pointers inside requests are owned by the
// submitting tier, which is itself behind the tier mutex; the manager
// never dereferences them.
unsafe impl Send for AioManager {}

impl AioManager {
    /// Creates a context able to hold `max_outstanding` in-flight
    /// requests. Errors mean "run synchronously", not "abort".
    pub fn new(max_outstanding: usize) -> Result<Self> {
        ensure!(max_outstanding > 0, "need at least one AIO slot");
        let ctx = sys::setup(max_outstanding)?;
        Ok(Self {
            ctx,
            requests: vec![Request::idle(); max_outstanding],
            free: FreeList::new(max_outstanding as u32),
            outstanding: 0,
        })
    }

    /// Reserves a request slot, or `None` when the slab is saturated.
    pub fn get_request(&mut self) -> Option<u32> {
        self.free.take()
    }

    /// Returns an unsubmitted slot taken with [`AioManager::get_request`].
    pub fn put_request(&mut self, handle: u32) {
        debug_assert!(!self.requests[handle as usize].active);
        self.free.put(handle);
    }

    /// Fills a reserved slot. `buf` must stay valid until the completion
    /// for `token` is reaped.
    pub fn prepare(
        &mut self,
        handle: u32,
        fd: i32,
        buf: *mut u8,
        len: usize,
        offset: u64,
        direction: IoDirection,
        token: u64,
    ) {
        let req = &mut self.requests[handle as usize];
        debug_assert!(!req.active);
        *req = Request {
            fd,
            buf,
            len,
            offset,
            direction,
            token,
            active: false,
        };
    }

    /// Submits one prepared request.
    pub fn submit(&mut self, handle: u32) -> Result<()> {
        self.submit_batch(&[handle])
    }

    /// Submits a batch of prepared requests in one syscall.
    pub fn submit_batch(&mut self, handles: &[u32]) -> Result<()> {
        if handles.is_empty() {
            return Ok(());
        }
        let iocbs: Vec<sys::Iocb> = handles
            .iter()
            .map(|&h| {
                let req = &self.requests[h as usize];
                sys::Iocb::new(h as u64, req.fd, req.buf, req.len, req.offset, req.direction)
            })
            .collect();
        let submitted = sys::submit(self.ctx, &iocbs)?;
        ensure!(
            submitted == handles.len(),
            "kernel accepted {} of {} AIO requests",
            submitted,
            handles.len()
        );
        for &h in handles {
            self.requests[h as usize].active = true;
        }
        self.outstanding += handles.len();
        Ok(())
    }

    /// Non-blocking reap of up to `max_completions` events into `out`.
    pub fn poll(&mut self, max_completions: usize, out: &mut Vec<AioCompletion>) -> Result<usize> {
        self.reap(0, max_completions, Duration::ZERO, out)
    }

    /// Blocks until at least `min_completions` events arrive or `timeout`
    /// expires, reaping up to `max_completions`.
    pub fn wait(
        &mut self,
        min_completions: usize,
        max_completions: usize,
        timeout: Duration,
        out: &mut Vec<AioCompletion>,
    ) -> Result<usize> {
        self.reap(min_completions, max_completions, timeout, out)
    }

    fn reap(
        &mut self,
        min: usize,
        max: usize,
        timeout: Duration,
        out: &mut Vec<AioCompletion>,
    ) -> Result<usize> {
        if max == 0 || self.outstanding == 0 {
            return Ok(0);
        }
        let events = sys::get_events(self.ctx, min, max, timeout)?;
        let reaped = events.len();
        ensure!(
            reaped <= self.outstanding,
            "reaped {} events with only {} outstanding",
            reaped,
            self.outstanding
        );
        self.outstanding -= reaped;
        for event in events {
            let handle = event.data as u32;
            let req = &mut self.requests[handle as usize];
            debug_assert!(req.active);
            if event.res < 0 || event.res as usize != req.len {
                tracing::error!(
                    fd = req.fd,
                    len = req.len,
                    offset = req.offset,
                    res = event.res,
                    "AIO request finished short or failed"
                );
            }
            let token = req.token;
            req.active = false;
            self.free.put(handle);
            out.push(AioCompletion {
                token,
                result: event.res,
            });
        }
        Ok(reaped)
    }

    /// Request slots currently available.
    pub fn free_requests(&self) -> usize {
        self.free.available()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl Drop for AioManager {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            tracing::warn!(
                outstanding = self.outstanding,
                "destroying AIO context with requests in flight"
            );
        }
        sys::destroy(self.ctx);
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::IoDirection;
    use eyre::{bail, Result};
    use std::time::Duration;

    #[allow(non_camel_case_types)]
    pub type aio_context_t = libc::c_ulong;

    const IOCB_CMD_PREAD: u16 = 0;
    const IOCB_CMD_PWRITE: u16 = 1;

    /// Kernel ABI control block (little-endian layout). Fields are only
    /// ever read by the kernel.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    #[allow(dead_code)]
    pub struct Iocb {
        aio_data: u64,
        aio_key: u32,
        aio_rw_flags: u32,
        aio_lio_opcode: u16,
        aio_reqprio: i16,
        aio_fildes: u32,
        aio_buf: u64,
        aio_nbytes: u64,
        aio_offset: i64,
        aio_reserved2: u64,
        aio_flags: u32,
        aio_resfd: u32,
    }

    /// Kernel ABI completion record; `obj` and `res2` exist for layout.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    #[allow(dead_code)]
    pub struct IoEvent {
        pub data: u64,
        pub obj: u64,
        pub res: i64,
        pub res2: i64,
    }

    impl Iocb {
        pub fn new(
            data: u64,
            fd: i32,
            buf: *mut u8,
            len: usize,
            offset: u64,
            direction: IoDirection,
        ) -> Self {
            Self {
                aio_data: data,
                aio_key: 0,
                aio_rw_flags: 0,
                aio_lio_opcode: match direction {
                    IoDirection::Read => IOCB_CMD_PREAD,
                    IoDirection::Write => IOCB_CMD_PWRITE,
                },
                aio_reqprio: 0,
                aio_fildes: fd as u32,
                aio_buf: buf as u64,
                aio_nbytes: len as u64,
                aio_offset: offset as i64,
                aio_reserved2: 0,
                aio_flags: 0,
                aio_resfd: 0,
            }
        }
    }

    pub fn setup(nr_events: usize) -> Result<aio_context_t> {
        let mut ctx: aio_context_t = 0;
        // SAFETY: io_setup writes the new context id into `ctx` and
        // touches nothing else.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                nr_events as libc::c_long,
                &mut ctx as *mut aio_context_t,
            )
        };
        if rc != 0 {
            bail!(
                "io_setup({nr_events}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(ctx)
    }

    pub fn submit(ctx: aio_context_t, iocbs: &[Iocb]) -> Result<usize> {
        let ptrs: Vec<*const Iocb> = iocbs.iter().map(|c| c as *const Iocb).collect();
        // SAFETY: `ptrs` holds valid pointers into `iocbs`, which outlives
        // the call; the kernel copies the control blocks during submit.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                ctx,
                ptrs.len() as libc::c_long,
                ptrs.as_ptr(),
            )
        };
        if rc < 0 {
            bail!(
                "io_submit of {} requests failed: {}",
                iocbs.len(),
                std::io::Error::last_os_error()
            );
        }
        Ok(rc as usize)
    }

    pub fn get_events(
        ctx: aio_context_t,
        min: usize,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<IoEvent>> {
        let mut events = vec![
            IoEvent {
                data: 0,
                obj: 0,
                res: 0,
                res2: 0
            };
            max
        ];
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // SAFETY: `events` is writable for `max` entries and `ts` lives
        // across the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                ctx,
                min as libc::c_long,
                max as libc::c_long,
                events.as_mut_ptr(),
                &mut ts as *mut libc::timespec,
            )
        };
        if rc < 0 {
            bail!(
                "io_getevents(min={min}, max={max}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
        events.truncate(rc as usize);
        Ok(events)
    }

    pub fn destroy(ctx: aio_context_t) {
        if ctx != 0 {
            // SAFETY: the context id came from a successful io_setup and
            // is destroyed exactly once (Drop).
            unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::IoDirection;
    use eyre::{bail, Result};
    use std::time::Duration;

    #[allow(non_camel_case_types)]
    pub type aio_context_t = u64;

    #[derive(Debug, Clone, Copy)]
    pub struct Iocb;

    impl Iocb {
        pub fn new(_: u64, _: i32, _: *mut u8, _: usize, _: u64, _: IoDirection) -> Self {
            Iocb
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct IoEvent {
        pub data: u64,
        pub res: i64,
    }

    pub fn setup(_nr_events: usize) -> Result<aio_context_t> {
        bail!("kernel AIO is only available on Linux");
    }

    pub fn submit(_: aio_context_t, _: &[Iocb]) -> Result<usize> {
        bail!("kernel AIO is only available on Linux");
    }

    pub fn get_events(_: aio_context_t, _: usize, _: usize, _: Duration) -> Result<Vec<IoEvent>> {
        bail!("kernel AIO is only available on Linux");
    }

    pub fn destroy(_: aio_context_t) {}
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::memory::PinnedPool;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn write_then_read_round_trip() {
        let Ok(mut aio) = AioManager::new(8) else {
            // Kernel AIO unavailable in this environment; the tiers run
            // synchronously in that case and this path is moot.
            return;
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aio.dat");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4 * PAGE_SIZE as u64).unwrap();

        let mut pool = PinnedPool::new("aio-test", 2).unwrap();
        pool.buf_mut(0).fill(0x5A);
        let write_buf = pool.buf_mut(0).as_mut_ptr();

        let handle = aio.get_request().unwrap();
        aio.prepare(
            handle,
            file.as_raw_fd(),
            write_buf,
            PAGE_SIZE,
            PAGE_SIZE as u64,
            IoDirection::Write,
            1,
        );
        aio.submit(handle).unwrap();

        let mut done = Vec::new();
        aio.wait(1, 8, std::time::Duration::from_secs(2), &mut done)
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, 1);
        assert_eq!(done[0].result, PAGE_SIZE as i64);

        let read_buf = pool.buf_mut(1).as_mut_ptr();
        let handle = aio.get_request().unwrap();
        aio.prepare(
            handle,
            file.as_raw_fd(),
            read_buf,
            PAGE_SIZE,
            PAGE_SIZE as u64,
            IoDirection::Read,
            2,
        );
        aio.submit(handle).unwrap();

        done.clear();
        aio.wait(1, 8, std::time::Duration::from_secs(2), &mut done)
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, 2);
        assert!(pool.buf(1).iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn slab_saturation_returns_none() {
        let Ok(mut aio) = AioManager::new(2) else {
            return;
        };
        let a = aio.get_request();
        let b = aio.get_request();
        assert!(a.is_some() && b.is_some());
        assert!(aio.get_request().is_none());

        aio.put_request(a.unwrap());
        assert!(aio.get_request().is_some());
    }
}
