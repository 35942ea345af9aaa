//! # Fault Handler
//!
//! SIGSEGV plumbing: a process-wide handler that turns access violations
//! inside registered ranges into page materializations, and forwards
//! everything else to the previously installed disposition.
//!
//! ## Globals
//!
//! Signal handlers cannot carry state, so the active [`MemoryGroup`]
//! lives in a process-wide slot behind a reader-writer lock. The handler
//! takes a read lock just long enough to clone the `Arc`, then services
//! the fault against it. Activation and deactivation write the slot; a
//! process hosts at most one active group because all threads share one
//! SIGSEGV disposition.
//!
//! ## Read/write discrimination
//!
//! On x86-64 the page-fault error code is preserved in the machine
//! context (`REG_ERR`, bit 1 set for writes), so a read fault can leave
//! its page read-only and take a cheap second fault on the first store.
//! Other architectures don't expose the flag portably; they treat every
//! fault as a write, which costs write-back volume but never
//! correctness.
//!
//! ## Unmanaged faults
//!
//! A faulting address outside every registered range (including a null
//! pointer) restores the default disposition and re-raises, so the
//! application's own crash handling (and the kernel's core dump) see the
//! original violation. The hierarchy never masks unrelated faults.
//!
//! ## Safety posture
//!
//! The handler takes the tier mutex, performs file I/O, and on slow
//! paths allocates; by design these locks are touched by no code path
//! other than fault servicing and teardown, and all per-fault storage
//! comes from pools sized at init. Fatal conditions (I/O errors,
//! exhausted pools after eviction) abort the process: returning from a
//! handler with the V2H state half-written would corrupt the hierarchy.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};

use crate::group::MemoryGroup;

static ACTIVE_GROUP: RwLock<Option<Arc<MemoryGroup>>> = RwLock::new(None);

struct SavedAction(libc::sigaction);
// SAFETY: sigaction is plain data; it is only moved under the mutex.
unsafe impl Send for SavedAction {}

static OLD_ACTION: Mutex<Option<SavedAction>> = Mutex::new(None);

/// Installs the handler and publishes `group` as the process-wide
/// hierarchy. Fails when a group is already active.
pub fn activate(group: Arc<MemoryGroup>) -> Result<()> {
    let mut slot = ACTIVE_GROUP.write();
    ensure!(
        slot.is_none(),
        "a hybrid memory group is already active in this process"
    );
    install_handler()?;
    *slot = Some(group);
    Ok(())
}

/// Restores the previous SIGSEGV disposition and unpublishes the group.
/// Returns the group so the caller can run teardown against it.
pub fn deactivate() -> Option<Arc<MemoryGroup>> {
    let mut slot = ACTIVE_GROUP.write();
    if slot.is_some() {
        uninstall_handler();
    }
    slot.take()
}

/// The currently active group, if any.
pub fn active_group() -> Option<Arc<MemoryGroup>> {
    ACTIVE_GROUP.read().clone()
}

fn install_handler() -> Result<()> {
    // SAFETY: zeroed sigaction is a valid starting point; sigaction(2)
    // only reads the new action and writes the old one.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        // Keep asynchronous housekeeping signals out while a fault is
        // being serviced; synchronous faults (SEGV, BUS, FPE) stay
        // deliverable.
        for sig in [
            libc::SIGHUP,
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGPIPE,
            libc::SIGALRM,
            libc::SIGTERM,
            libc::SIGUSR1,
            libc::SIGUSR2,
            libc::SIGCHLD,
            libc::SIGURG,
            libc::SIGIO,
            libc::SIGXCPU,
            libc::SIGXFSZ,
            libc::SIGVTALRM,
            libc::SIGPROF,
            libc::SIGWINCH,
        ] {
            libc::sigaddset(&mut action.sa_mask, sig);
        }
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = sigsegv_action as usize;

        let mut old: libc::sigaction = std::mem::zeroed();
        ensure!(
            libc::sigaction(libc::SIGSEGV, &action, &mut old) == 0,
            "failed to install the SIGSEGV handler: {}",
            std::io::Error::last_os_error()
        );
        *OLD_ACTION.lock() = Some(SavedAction(old));
    }
    tracing::debug!("installed SIGSEGV fault handler");
    Ok(())
}

fn uninstall_handler() {
    if let Some(SavedAction(old)) = OLD_ACTION.lock().take() {
        // SAFETY: `old` is the disposition saved by install_handler.
        unsafe {
            if libc::sigaction(libc::SIGSEGV, &old, std::ptr::null_mut()) != 0 {
                tracing::error!(
                    "failed to restore the previous SIGSEGV disposition: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        tracing::debug!("restored previous SIGSEGV disposition");
    }
}

/// Hands the fault back to the default disposition. The faulting
/// instruction re-executes once the handler returns and the kernel
/// delivers the original violation.
fn forward_to_default(signal: i32) {
    // SAFETY: resetting to SIG_DFL and re-raising is the documented way
    // to decline a synchronous signal.
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        libc::raise(signal);
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
fn fault_is_write(ucontext: *mut libc::c_void) -> bool {
    if ucontext.is_null() {
        return true;
    }
    // SAFETY: the kernel hands the handler a valid ucontext_t for the
    // faulting thread.
    let err = unsafe {
        let context = ucontext as *const libc::ucontext_t;
        (*context).uc_mcontext.gregs[libc::REG_ERR as usize]
    };
    err & 0x2 != 0
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
fn fault_is_write(_ucontext: *mut libc::c_void) -> bool {
    // No portable access to the fault error code; a write-grade
    // materialization is always correct, just dirtier.
    true
}

extern "C" fn sigsegv_action(
    signal: i32,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // SAFETY: the kernel provides a valid siginfo_t under SA_SIGINFO.
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    if fault_addr == 0 {
        forward_to_default(signal);
        return;
    }

    let Some(group) = active_group() else {
        forward_to_default(signal);
        return;
    };

    match group.handle_fault(fault_addr, fault_is_write(ucontext)) {
        Ok(true) => {}
        Ok(false) => forward_to_default(signal),
        Err(err) => {
            // The V2H state cannot be trusted after a half-serviced
            // fault; continuing would trade a crash for corruption.
            tracing::error!(fault_addr, %err, "unrecoverable error in fault handler");
            std::process::abort();
        }
    }
}
