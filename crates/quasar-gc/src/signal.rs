//! Trap-page fault diagnostics.
//!
//! The shadow stack ends in a page with all access revoked; running past
//! the stack's capacity faults there. This module installs a process-wide
//! `SIGSEGV` handler that recognizes faults inside registered guard pages
//! and reports a stack overflow before aborting. Faults anywhere else are
//! re-raised with the default disposition.
//!
//! The registry is a fixed array of atomics so the handler stays
//! async-signal-safe: it only loads atomics, `write(2)`s, and aborts.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

const MAX_GUARDS: usize = 64;

static GUARD_BASE: [AtomicUsize; MAX_GUARDS] = [const { AtomicUsize::new(0) }; MAX_GUARDS];
static GUARD_LEN: [AtomicUsize; MAX_GUARDS] = [const { AtomicUsize::new(0) }; MAX_GUARDS];

static INSTALL: Once = Once::new();

/// Registers a guard page so faults inside it produce a diagnostic.
///
/// When the registry is full the page still faults; only the diagnostic
/// is lost.
pub(crate) fn guard_region(base: usize, len: usize) {
    INSTALL.call_once(install_handler);
    for slot in 0..MAX_GUARDS {
        if GUARD_BASE[slot]
            .compare_exchange(0, base, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            GUARD_LEN[slot].store(len, Ordering::Release);
            return;
        }
    }
}

pub(crate) fn unguard_region(base: usize) {
    for slot in 0..MAX_GUARDS {
        if GUARD_BASE[slot].load(Ordering::Acquire) == base {
            GUARD_LEN[slot].store(0, Ordering::Release);
            GUARD_BASE[slot].store(0, Ordering::Release);
            return;
        }
    }
}

fn install_handler() {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_fault as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
        // macOS reports guard-page hits as SIGBUS.
        #[cfg(target_vendor = "apple")]
        libc::sigaction(libc::SIGBUS, &action, ptr::null_mut());
    }
}

extern "C" fn on_fault(signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as usize;

    for slot in 0..MAX_GUARDS {
        let base = GUARD_BASE[slot].load(Ordering::Acquire);
        let len = GUARD_LEN[slot].load(Ordering::Acquire);
        if base != 0 && addr >= base && addr < base + len {
            const MSG: &[u8] = b"quasar-gc: fatal: shadow stack overflow\n";
            unsafe {
                libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
                libc::abort();
            }
        }
    }

    // Not one of ours: restore the default disposition and re-raise.
    unsafe {
        let mut default: libc::sigaction = mem::zeroed();
        default.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signo, &default, ptr::null_mut());
        libc::raise(signo);
    }
}
