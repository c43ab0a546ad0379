//! Worker threads: cancellation helpers, groups with coordinated start,
//! and a FIFO job pool.
//!
//! Cancellation here is the kernel's: a cancelled worker unwinds out of
//! its next cancellation point (the semaphore waits in this module are
//! ones). Workers therefore keep cancellation disabled except across waits
//! they know to be safe, using the state helpers below. The unwind runs
//! like a panic; entries must not hold state across an enabled wait that
//! cannot be dropped.

use std::ptr;

mod group;
mod pool;
mod sem;

pub use self::group::{Entry, ThreadGroup};
pub use self::pool::ThreadPool;
pub use self::sem::Semaphore;

// The vendored `libc` crate used to build this crate does not expose these
// POSIX thread-cancellation bindings, so they are declared locally here.
// Values match glibc's <pthread.h>.
const PTHREAD_CANCEL_ENABLE: libc::c_int = 0;
const PTHREAD_CANCEL_DISABLE: libc::c_int = 1;
const PTHREAD_CANCEL_DEFERRED: libc::c_int = 0;
const PTHREAD_CANCEL_ASYNCHRONOUS: libc::c_int = 1;

extern "C" {
    fn pthread_setcancelstate(state: libc::c_int, oldstate: *mut libc::c_int) -> libc::c_int;
    fn pthread_setcanceltype(kind: libc::c_int, oldtype: *mut libc::c_int) -> libc::c_int;
}

/// Allow the calling thread to be cancelled at cancellation points.
pub fn enable_cancel() {
    // SAFETY: only flips this thread's cancellation state.
    unsafe {
        pthread_setcancelstate(PTHREAD_CANCEL_ENABLE, ptr::null_mut());
    }
}

/// Block cancellation of the calling thread.
pub fn disable_cancel() {
    // SAFETY: only flips this thread's cancellation state.
    unsafe {
        pthread_setcancelstate(PTHREAD_CANCEL_DISABLE, ptr::null_mut());
    }
}

/// Let a pending cancel take effect immediately instead of at the next
/// cancellation point. Only sane around spans that touch no state at all.
pub fn enable_async_cancel() {
    // SAFETY: only flips this thread's cancellation type.
    unsafe {
        pthread_setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS, ptr::null_mut());
    }
}

/// Restore deferred cancellation (the default).
pub fn disable_async_cancel() {
    // SAFETY: only flips this thread's cancellation type.
    unsafe {
        pthread_setcanceltype(PTHREAD_CANCEL_DEFERRED, ptr::null_mut());
    }
}
