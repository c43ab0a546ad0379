use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::mem;

use crate::sys::syscall;

/// Counting semaphore over POSIX `sem_t`.
///
/// Waits retry on interruption; they are also kernel cancellation points,
/// which is what [`ThreadGroup`] cancellation relies on to stop workers
/// blocked here.
///
/// [`ThreadGroup`]: crate::threads::ThreadGroup
pub struct Semaphore {
    sem: UnsafeCell<libc::sem_t>,
}

// SAFETY: sem_t is made for cross-thread post/wait.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// A semaphore holding `value` tokens.
    pub fn new(value: u32) -> io::Result<Semaphore> {
        // SAFETY: all-zeroes is a dead sem_t; sem_init overwrites it.
        let sem = UnsafeCell::new(unsafe { mem::zeroed() });
        syscall!(sem_init(sem.get(), 0, value as libc::c_uint))?;
        Ok(Semaphore { sem })
    }

    /// Release one token.
    pub fn post(&self) {
        let _ = syscall!(sem_post(self.sem.get()));
    }

    /// Take one token, blocking until one is available.
    pub fn wait(&self) {
        while syscall!(sem_wait(self.sem.get())).is_err() {}
    }

    /// Take one token if one is available right now.
    pub fn try_wait(&self) -> bool {
        syscall!(sem_trywait(self.sem.get())).is_ok()
    }

    /// Take one token, giving up at `deadline` (absolute `CLOCK_REALTIME`
    /// nanoseconds). Returns `false` on timeout.
    pub fn wait_until(&self, deadline: u64) -> bool {
        let ts = libc::timespec {
            tv_sec: (deadline / 1_000_000_000) as libc::time_t,
            tv_nsec: (deadline % 1_000_000_000) as libc::c_long,
        };
        loop {
            match syscall!(sem_timedwait(self.sem.get(), &ts)) {
                Ok(_) => return true,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// The current token count (0 when threads are blocked waiting).
    pub fn value(&self) -> i32 {
        let mut value: libc::c_int = 0;
        let _ = syscall!(sem_getvalue(self.sem.get(), &mut value));
        value.max(0)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: no waiters can outlive a &mut self.
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Semaphore")
            .field("value", &self.value())
            .finish()
    }
}
