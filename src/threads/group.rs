use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;

use super::sem::Semaphore;

/// The entry every worker of one start call runs.
pub type Entry = Arc<dyn Fn() + Send + Sync + 'static>;

/// Start datum shared between the spawner and its workers.
///
/// Workers park on `gate` until the spawner knows every create succeeded,
/// copy the entry out, and the last one through posts `done` to release
/// the spawner. The datum rides an `Arc` so it lives exactly as long as
/// the slowest consumer, while every worker stays cancellable the whole
/// time (a barrier would not be interruptible by cancellation, which is
/// the one thing this rendezvous must stay).
struct StartData {
    gate: Semaphore,
    done: Semaphore,
    remaining: AtomicU32,
    entry: Entry,
}

/// The trampoline is "C-unwind" so a cancellation unwind may pass through
/// it. Raw pointers only: no destructor is live at the `gate` wait, the
/// one cancellation point before user code runs.
unsafe extern "C-unwind" fn trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    let data = arg as *const StartData;
    (*data).gate.wait();

    let entry = Arc::clone(&(*data).entry);
    if (*data).remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        (*data).done.post();
    }
    drop(Arc::from_raw(data));

    entry();
    ptr::null_mut()
}

/// N worker threads sharing one entry, cancellable in trailing subsets.
///
/// `start` spawns workers through a rendezvous that guarantees, by the
/// time it returns, every worker has picked up the shared entry and the
/// start datum is released. Cancellation targets the most recently
/// started workers first and detects the calling thread among the
/// targets, detaching and exiting it last.
///
/// Dropping the group does not stop its workers; cancel or shut down
/// first. Workers must only enable cancellation around waits they can
/// abandon safely (see the module docs).
#[derive(Debug)]
pub struct ThreadGroup {
    ids: Vec<libc::pthread_t>,
}

impl ThreadGroup {
    /// An empty group. Does not allocate.
    pub fn new() -> ThreadGroup {
        ThreadGroup { ids: Vec::new() }
    }

    /// Spawn `amount` workers all running `entry`.
    ///
    /// Returns once every worker holds the entry. If any spawn fails, the
    /// workers already spawned for this call are cancelled and joined
    /// before the error is returned.
    pub fn start<F>(&mut self, amount: u32, entry: F) -> io::Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start_shared(amount, Arc::new(entry))
    }

    /// Like [`start`], with an explicit per-worker stack size.
    ///
    /// [`start`]: ThreadGroup::start
    pub fn start_with_stack<F>(&mut self, amount: u32, stack_size: usize, entry: F) -> io::Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.spawn(amount, Some(stack_size), Arc::new(entry))
    }

    /// Like [`start`], sharing an already-allocated entry.
    ///
    /// [`start`]: ThreadGroup::start
    pub fn start_shared(&mut self, amount: u32, entry: Entry) -> io::Result<()> {
        self.spawn(amount, None, entry)
    }

    fn spawn(&mut self, amount: u32, stack_size: Option<usize>, entry: Entry) -> io::Result<()> {
        if amount == 0 {
            return Ok(());
        }

        let data = Arc::new(StartData {
            gate: Semaphore::new(0)?,
            done: Semaphore::new(0)?,
            remaining: AtomicU32::new(amount),
            entry,
        });

        let mut attr: libc::pthread_attr_t = unsafe { mem::zeroed() };
        // SAFETY: a zeroed pthread_attr_t is dead storage for init to fill.
        unsafe {
            libc::pthread_attr_init(&mut attr);
            if let Some(stack_size) = stack_size {
                libc::pthread_attr_setstacksize(&mut attr, stack_size.max(libc::PTHREAD_STACK_MIN));
            }
        }

        let already = self.ids.len();
        self.ids.reserve(amount as usize);
        for _ in 0..amount {
            let arg = Arc::into_raw(Arc::clone(&data)) as *mut libc::c_void;
            let mut id: libc::pthread_t = 0;
            // SAFETY: the trampoline balances the raw Arc reference; the
            // signature change is ABI-compatible, "C-unwind" only widens
            // what may unwind through.
            let res = unsafe {
                let start: unsafe extern "C-unwind" fn(*mut libc::c_void) -> *mut libc::c_void =
                    trampoline;
                libc::pthread_create(&mut id, &attr, mem::transmute(start), arg)
            };
            if res != 0 {
                // The worker never ran; balance its reference ourselves.
                unsafe {
                    drop(Arc::from_raw(arg as *const StartData));
                    libc::pthread_attr_destroy(&mut attr);
                }
                let spawned = (self.ids.len() - already) as u32;
                // Workers are still parked on the gate, a cancellation
                // point, so this cannot hang.
                self.cancel_sync(spawned);
                return Err(io::Error::from_raw_os_error(res));
            }
            self.ids.push(id);
        }
        // SAFETY: initialized above and no longer used.
        unsafe {
            libc::pthread_attr_destroy(&mut attr);
        }

        for _ in 0..amount {
            data.gate.post();
        }
        data.done.wait();
        trace!("started {} worker(s), {} total", amount, self.ids.len());
        Ok(())
    }

    /// Cancel the `amount` most recently started workers and join them.
    ///
    /// If the calling thread is among the targets it is detached and
    /// exits after the others have been joined.
    pub fn cancel_sync(&mut self, amount: u32) {
        let amount = (amount as usize).min(self.ids.len());
        if amount == 0 {
            return;
        }
        let total = self.ids.len() - amount;
        // SAFETY: pthread_self is always valid.
        let this = unsafe { libc::pthread_self() };
        let mut ourself = false;

        for &id in &self.ids[total..] {
            // SAFETY: ids holds threads we created and have not joined.
            unsafe {
                if libc::pthread_equal(id, this) == 0 {
                    libc::pthread_cancel(id);
                } else {
                    ourself = true;
                }
            }
        }
        for &id in &self.ids[total..] {
            // SAFETY: as above; each id is joined at most once.
            unsafe {
                if libc::pthread_equal(id, this) == 0 {
                    libc::pthread_join(id, ptr::null_mut());
                }
            }
        }

        self.ids.truncate(total);
        self.shrink();

        if ourself {
            // SAFETY: detaching and exiting the current thread.
            unsafe {
                libc::pthread_detach(this);
                libc::pthread_exit(ptr::null_mut());
            }
        }
    }

    /// Cancel the `amount` most recently started workers without waiting
    /// for them.
    ///
    /// If the calling thread is among the targets it cancels itself last.
    pub fn cancel_async(&mut self, amount: u32) {
        let amount = (amount as usize).min(self.ids.len());
        if amount == 0 {
            return;
        }
        let total = self.ids.len() - amount;
        // SAFETY: pthread_self is always valid.
        let this = unsafe { libc::pthread_self() };
        let mut ourself = false;

        for &id in &self.ids[total..] {
            // SAFETY: ids holds threads we created and have not joined.
            unsafe {
                if libc::pthread_equal(id, this) == 0 {
                    libc::pthread_detach(id);
                    libc::pthread_cancel(id);
                } else {
                    ourself = true;
                }
            }
        }

        self.ids.truncate(total);
        self.shrink();

        if ourself {
            // SAFETY: detaching and cancelling the current thread.
            unsafe {
                libc::pthread_detach(this);
                libc::pthread_cancel(this);
            }
        }
    }

    /// Cancel every worker and join them.
    pub fn shutdown_sync(&mut self) {
        self.cancel_sync(self.ids.len() as u32);
    }

    /// Cancel every worker without waiting.
    pub fn shutdown_async(&mut self) {
        self.cancel_async(self.ids.len() as u32);
    }

    /// Number of workers the group is tracking.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` when no workers are tracked.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn shrink(&mut self) {
        if self.ids.len() < self.ids.capacity() / 4 {
            self.ids.shrink_to(self.ids.len() * 2);
        }
    }
}
