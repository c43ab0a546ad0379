use std::fmt;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::trace;

use super::clock;
use crate::threads::Semaphore;

/// The slot index meaning "not in a heap".
const DEAD: usize = usize::MAX;
/// The slot index meaning "popped for firing right now".
const FIRING: usize = usize::MAX - 1;

/// The caller's end of a live timer.
///
/// The service writes the timer's current heap slot into the handle on
/// every swap, so cancellation and [`Timers::open_timeout`]-style
/// modification find the slot in O(1). A handle goes stale once its timer
/// fired or was cancelled; stale handles are detected and every operation
/// on them fails cleanly.
#[derive(Clone)]
pub struct TimerHandle {
    cell: Arc<HandleCell>,
}

struct HandleCell {
    index: AtomicUsize,
    cancelled: AtomicBool,
}

impl HandleCell {
    fn new() -> HandleCell {
        HandleCell {
            index: AtomicUsize::new(DEAD),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.cell.index.load(Ordering::Relaxed);
        fmt.debug_struct("TimerHandle")
            .field("live", &(index != DEAD))
            .finish()
    }
}

type TimerFn = Box<dyn FnMut() + Send>;

struct TimeoutSlot {
    due: u64,
    func: TimerFn,
    cell: Arc<HandleCell>,
}

struct IntervalSlot {
    base: u64,
    interval: u64,
    /// Remaining firings; 0 repeats forever.
    count: u64,
    func: TimerFn,
    cell: Arc<HandleCell>,
}

trait Slot {
    fn due(&self) -> u64;
    fn cell(&self) -> &Arc<HandleCell>;
}

impl Slot for TimeoutSlot {
    fn due(&self) -> u64 {
        self.due
    }
    fn cell(&self) -> &Arc<HandleCell> {
        &self.cell
    }
}

impl Slot for IntervalSlot {
    fn due(&self) -> u64 {
        self.base
    }
    fn cell(&self) -> &Arc<HandleCell> {
        &self.cell
    }
}

/// Binary min-heap keyed by due-time.
///
/// Comparisons are strict, so equal due-times keep their insertion order.
/// Every structural move rewrites the moved slots' handle cells.
struct Heap<T> {
    slots: Vec<T>,
}

impl<T: Slot> Heap<T> {
    fn new() -> Heap<T> {
        Heap { slots: Vec::new() }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn root_due(&self) -> Option<u64> {
        self.slots.first().map(|slot| slot.due())
    }

    fn cell_at(&self, index: usize) -> &Arc<HandleCell> {
        self.slots[index].cell()
    }

    fn store_index(slot: &T, index: usize) {
        slot.cell().index.store(index, Ordering::Release);
    }

    fn push(&mut self, slot: T) {
        self.slots.push(slot);
        let index = self.slots.len() - 1;
        Self::store_index(&self.slots[index], index);
        self.sift_up(index);
    }

    fn pop_root(&mut self) -> Option<T> {
        self.remove(0)
    }

    fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.slots.len() {
            return None;
        }
        let slot = self.slots.swap_remove(index);
        if index < self.slots.len() {
            Self::store_index(&self.slots[index], index);
            self.restore(index);
        }
        if self.slots.len() < self.slots.capacity() / 4 {
            self.slots.shrink_to(self.slots.len() * 2);
        }
        Some(slot)
    }

    /// Fix the heap around a slot whose key changed in place.
    fn restore(&mut self, index: usize) {
        self.sift_down(index);
        self.sift_up(index);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.slots[parent].due() > self.slots[index].due() {
                self.swap(parent, index);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < self.slots.len() && self.slots[left].due() < self.slots[smallest].due() {
                smallest = left;
            }
            if right < self.slots.len() && self.slots[right].due() < self.slots[smallest].due() {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        Self::store_index(&self.slots[a], a);
        Self::store_index(&self.slots[b], b);
    }
}

struct TimersState {
    timeouts: Heap<TimeoutSlot>,
    intervals: Heap<IntervalSlot>,
}

struct Shared {
    state: Mutex<TimersState>,
    /// Earliest due-time over both heaps; `u64::MAX` when empty. A lock-free
    /// hint for the worker's timed wait.
    latest: AtomicU64,
    /// One token per pending expiry.
    amount: Semaphore,
    /// Posted on every structural change so the worker re-reads `latest`.
    work: Semaphore,
    stop: AtomicBool,
}

/// One-shot timeouts and periodic intervals on a single worker thread.
///
/// Due-times are absolute nanoseconds from [`now`]; [`after`] builds them
/// from a [`Duration`](std::time::Duration) and [`IMMEDIATELY`] fires at
/// the worker's next pass. Callbacks run on the worker thread, serialized,
/// with all signals blocked, and outside the service lock, so they may add
/// and cancel timers freely. Expired timers fire in due-time order; equal
/// due-times fire in insertion order.
///
/// [`now`]: super::now
/// [`after`]: super::after
/// [`IMMEDIATELY`]: super::IMMEDIATELY
pub struct Timers {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

enum Fired {
    Timeout(TimeoutSlot),
    Interval(IntervalSlot),
}

impl Timers {
    /// A service with empty heaps and no worker yet.
    pub fn new() -> io::Result<Timers> {
        Ok(Timers {
            shared: Arc::new(Shared {
                state: Mutex::new(TimersState {
                    timeouts: Heap::new(),
                    intervals: Heap::new(),
                }),
                latest: AtomicU64::new(u64::MAX),
                amount: Semaphore::new(0)?,
                work: Semaphore::new(0)?,
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> io::Result<()> {
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("evio-timers".to_owned())
            .spawn(move || run(&shared))?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the worker and join it.
    ///
    /// Pending timers stay in the heaps; a later [`start`] resumes serving
    /// them.
    ///
    /// [`start`]: Timers::start
    pub fn stop_sync(&self) {
        self.request_stop();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Stop the worker without waiting for it.
    pub fn stop_async(&self) {
        self.request_stop();
        self.worker.lock().unwrap().take();
    }

    fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.amount.post();
        self.shared.work.post();
    }

    /// Arm a one-shot timer firing at absolute time `due`.
    pub fn add_timeout<F>(&self, due: u64, func: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cell = Arc::new(HandleCell::new());
        {
            let mut state = self.shared.state.lock().unwrap();
            state.timeouts.push(TimeoutSlot {
                due,
                func: Box::new(func),
                cell: Arc::clone(&cell),
            });
            refresh_latest(&self.shared, &state);
        }
        self.shared.amount.post();
        self.shared.work.post();
        TimerHandle { cell }
    }

    /// Arm a periodic timer: first firing at absolute time `base`, then
    /// every `interval` nanoseconds, `count` times in total (0 repeats
    /// forever).
    pub fn add_interval<F>(&self, base: u64, interval: u64, count: u64, func: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cell = Arc::new(HandleCell::new());
        {
            let mut state = self.shared.state.lock().unwrap();
            state.intervals.push(IntervalSlot {
                base,
                interval,
                count,
                func: Box::new(func),
                cell: Arc::clone(&cell),
            });
            refresh_latest(&self.shared, &state);
        }
        self.shared.amount.post();
        self.shared.work.post();
        TimerHandle { cell }
    }

    /// Cancel a pending timeout. Fails on a stale handle, and on a timeout
    /// the worker already popped for firing.
    pub fn cancel_timeout(&self, handle: &TimerHandle) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let index = handle.cell.index.load(Ordering::Acquire);
        if index == DEAD || index == FIRING || index >= state.timeouts.len() {
            return false;
        }
        if !Arc::ptr_eq(state.timeouts.cell_at(index), &handle.cell) {
            return false;
        }
        let slot = state.timeouts.remove(index).expect("validated index");
        slot.cell.index.store(DEAD, Ordering::Release);
        refresh_latest(&self.shared, &state);
        drop(state);
        self.shared.work.post();
        true
    }

    /// Cancel an interval. An interval whose callback is running right now
    /// is cancelled effective before its next re-arm.
    pub fn cancel_interval(&self, handle: &TimerHandle) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let index = handle.cell.index.load(Ordering::Acquire);
        if index == FIRING {
            handle.cell.cancelled.store(true, Ordering::Release);
            return true;
        }
        if index == DEAD || index >= state.intervals.len() {
            return false;
        }
        if !Arc::ptr_eq(state.intervals.cell_at(index), &handle.cell) {
            return false;
        }
        let slot = state.intervals.remove(index).expect("validated index");
        slot.cell.index.store(DEAD, Ordering::Release);
        refresh_latest(&self.shared, &state);
        drop(state);
        self.shared.work.post();
        true
    }

    /// Open a pending timeout for modification.
    ///
    /// The service lock is held until the returned guard drops, which
    /// re-heapifies around any change and reschedules the worker.
    pub fn open_timeout(&self, handle: &TimerHandle) -> Option<TimeoutRef<'_>> {
        let state = self.shared.state.lock().unwrap();
        let index = handle.cell.index.load(Ordering::Acquire);
        if index == DEAD || index == FIRING || index >= state.timeouts.len() {
            return None;
        }
        if !Arc::ptr_eq(state.timeouts.cell_at(index), &handle.cell) {
            return None;
        }
        Some(TimeoutRef {
            state,
            shared: &self.shared,
            index,
        })
    }

    /// Open a pending interval for modification; see
    /// [`Timers::open_timeout`].
    pub fn open_interval(&self, handle: &TimerHandle) -> Option<IntervalRef<'_>> {
        let state = self.shared.state.lock().unwrap();
        let index = handle.cell.index.load(Ordering::Acquire);
        if index == DEAD || index == FIRING || index >= state.intervals.len() {
            return None;
        }
        if !Arc::ptr_eq(state.intervals.cell_at(index), &handle.cell) {
            return None;
        }
        Some(IntervalRef {
            state,
            shared: &self.shared,
            index,
        })
    }

    /// Grow the timeout heap ahead of a burst of insertions.
    pub fn reserve_timeouts(&self, additional: usize) {
        self.shared
            .state
            .lock()
            .unwrap()
            .timeouts
            .slots
            .reserve(additional);
    }

    /// Grow the interval heap ahead of a burst of insertions.
    pub fn reserve_intervals(&self, additional: usize) {
        self.shared
            .state
            .lock()
            .unwrap()
            .intervals
            .slots
            .reserve(additional);
    }

    /// Number of pending timeouts.
    pub fn pending_timeouts(&self) -> usize {
        self.shared.state.lock().unwrap().timeouts.len()
    }

    /// Number of pending intervals.
    pub fn pending_intervals(&self) -> usize {
        self.shared.state.lock().unwrap().intervals.len()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        if self.worker.lock().unwrap().is_some() {
            self.stop_sync();
        }
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Timers")
            .field("timeouts", &self.pending_timeouts())
            .field("intervals", &self.pending_intervals())
            .finish()
    }
}

/// Scoped mutable access to a pending timeout.
pub struct TimeoutRef<'a> {
    state: MutexGuard<'a, TimersState>,
    shared: &'a Shared,
    index: usize,
}

impl TimeoutRef<'_> {
    /// The absolute due-time.
    pub fn due(&self) -> u64 {
        self.state.timeouts.slots[self.index].due
    }

    /// Move the due-time; takes effect when the guard drops.
    pub fn set_due(&mut self, due: u64) {
        self.state.timeouts.slots[self.index].due = due;
    }
}

impl Drop for TimeoutRef<'_> {
    fn drop(&mut self) {
        self.state.timeouts.restore(self.index);
        refresh_latest(self.shared, &self.state);
        self.shared.work.post();
    }
}

impl fmt::Debug for TimeoutRef<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TimeoutRef").field("due", &self.due()).finish()
    }
}

/// Scoped mutable access to a pending interval.
pub struct IntervalRef<'a> {
    state: MutexGuard<'a, TimersState>,
    shared: &'a Shared,
    index: usize,
}

impl IntervalRef<'_> {
    /// The absolute time of the next firing.
    pub fn base(&self) -> u64 {
        self.state.intervals.slots[self.index].base
    }

    /// Move the next firing; takes effect when the guard drops.
    pub fn set_base(&mut self, base: u64) {
        self.state.intervals.slots[self.index].base = base;
    }

    /// The period in nanoseconds.
    pub fn interval(&self) -> u64 {
        self.state.intervals.slots[self.index].interval
    }

    /// Change the period for subsequent re-arms.
    pub fn set_interval(&mut self, interval: u64) {
        self.state.intervals.slots[self.index].interval = interval;
    }

    /// Remaining firings (0 repeats forever).
    pub fn remaining(&self) -> u64 {
        self.state.intervals.slots[self.index].count
    }

    /// Change the remaining firings.
    pub fn set_remaining(&mut self, count: u64) {
        self.state.intervals.slots[self.index].count = count;
    }
}

impl Drop for IntervalRef<'_> {
    fn drop(&mut self) {
        self.state.intervals.restore(self.index);
        refresh_latest(self.shared, &self.state);
        self.shared.work.post();
    }
}

impl fmt::Debug for IntervalRef<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("IntervalRef")
            .field("base", &self.base())
            .field("interval", &self.interval())
            .finish()
    }
}

fn refresh_latest(shared: &Shared, state: &TimersState) {
    let mut latest = u64::MAX;
    if let Some(due) = state.timeouts.root_due() {
        latest = latest.min(due);
    }
    if let Some(due) = state.intervals.root_due() {
        latest = latest.min(due);
    }
    shared.latest.store(latest, Ordering::Release);
}

fn run(shared: &Shared) {
    trace!("timer worker running");
    loop {
        shared.amount.wait();
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        // Sleep until the earliest due-time; any structural change posts
        // `work` so a fresher `latest` is picked up.
        loop {
            let latest = shared.latest.load(Ordering::Acquire);
            if clock::now() >= latest {
                break;
            }
            if latest == u64::MAX {
                shared.work.wait();
            } else {
                shared.work.wait_until(latest);
            }
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
        }

        let fired = {
            let mut state = shared.state.lock().unwrap();
            let now = clock::now();
            if state.timeouts.root_due().is_some_and(|due| due <= now) {
                let slot = state.timeouts.pop_root().expect("non-empty heap");
                slot.cell.index.store(DEAD, Ordering::Release);
                refresh_latest(shared, &state);
                Some(Fired::Timeout(slot))
            } else if state.intervals.root_due().is_some_and(|due| due <= now) {
                let slot = state.intervals.pop_root().expect("non-empty heap");
                slot.cell.index.store(FIRING, Ordering::Release);
                refresh_latest(shared, &state);
                Some(Fired::Interval(slot))
            } else {
                // The token belonged to a timer cancelled in the meantime.
                None
            }
        };

        match fired {
            None => continue,
            Some(Fired::Timeout(mut slot)) => {
                let mask = block_signals();
                (slot.func)();
                restore_signals(mask);
            }
            Some(Fired::Interval(mut slot)) => {
                let mask = block_signals();
                (slot.func)();
                restore_signals(mask);

                let last = slot.count == 1;
                let cancelled = slot.cell.cancelled.swap(false, Ordering::AcqRel);
                if last || cancelled {
                    slot.cell.index.store(DEAD, Ordering::Release);
                } else {
                    slot.base += slot.interval;
                    if slot.count > 0 {
                        slot.count -= 1;
                    }
                    let mut state = shared.state.lock().unwrap();
                    state.intervals.push(slot);
                    refresh_latest(shared, &state);
                    drop(state);
                    shared.amount.post();
                    shared.work.post();
                }
            }
        }
    }
}

/// Block every signal for the duration of a callback.
fn block_signals() -> libc::sigset_t {
    // SAFETY: writes two sigsets and this thread's mask.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        let mut old: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_SETMASK, &set, &mut old);
        old
    }
}

fn restore_signals(old: libc::sigset_t) {
    // SAFETY: restores the mask captured by block_signals.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &old, ptr::null_mut());
    }
}
