use std::time::Duration;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;
/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;
/// Nanoseconds per microsecond.
pub const NANOS_PER_MICRO: u64 = 1_000;

/// Due-time sentinel for "fire as soon as the worker gets to it".
///
/// Small enough to be in the past on any real clock, while never a value
/// [`now`] can produce.
pub const IMMEDIATELY: u64 = 2;

/// The current time in absolute nanoseconds.
///
/// Read from `CLOCK_REALTIME`, the clock the timer service's timed waits
/// run against.
pub fn now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: writes one timespec; CLOCK_REALTIME always exists.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// The absolute due-time `duration` from now.
pub fn after(duration: Duration) -> u64 {
    now() + duration.as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::{after, now, IMMEDIATELY};
    use std::time::Duration;

    #[test]
    fn clock_is_monotonic_enough() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!(a > IMMEDIATELY);
    }

    #[test]
    fn after_adds() {
        let due = after(Duration::from_secs(1));
        assert!(due > now());
    }
}
