//! Clock helpers and the timer service.

mod clock;
mod timers;

pub use self::clock::{after, now, IMMEDIATELY, NANOS_PER_MICRO, NANOS_PER_MILLI, NANOS_PER_SEC};
pub use self::timers::{IntervalRef, TimeoutRef, TimerHandle, Timers};
