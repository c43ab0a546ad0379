use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::time::{after, Timers, IMMEDIATELY, NANOS_PER_MILLI};

mod util;

#[test]
fn timeouts_fire_in_due_order() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();
    let started = Instant::now();

    for ms in [100u64, 50, 200, 10, 150] {
        let fired = Arc::clone(&fired);
        let tx = tx.clone();
        timers.add_timeout(after(Duration::from_millis(ms)), move || {
            let mut fired = fired.lock().unwrap();
            fired.push(ms);
            if fired.len() == 5 {
                let _ = tx.send(());
            }
        });
    }

    util::expect_signal(&rx);
    let elapsed = started.elapsed();
    assert_eq!(&*fired.lock().unwrap(), &[10, 50, 100, 150, 200]);
    // The last timer was due at 200ms; allow generous scheduling slack.
    assert!(elapsed >= Duration::from_millis(195), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);

    timers.stop_sync();
}

#[test]
fn immediate_timeout_fires_at_once() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let (tx, rx) = channel();
    timers.add_timeout(IMMEDIATELY, move || {
        let _ = tx.send(());
    });
    util::expect_signal(&rx);

    timers.stop_sync();
}

#[test]
fn cancelled_timeout_never_fires() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let (tx, rx) = channel();
    let keep_tx = tx.clone();
    let keep = timers.add_timeout(after(Duration::from_millis(50)), move || {
        let _ = keep_tx.send("kept");
    });
    let cancel = timers.add_timeout(after(Duration::from_millis(80)), move || {
        let _ = tx.send("cancelled");
    });

    assert!(timers.cancel_timeout(&cancel));
    // The handle is stale now.
    assert!(!timers.cancel_timeout(&cancel));

    assert_eq!(util::expect_signal(&rx), "kept");
    util::expect_no_signal(&rx);
    // Fired timers leave stale handles too.
    assert!(!timers.cancel_timeout(&keep));
    assert_eq!(timers.pending_timeouts(), 0);

    timers.stop_sync();
}

#[test]
fn interval_respects_its_count() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let (tx, rx) = channel();
    let hits = Arc::new(Mutex::new(0u32));
    let counting = Arc::clone(&hits);
    timers.add_interval(
        after(Duration::from_millis(10)),
        20 * NANOS_PER_MILLI,
        3,
        move || {
            let mut hits = counting.lock().unwrap();
            *hits += 1;
            if *hits == 3 {
                let _ = tx.send(());
            }
        },
    );

    util::expect_signal(&rx);
    // Give a would-be fourth firing time to (not) happen.
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(*hits.lock().unwrap(), 3);
    assert_eq!(timers.pending_intervals(), 0);

    timers.stop_sync();
}

#[test]
fn cancelled_interval_stops_repeating() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let hits = Arc::new(Mutex::new(0u32));
    let counting = Arc::clone(&hits);
    let handle = timers.add_interval(
        after(Duration::from_millis(10)),
        10 * NANOS_PER_MILLI,
        0,
        move || {
            *counting.lock().unwrap() += 1;
        },
    );

    std::thread::sleep(Duration::from_millis(60));
    assert!(timers.cancel_interval(&handle));
    let seen = *hits.lock().unwrap();
    assert!(seen > 0);

    std::thread::sleep(Duration::from_millis(60));
    assert!(*hits.lock().unwrap() <= seen + 1);
    assert_eq!(timers.pending_intervals(), 0);

    timers.stop_sync();
}

#[test]
fn reopened_timeout_moves_its_due_time() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let (tx, rx) = channel();
    let started = Instant::now();
    let handle = timers.add_timeout(after(Duration::from_secs(5)), move || {
        let _ = tx.send(());
    });

    {
        let mut timeout = timers.open_timeout(&handle).unwrap();
        timeout.set_due(after(Duration::from_millis(30)));
    }

    util::expect_signal(&rx);
    assert!(started.elapsed() < Duration::from_secs(4));

    timers.stop_sync();
}

#[test]
fn equal_due_times_fire_in_insertion_order() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let due = after(Duration::from_millis(40));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();

    for label in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        timers.add_timeout(due, move || {
            let mut order = order.lock().unwrap();
            order.push(label);
            if order.len() == 3 {
                let _ = tx.send(());
            }
        });
    }

    util::expect_signal(&rx);
    assert_eq!(&*order.lock().unwrap(), &["first", "second", "third"]);

    timers.stop_sync();
}

#[test]
fn cancel_and_rearm_keeps_ordering() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let due = after(Duration::from_millis(50));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();

    let first_order = Arc::clone(&order);
    let first = timers.add_timeout(due, move || {
        first_order.lock().unwrap().push("a");
    });
    let second_order = Arc::clone(&order);
    timers.add_timeout(due, move || {
        second_order.lock().unwrap().push("b");
    });

    // Cancel the head and re-add it with identical parameters; it now
    // sits behind the survivor for the shared due-time.
    assert!(timers.cancel_timeout(&first));
    let readded_order = Arc::clone(&order);
    timers.add_timeout(due, move || {
        let mut order = readded_order.lock().unwrap();
        order.push("a2");
        let _ = tx.send(());
    });

    util::expect_signal(&rx);
    assert_eq!(&*order.lock().unwrap(), &["b", "a2"]);

    timers.stop_sync();
}

#[test]
fn stop_and_restart_resumes_pending_timers() {
    util::init();

    let timers = Timers::new().unwrap();
    timers.start().unwrap();

    let (tx, rx) = channel();
    timers.add_timeout(after(Duration::from_millis(100)), move || {
        let _ = tx.send(());
    });

    timers.stop_sync();
    assert_eq!(timers.pending_timeouts(), 1);

    timers.start().unwrap();
    util::expect_signal(&rx);

    timers.stop_sync();
}
