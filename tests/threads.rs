use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};

use evio::threads::{Semaphore, ThreadGroup, ThreadPool};

mod util;

#[test]
fn group_start_runs_every_worker() {
    util::init();

    let started = Arc::new(AtomicUsize::new(0));
    let park = Arc::new(Semaphore::new(0).unwrap());

    let mut group = ThreadGroup::new();
    let counting = Arc::clone(&started);
    let parking = Arc::clone(&park);
    group
        .start(4, move || {
            counting.fetch_add(1, Ordering::SeqCst);
            // Sit on a cancellation point until the group is torn down.
            parking.wait();
        })
        .unwrap();
    assert_eq!(group.len(), 4);

    // Workers run concurrently; wait for all of them to check in.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while started.load(Ordering::SeqCst) != 4 {
        assert!(std::time::Instant::now() < deadline);
        std::thread::yield_now();
    }

    group.shutdown_sync();
    assert!(group.is_empty());
    assert_eq!(started.load(Ordering::SeqCst), 4);
}

#[test]
fn group_cancels_trailing_subset() {
    util::init();

    let park = Arc::new(Semaphore::new(0).unwrap());
    let mut group = ThreadGroup::new();

    let parking = Arc::clone(&park);
    group.start(3, move || parking.wait()).unwrap();
    let parking = Arc::clone(&park);
    group.start(2, move || parking.wait()).unwrap();
    assert_eq!(group.len(), 5);

    group.cancel_sync(2);
    assert_eq!(group.len(), 3);

    group.shutdown_sync();
    assert!(group.is_empty());
}

#[test]
fn group_start_zero_is_a_noop() {
    util::init();

    let mut group = ThreadGroup::new();
    group.start(0, || {}).unwrap();
    assert!(group.is_empty());
}

#[test]
fn pool_fifo_for_a_single_submitter() {
    util::init();

    let pool = ThreadPool::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let order = Arc::clone(&order);
        pool.submit(move || order.lock().unwrap().push(i));
    }
    assert_eq!(pool.len(), 10);
    assert_eq!(pool.tokens(), 10);

    for _ in 0..10 {
        pool.try_work();
    }
    assert!(pool.is_empty());
    assert_eq!(&*order.lock().unwrap(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
}

#[test]
fn pool_try_work_on_empty_queue_is_a_noop() {
    util::init();

    let pool = ThreadPool::new().unwrap();
    pool.try_work();
    assert!(pool.is_empty());
}

#[test]
fn pool_counter_under_eight_workers() {
    util::init();

    let pool = ThreadPool::new().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));

    let mut group = ThreadGroup::new();
    let working = pool.clone();
    group.start(8, move || loop {
        working.work();
    })
    .unwrap();

    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        let tx = Arc::clone(&tx);
        pool.submit(move || {
            if counter.fetch_add(100, Ordering::SeqCst) + 100 == 10_000 {
                let _ = tx.lock().unwrap().send(());
            }
        });
    }

    util::expect_signal(&rx);
    assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    // The completion signal fired exactly once.
    util::expect_no_signal(&rx);
    assert!(pool.is_empty());

    group.shutdown_sync();
}

#[test]
fn semaphore_counts_tokens() {
    util::init();

    let sem = Semaphore::new(2).unwrap();
    assert_eq!(sem.value(), 2);
    assert!(sem.try_wait());
    assert!(sem.try_wait());
    assert!(!sem.try_wait());
    sem.post();
    assert_eq!(sem.value(), 1);
    sem.wait();
    assert_eq!(sem.value(), 0);
}

#[test]
fn semaphore_timed_wait_expires() {
    util::init();

    let sem = Semaphore::new(0).unwrap();
    let deadline = evio::time::after(std::time::Duration::from_millis(50));
    let started = std::time::Instant::now();
    assert!(!sem.wait_until(deadline));
    assert!(started.elapsed() >= std::time::Duration::from_millis(40));
}
