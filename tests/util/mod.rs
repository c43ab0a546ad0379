// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Once;
use std::time::Duration;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Wait up to five seconds for a signal from a callback thread.
pub fn expect_signal<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("timed out waiting for event")
}

/// Assert that no signal arrives for a little while.
pub fn expect_no_signal<T>(rx: &Receiver<T>) {
    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "unexpected event"
    );
}
