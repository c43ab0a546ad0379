use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};

use evio::{EventHandler, EventLoop, Interest, Ready, Shutdown};

mod util;

fn eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    assert!(fd >= 0);
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn arm(fd: &OwnedFd, value: u64) {
    let buf = value.to_ne_bytes();
    let res = unsafe {
        libc::write(
            fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(res, 8);
}

struct Recorder {
    hits: AtomicUsize,
    readable: AtomicUsize,
    tx: Mutex<Sender<()>>,
}

impl Recorder {
    fn new(tx: Sender<()>) -> Recorder {
        Recorder {
            hits: AtomicUsize::new(0),
            readable: AtomicUsize::new(0),
            tx: Mutex::new(tx),
        }
    }
}

impl EventHandler for Recorder {
    fn on_event(&self, ready: Ready) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if ready.is_readable() {
            self.readable.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.tx.lock().unwrap().send(());
    }
}

#[test]
fn start_and_synchronous_shutdown() {
    util::init();

    let event_loop = EventLoop::with_capacity(1).unwrap();
    event_loop.start().unwrap();
    // Joins the dispatcher; returning proves the worker exited.
    event_loop.shutdown(Shutdown::Sync);
    // A second request is harmless.
    event_loop.shutdown(Shutdown::Sync);
}

#[test]
fn asynchronous_shutdown() {
    util::init();

    let event_loop = EventLoop::new().unwrap();
    event_loop.start().unwrap();
    event_loop.shutdown(Shutdown::Async);
}

#[test]
fn dispatches_every_armed_eventfd() {
    util::init();

    let event_loop = EventLoop::new().unwrap();
    event_loop.start().unwrap();

    let (tx, rx) = channel();
    let fds: Vec<OwnedFd> = (0..5).map(|_| eventfd()).collect();
    let recorder = Arc::new(Recorder::new(tx));

    for fd in &fds {
        event_loop
            .register(fd.as_raw_fd(), Interest::READABLE, recorder.clone())
            .unwrap();
    }
    for (i, fd) in fds.iter().enumerate() {
        arm(fd, i as u64 + 1);
    }

    for _ in 0..5 {
        util::expect_signal(&rx);
    }
    assert_eq!(recorder.hits.load(Ordering::SeqCst), 5);
    assert_eq!(recorder.readable.load(Ordering::SeqCst), 5);

    event_loop.shutdown(Shutdown::Sync);
}

#[test]
fn deregistered_descriptor_goes_quiet() {
    util::init();

    let event_loop = EventLoop::new().unwrap();
    event_loop.start().unwrap();

    let (tx, rx) = channel();
    let fd = eventfd();
    let recorder = Arc::new(Recorder::new(tx));
    let token = event_loop
        .register(fd.as_raw_fd(), Interest::READABLE, recorder.clone())
        .unwrap();

    arm(&fd, 1);
    util::expect_signal(&rx);

    event_loop.deregister(token, fd.as_raw_fd()).unwrap();
    arm(&fd, 1);
    util::expect_no_signal(&rx);

    event_loop.shutdown(Shutdown::Sync);
}

#[test]
fn edge_triggered_batches_coalesce() {
    util::init();

    let event_loop = EventLoop::new().unwrap();
    event_loop.start().unwrap();

    let (tx, rx) = channel();
    let fd = eventfd();
    let recorder = Arc::new(Recorder::new(tx));
    event_loop
        .register(fd.as_raw_fd(), Interest::READABLE, recorder.clone())
        .unwrap();

    // Re-arming after each delivery produces a fresh edge every time.
    for _ in 0..3 {
        arm(&fd, 1);
        util::expect_signal(&rx);
        let mut buf = [0u8; 8];
        let res = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(res, 8);
    }
    assert_eq!(recorder.hits.load(Ordering::SeqCst), 3);

    event_loop.shutdown(Shutdown::Sync);
}
