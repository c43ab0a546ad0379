use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, trace};

use crate::sys::{self, Selector, Waker};
use crate::{Interest, Ready, Token};

/// Token reserved for the loop's own wakeup channel.
const WAKE: Token = Token(0);

/// Receives the readiness events of one registered descriptor.
///
/// Implementations are registered with [`EventLoop::register`] and invoked
/// on the loop's dispatcher thread, one call at a time per registration.
/// Handlers must not block: the dispatcher cannot make progress for any
/// other registration while a handler runs.
pub trait EventHandler: Send + Sync {
    /// Called with the readiness observed for the registered descriptor.
    fn on_event(&self, ready: Ready);
}

/// How [`EventLoop::shutdown`] brings the dispatcher down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// Wake the dispatcher and join it before returning.
    Sync,
    /// Wake the dispatcher and let it wind down on its own.
    Async,
}

struct Shared {
    selector: Selector,
    waker: Waker,
    capacity: usize,
    handlers: Mutex<HashMap<usize, Arc<dyn EventHandler>>>,
    next_token: AtomicUsize,
    stopping: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// An epoll multiplexer with one dispatcher thread.
///
/// The loop owns its readiness handle and a wakeup channel. Descriptors are
/// registered edge-triggered together with an [`EventHandler`]; once
/// [`start`] has spawned the dispatcher, readiness is delivered to the
/// handlers on that thread. The wakeup channel is registered first, under a
/// reserved token, and is never visible to user handlers.
///
/// `EventLoop` is a cheap clonable handle; all clones drive the same loop.
/// The kernel handles and the handler table are released when the
/// dispatcher has exited and the last handle is gone.
///
/// [`start`]: EventLoop::start
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// A loop with the default ready-batch capacity of 64 entries.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_capacity(64)
    }

    /// A loop whose dispatcher picks up at most `capacity` ready entries
    /// per readiness wait.
    pub fn with_capacity(capacity: usize) -> io::Result<EventLoop> {
        let selector = Selector::new()?;
        let waker = Waker::new()?;
        // The wakeup channel is always the first registration.
        selector.register(waker.as_raw_fd(), WAKE, Interest::READABLE)?;
        Ok(EventLoop {
            shared: Arc::new(Shared {
                selector,
                waker,
                capacity: capacity.max(1),
                handlers: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(1),
                stopping: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Spawn the dispatcher thread.
    pub fn start(&self) -> io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("evio-loop".to_owned())
            .spawn(move || run(shared))?;
        *self.shared.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Register `fd` with the given interest and handler.
    ///
    /// Registrations are edge-triggered. The returned token names the
    /// registration for [`reregister`]/[`deregister`].
    ///
    /// [`reregister`]: EventLoop::reregister
    /// [`deregister`]: EventLoop::deregister
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) -> io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(token.0, handler);
        if let Err(err) = self.shared.selector.register(fd, token, interest) {
            self.shared.handlers.lock().unwrap().remove(&token.0);
            return Err(err);
        }
        trace!("registered fd {} as {:?}", fd, token);
        Ok(token)
    }

    /// Change the interest of an existing registration.
    pub fn reregister(&self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.shared.selector.reregister(fd, token, interest)
    }

    /// Remove a registration.
    ///
    /// The descriptor must still be open. Events already picked up for the
    /// token are dropped, not dispatched.
    pub fn deregister(&self, token: Token, fd: RawFd) -> io::Result<()> {
        let res = self.shared.selector.deregister(fd);
        self.shared.handlers.lock().unwrap().remove(&token.0);
        trace!("deregistered fd {} ({:?})", fd, token);
        res
    }

    /// Stop the dispatcher through the wakeup channel.
    ///
    /// [`Shutdown::Sync`] joins the dispatcher before returning; called
    /// from inside a handler it degrades to [`Shutdown::Async`], since the
    /// dispatcher cannot join itself.
    pub fn shutdown(&self, how: Shutdown) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            error!("failed to wake event loop for shutdown: {}", err);
        }
        if how == Shutdown::Sync {
            let handle = self.shared.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                } else {
                    *self.shared.worker.lock().unwrap() = Some(handle);
                }
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

fn run(shared: Arc<Shared>) {
    let mut events = sys::Events::with_capacity(shared.capacity);
    loop {
        if let Err(err) = sys::retry(|| shared.selector.select(&mut events, None)) {
            // Only a broken readiness handle gets us here.
            error!("event loop wait failed: {}", err);
            return;
        }

        for event in events.iter() {
            let token = Token(event.u64 as usize);
            let ready = Ready(event.events);

            if token == WAKE {
                let _ = shared.waker.drain();
                if shared.stopping.load(Ordering::Acquire) {
                    trace!("event loop dispatcher exiting");
                    return;
                }
                continue;
            }

            let handler = shared.handlers.lock().unwrap().get(&token.0).cloned();
            match handler {
                Some(handler) => handler.on_event(ready),
                // Deregistered while the batch was in flight.
                None => trace!("dropping event for stale {:?}", token),
            }
        }
    }
}
