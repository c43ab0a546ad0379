use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::event_loop::{EventHandler, EventLoop, Shutdown};
use crate::net::addr::{self, Addr, AddrEntry, AddrList, Hints, OpenMode, ResolveRequest};
use crate::storage::{Chunk, Frame, Storage};
use crate::sys::socket;
use crate::{Interest, Ready};

/// Everything a [`TcpSocket`] reports to its event callback.
///
/// Events arrive on the owning loop's dispatcher thread (connect failures
/// out of asynchronous resolution arrive on the resolver thread instead).
/// The socket lock is released while the callback runs, so callbacks may
/// freely call back into the socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TcpEvent {
    /// The connection is established.
    Open,
    /// Bytes are readable; call [`TcpSocket::read`] until it returns 0.
    Data,
    /// The socket became writable and the send queue is empty.
    CanSend,
    /// The peer closed its write half. Unless the socket was opened with
    /// [`TcpOptions::allow_half_open`], closing starts now.
    ReadClose,
    /// The connection is fully down. [`TcpSocket::take_error`] returns the
    /// error that caused it, if any.
    Close,
    /// Kernel resources (descriptor, registration) are released.
    Deinit,
    /// The socket is detached from its loop; the last user handle now owns
    /// what is left.
    Free,
}

/// Configuration for [`TcpSocket::open`] and [`TcpServer::listen`].
///
/// A destination is either a pre-resolved [`AddrList`] or a
/// hostname/service pair handed to the resolver. Without an
/// [`EventLoop`], the endpoint allocates and starts one of its own and
/// shuts it down when it is freed.
///
/// [`TcpServer::listen`]: crate::net::TcpServer::listen
#[derive(Debug, Default)]
pub struct TcpOptions {
    pub(crate) addrs: Option<AddrList>,
    pub(crate) host: Option<(String, String)>,
    pub(crate) hints: Option<Hints>,
    pub(crate) event_loop: Option<EventLoop>,
    pub(crate) manual_flush: bool,
    pub(crate) allow_half_open: bool,
    pub(crate) manual_free: bool,
}

impl TcpOptions {
    /// Empty options; a destination must be supplied before use.
    pub fn new() -> TcpOptions {
        TcpOptions::default()
    }

    /// Use a pre-resolved candidate list.
    pub fn addrs(mut self, addrs: AddrList) -> TcpOptions {
        self.addrs = Some(addrs);
        self
    }

    /// Use a single known address.
    pub fn addr(self, addr: SocketAddr) -> TcpOptions {
        self.addrs(vec![AddrEntry::tcp(addr)])
    }

    /// Resolve `hostname`/`service` instead of using a pre-resolved list.
    ///
    /// [`TcpSocket::open`] resolves asynchronously and connects from the
    /// resolver thread; [`TcpServer::listen`] resolves in place.
    ///
    /// [`TcpServer::listen`]: crate::net::TcpServer::listen
    pub fn host(mut self, hostname: &str, service: &str) -> TcpOptions {
        self.host = Some((hostname.to_owned(), service.to_owned()));
        self
    }

    /// Override the resolution hints (defaults to TCP hints).
    pub fn hints(mut self, hints: Hints) -> TcpOptions {
        self.hints = Some(hints);
        self
    }

    /// Attach to an existing loop instead of allocating one.
    pub fn event_loop(mut self, event_loop: &EventLoop) -> TcpOptions {
        self.event_loop = Some(event_loop.clone());
        self
    }

    /// Do not flush the send queue on writability edges; only
    /// [`TcpSocket::send`] and [`TcpSocket::flush`] write out.
    pub fn manual_flush(mut self, on: bool) -> TcpOptions {
        self.manual_flush = on;
        self
    }

    /// Keep the socket open for writing after the peer closes its write
    /// half.
    pub fn allow_half_open(mut self, on: bool) -> TcpOptions {
        self.allow_half_open = on;
        self
    }

    /// Suppress the automatic [`TcpEvent::Free`] after close; the caller
    /// finishes teardown with [`TcpSocket::free`].
    pub fn manual_free(mut self, on: bool) -> TcpOptions {
        self.manual_free = on;
        self
    }

    pub(crate) fn take_loop(&mut self) -> io::Result<(EventLoop, bool)> {
        match self.event_loop.take() {
            Some(event_loop) => Ok((event_loop, false)),
            None => {
                let event_loop = EventLoop::new()?;
                event_loop.start()?;
                Ok((event_loop, true))
            }
        }
    }
}

pub(crate) struct State {
    pub(crate) fd: Option<OwnedFd>,
    token: Option<crate::Token>,
    queue: Storage,
    opened: bool,
    closing: bool,
    closing_fast: bool,
    shut_wr: bool,
    read_closed: bool,
    can_send: bool,
    close_guard: bool,
    free_done: bool,
    freed: bool,
    err: Option<io::Error>,
}

impl State {
    fn new() -> State {
        State {
            fd: None,
            token: None,
            queue: Storage::new(),
            opened: false,
            closing: false,
            closing_fast: false,
            shut_wr: false,
            read_closed: false,
            can_send: false,
            close_guard: false,
            free_done: false,
            freed: false,
            err: None,
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    on_event: Box<dyn Fn(&TcpSocket, TcpEvent) + Send + Sync>,
    event_loop: EventLoop,
    alloc_loop: bool,
    manual_flush: bool,
    allow_half_open: bool,
    manual_free: bool,
}

/// A non-blocking TCP connection bound to an [`EventLoop`].
///
/// The socket moves through connect, open and close states driven by the
/// loop thread; the user observes it purely through [`TcpEvent`]s and the
/// `send`/`read` calls. Outgoing data is queued as [`Frame`]s and flushed
/// head-first whenever the socket is writable, falling back to `sendfile`
/// for file-descriptor frames.
///
/// `TcpSocket` is a cheap clonable handle. The loop keeps its own handle
/// for dispatch until the socket closes, so user handles may be dropped
/// freely; the object is gone once it closed and every handle is gone.
#[derive(Clone)]
pub struct TcpSocket {
    shared: Arc<Shared>,
}

pub(crate) struct Dispatcher(pub(crate) TcpSocket);

impl EventHandler for Dispatcher {
    fn on_event(&self, ready: Ready) {
        self.0.dispatch(ready);
    }
}

impl TcpSocket {
    /// Open a connection described by `options`.
    ///
    /// With a pre-resolved list the connect iteration runs here: each
    /// candidate is tried in order, transient resets retry the same
    /// candidate up to 3 times, and the last error surfaces if the list is
    /// exhausted. With a hostname the call returns immediately and the
    /// iteration runs after asynchronous resolution; failures then surface
    /// as a [`TcpEvent::Close`] carrying the error.
    ///
    /// `on_event` receives every [`TcpEvent`] for the socket's lifetime.
    pub fn open<F>(mut options: TcpOptions, on_event: F) -> io::Result<TcpSocket>
    where
        F: Fn(&TcpSocket, TcpEvent) + Send + Sync + 'static,
    {
        let (event_loop, alloc_loop) = options.take_loop()?;
        let socket = TcpSocket {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new()),
                on_event: Box::new(on_event),
                event_loop,
                alloc_loop,
                manual_flush: options.manual_flush,
                allow_half_open: options.allow_half_open,
                manual_free: options.manual_free,
            }),
        };

        if let Some(list) = options.addrs {
            if let Err(err) = socket.connect_list(&list) {
                socket.release_loop();
                return Err(err);
            }
        } else if let Some((hostname, service)) = options.host {
            let request = ResolveRequest {
                hostname: Some(hostname),
                service: Some(service),
                hints: options.hints.unwrap_or_else(Hints::tcp),
            };
            let resolving = socket.clone();
            addr::resolve_async(request, move |res| {
                if let Err(err) = res.and_then(|list| resolving.connect_list(&list)) {
                    resolving.fail(err);
                }
            })?;
        } else {
            socket.release_loop();
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no destination given",
            ));
        }
        Ok(socket)
    }

    /// Build an already-connected socket around an accepted descriptor.
    pub(crate) fn adopt(
        fd: OwnedFd,
        on_event: Box<dyn Fn(&TcpSocket, TcpEvent) + Send + Sync>,
        manual_flush: bool,
        allow_half_open: bool,
        manual_free: bool,
        event_loop: EventLoop,
    ) -> io::Result<TcpSocket> {
        let raw_fd = fd.as_raw_fd();
        let mut state = State::new();
        state.fd = Some(fd);
        state.opened = true;
        state.can_send = true;

        let socket = TcpSocket {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                on_event,
                event_loop: event_loop.clone(),
                alloc_loop: false,
                manual_flush,
                allow_half_open,
                manual_free,
            }),
        };
        {
            let mut state = socket.shared.state.lock().unwrap();
            let token = event_loop.register(
                raw_fd,
                Interest::READABLE | Interest::WRITABLE,
                Arc::new(Dispatcher(socket.clone())),
            )?;
            state.token = Some(token);
        }
        socket.emit(TcpEvent::Open);
        Ok(socket)
    }

    fn connect_list(&self, list: &[AddrEntry]) -> io::Result<()> {
        let (fd, entry) = addr::open_socket(list, OpenMode::Connect)?;
        trace!("connecting to {:?}", entry.addr);
        let raw_fd = fd.as_raw_fd();

        // Hold the lock across registration so the first dispatch cannot
        // outrun the stored token.
        let mut state = self.shared.state.lock().unwrap();
        state.fd = Some(fd);
        let res = self.shared.event_loop.register(
            raw_fd,
            Interest::READABLE | Interest::WRITABLE,
            Arc::new(Dispatcher(self.clone())),
        );
        match res {
            Ok(token) => {
                state.token = Some(token);
                Ok(())
            }
            Err(err) => {
                state.fd = None;
                Err(err)
            }
        }
    }

    /// Fail the socket out of band (bad resolution, failed connect).
    fn fail(&self, err: io::Error) {
        self.shared.state.lock().unwrap().err = Some(err);
        self.terminate();
    }

    fn emit(&self, event: TcpEvent) {
        (self.shared.on_event)(self, event);
    }

    fn dispatch(&self, ready: Ready) {
        let mut pending: Vec<TcpEvent> = Vec::new();
        let mut start_close = false;
        let mut terminal = false;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.freed {
                return;
            }
            let fd = match state.fd.as_ref() {
                Some(fd) => fd.as_raw_fd(),
                None => return,
            };

            if ready.is_error() {
                state.err = socket::take_error(fd)
                    .ok()
                    .flatten()
                    .or_else(|| Some(io::Error::from(io::ErrorKind::ConnectionReset)));
                terminal = true;
            }

            if !terminal && !state.opened && ready.is_writable() {
                match socket::take_error(fd) {
                    Ok(None) => {
                        state.opened = true;
                        state.can_send = true;
                        pending.push(TcpEvent::Open);
                    }
                    Ok(Some(err)) | Err(err) => {
                        state.err = Some(err);
                        terminal = true;
                    }
                }
            }

            if !terminal {
                if ready.is_readable() && state.opened {
                    pending.push(TcpEvent::Data);
                }

                if ready.is_read_closed() && !state.read_closed {
                    state.read_closed = true;
                    pending.push(TcpEvent::ReadClose);
                    if !self.shared.allow_half_open {
                        start_close = true;
                    }
                }

                if ready.is_writable() && state.opened {
                    state.can_send = true;
                    if !self.shared.manual_flush {
                        if let Err(err) = flush_queue(&mut state) {
                            state.err = Some(err);
                            terminal = true;
                        }
                    }
                    if !terminal && state.queue.is_empty() && !state.shut_wr {
                        pending.push(TcpEvent::CanSend);
                    }
                }
            }

            if !terminal && state.closing && state.opened && state.queue.is_empty() && !state.shut_wr
            {
                state.shut_wr = true;
                let _ = socket::shutdown_write(fd);
            }

            if !terminal && state.shut_wr && state.read_closed {
                terminal = true;
            }
            if !terminal && ready.is_write_closed() && state.read_closed {
                terminal = true;
            }
        }

        for event in pending {
            self.emit(event);
        }
        if start_close {
            self.close();
        }
        if terminal {
            self.terminate();
        }
    }

    /// Queue `frame` and flush as much of the queue as the socket accepts.
    ///
    /// Only queue-level failures (a frame that cannot be mapped) are
    /// returned; an I/O failure transitions the socket to close and is
    /// delivered with [`TcpEvent::Close`].
    pub fn send(&self, frame: Frame) -> io::Result<()> {
        let flushed = {
            let mut state = self.shared.state.lock().unwrap();
            if state.freed || state.closing || state.closing_fast {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket is closing",
                ));
            }
            state.queue.add(frame)?;
            if state.opened && state.can_send {
                flush_queue(&mut state)
            } else {
                Ok(())
            }
        };
        if let Err(err) = flushed {
            self.fail(err);
        }
        Ok(())
    }

    /// Write out queued frames while the socket accepts them.
    pub fn flush(&self) -> io::Result<()> {
        let flushed = {
            let mut state = self.shared.state.lock().unwrap();
            if state.freed {
                return Ok(());
            }
            if state.opened && state.can_send {
                flush_queue(&mut state)
            } else {
                Ok(())
            }
        };
        if let Err(err) = flushed {
            self.fail(err);
        }
        Ok(())
    }

    /// Pull readable bytes into `buf`, until it is full or the kernel has
    /// nothing more.
    ///
    /// Returns the number of bytes read; 0 means nothing was available
    /// (end-of-stream is reported through [`TcpEvent::ReadClose`], not
    /// here).
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.shared.state.lock().unwrap();
        let fd = match state.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(0),
        };
        let mut total = 0;
        while total < buf.len() {
            match socket::recv(fd, &mut buf[total..]) {
                // End of stream; the readable-closed edge reports it.
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Close gracefully once the send queue drains.
    pub fn close(&self) {
        let terminal = {
            let mut state = self.shared.state.lock().unwrap();
            if state.freed || state.closing_fast {
                return;
            }
            state.closing = true;
            if state.opened && state.queue.is_empty() && !state.shut_wr {
                state.shut_wr = true;
                if let Some(fd) = state.fd.as_ref() {
                    let _ = socket::shutdown_write(fd.as_raw_fd());
                }
            }
            state.shut_wr && state.read_closed
        };
        if terminal {
            self.terminate();
        }
    }

    /// Close immediately, discarding queued bytes.
    pub fn force_close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.freed {
                return;
            }
            state.closing_fast = true;
            state.queue.clear();
        }
        self.terminate();
    }

    /// Tear the socket down, emitting [`TcpEvent::Free`] if it has not
    /// fired yet.
    ///
    /// Sockets opened with [`TcpOptions::manual_free`] call this when they
    /// are done with the object after [`TcpEvent::Close`]; for everything
    /// else it is a forced [`TcpSocket::force_close`].
    pub fn free(&self) {
        let live = !self.shared.state.lock().unwrap().freed;
        if live {
            self.force_close();
        }
        let emit_free = {
            let mut state = self.shared.state.lock().unwrap();
            if state.free_done {
                false
            } else {
                state.free_done = true;
                true
            }
        };
        if emit_free {
            self.emit(TcpEvent::Free);
            self.release_loop();
        }
    }

    /// The terminal transition: deregister, close the descriptor, emit the
    /// close event pair exactly once.
    fn terminate(&self) {
        let mut events: Vec<TcpEvent> = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.freed {
                return;
            }
            state.freed = true;
            if let (Some(token), Some(fd)) = (state.token.take(), state.fd.as_ref()) {
                let _ = self.shared.event_loop.deregister(token, fd.as_raw_fd());
            }
            state.fd = None;
            state.queue.clear();
            if !state.close_guard {
                state.close_guard = true;
                events.push(TcpEvent::Close);
            }
            events.push(TcpEvent::Deinit);
            if !self.shared.manual_free && !state.free_done {
                state.free_done = true;
                events.push(TcpEvent::Free);
            }
        }
        let had_free = events.contains(&TcpEvent::Free);
        for event in events {
            self.emit(event);
        }
        if had_free {
            self.release_loop();
        }
    }

    fn release_loop(&self) {
        if self.shared.alloc_loop {
            self.shared.event_loop.shutdown(Shutdown::Async);
        }
    }

    /// The most recent I/O error, cleared on read.
    pub fn take_error(&self) -> Option<io::Error> {
        self.shared.state.lock().unwrap().err.take()
    }

    /// Bytes waiting in the send queue.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().queue.bytes()
    }

    /// The loop this socket dispatches on.
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    fn with_fd<T>(&self, f: impl FnOnce(RawFd) -> io::Result<T>) -> io::Result<T> {
        let state = self.shared.state.lock().unwrap();
        match state.fd.as_ref() {
            Some(fd) => f(fd.as_raw_fd()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Toggle `TCP_NODELAY`.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.with_fd(|fd| socket::set_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on))
    }

    /// Toggle `TCP_CORK`.
    pub fn set_cork(&self, on: bool) -> io::Result<()> {
        self.with_fd(|fd| socket::set_bool(fd, libc::IPPROTO_TCP, libc::TCP_CORK, on))
    }

    /// Enable keepalive probing: first probe after `idle` seconds, then
    /// every `interval` seconds, giving up after `retries` misses.
    pub fn set_keepalive(&self, idle: u32, interval: u32, retries: u32) -> io::Result<()> {
        self.with_fd(|fd| {
            socket::set_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, true)?;
            socket::set_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle as libc::c_int)?;
            socket::set_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval as libc::c_int)?;
            socket::set_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, retries as libc::c_int)
        })
    }

    /// Disable keepalive probing.
    pub fn disable_keepalive(&self) -> io::Result<()> {
        self.with_fd(|fd| socket::set_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, false))
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> io::Result<Addr> {
        self.with_fd(|fd| socket::local_addr(fd)?.to_addr())
    }

    /// The peer address of the connection.
    pub fn peer_addr(&self) -> io::Result<Addr> {
        self.with_fd(|fd| socket::peer_addr(fd)?.to_addr())
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        fmt.debug_struct("TcpSocket")
            .field("opened", &state.opened)
            .field("closing", &(state.closing | state.closing_fast))
            .field("queued", &state.queue.bytes())
            .finish()
    }
}

/// Flush the head of the send queue until it runs dry or the socket stops
/// accepting.
fn flush_queue(state: &mut State) -> io::Result<()> {
    let fd = match state.fd.as_ref() {
        Some(fd) => fd.as_raw_fd(),
        None => return Ok(()),
    };
    loop {
        let res = match state.queue.head() {
            None => break,
            Some(head) => match head.chunk() {
                Chunk::Slice(buf) => socket::send(fd, buf),
                Chunk::File {
                    fd: file,
                    offset,
                    len,
                } => socket::sendfile(fd, file, offset, len),
            },
        };
        match res {
            Ok(0) => break,
            Ok(n) => state.queue.drain(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                state.can_send = false;
                break;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    state.queue.finish();
    Ok(())
}
