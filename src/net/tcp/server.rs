use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::{trace, warn};

use crate::event_loop::{EventHandler, EventLoop, Shutdown};
use crate::net::addr::{self, Addr, Hints, OpenMode};
use crate::net::tcp::socket::{TcpEvent, TcpOptions, TcpSocket};
use crate::sys::socket;
use crate::{Interest, Ready};

/// What a [`TcpServer`] accept callback returns to adopt a connection.
///
/// Carries the event callback and behavior toggles for the accepted
/// [`TcpSocket`]; returning `None` from the accept callback rejects the
/// connection instead and closes its descriptor.
pub struct Accepted {
    pub(crate) on_event: Box<dyn Fn(&TcpSocket, TcpEvent) + Send + Sync>,
    pub(crate) manual_flush: bool,
    pub(crate) allow_half_open: bool,
    pub(crate) manual_free: bool,
}

impl Accepted {
    /// Adopt the connection, delivering its events to `on_event`.
    pub fn new<F>(on_event: F) -> Accepted
    where
        F: Fn(&TcpSocket, TcpEvent) + Send + Sync + 'static,
    {
        Accepted {
            on_event: Box::new(on_event),
            manual_flush: false,
            allow_half_open: false,
            manual_free: false,
        }
    }

    /// See [`TcpOptions::manual_flush`].
    pub fn manual_flush(mut self, on: bool) -> Accepted {
        self.manual_flush = on;
        self
    }

    /// See [`TcpOptions::allow_half_open`].
    pub fn allow_half_open(mut self, on: bool) -> Accepted {
        self.allow_half_open = on;
        self
    }

    /// See [`TcpOptions::manual_free`].
    pub fn manual_free(mut self, on: bool) -> Accepted {
        self.manual_free = on;
        self
    }
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Accepted").finish()
    }
}

struct ServerState {
    fd: Option<OwnedFd>,
    token: Option<crate::Token>,
    freed: bool,
}

struct Shared {
    state: Mutex<ServerState>,
    on_accept: Box<dyn Fn(&TcpServer, &Addr) -> Option<Accepted> + Send + Sync>,
    event_loop: EventLoop,
    alloc_loop: bool,
}

/// A listening TCP socket accepting connections onto its loop.
///
/// On every readable edge the server accepts until the kernel runs dry.
/// Each connection is offered to the accept callback with its peer
/// address; the callback either returns an [`Accepted`] describing the new
/// socket (which is then registered with the server's loop and delivered
/// an [`TcpEvent::Open`]) or `None` to reject it. Per-connection setup
/// failures close the descriptor and accepting continues.
#[derive(Clone)]
pub struct TcpServer {
    shared: Arc<Shared>,
}

struct Dispatcher(TcpServer);

impl EventHandler for Dispatcher {
    fn on_event(&self, ready: Ready) {
        self.0.dispatch(ready);
    }
}

impl TcpServer {
    /// Bind and listen as described by `options`, with the given listen
    /// backlog.
    ///
    /// A hostname destination is resolved in place with passive hints. The
    /// bind iteration mirrors the connect iteration of
    /// [`TcpSocket::open`], with `SO_REUSEADDR` set on each candidate.
    pub fn listen<F>(mut options: TcpOptions, backlog: i32, on_accept: F) -> io::Result<TcpServer>
    where
        F: Fn(&TcpServer, &Addr) -> Option<Accepted> + Send + Sync + 'static,
    {
        let list = match (options.addrs.take(), options.host.take()) {
            (Some(list), _) => list,
            (None, Some((hostname, service))) => {
                let hints = options.hints.unwrap_or_else(Hints::tcp).passive();
                addr::resolve(Some(&hostname), Some(&service), hints)?
            }
            (None, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no address to listen on",
                ))
            }
        };

        let (event_loop, alloc_loop) = options.take_loop()?;
        let server = TcpServer {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState {
                    fd: None,
                    token: None,
                    freed: false,
                }),
                on_accept: Box::new(on_accept),
                event_loop,
                alloc_loop,
            }),
        };

        match server.bind_list(&list, backlog) {
            Ok(()) => Ok(server),
            Err(err) => {
                if alloc_loop {
                    server.shared.event_loop.shutdown(Shutdown::Async);
                }
                Err(err)
            }
        }
    }

    fn bind_list(&self, list: &[addr::AddrEntry], backlog: i32) -> io::Result<()> {
        let (fd, entry) = addr::open_socket(list, OpenMode::Bind)?;
        socket::listen(fd.as_raw_fd(), backlog.max(1))?;
        trace!("listening on {:?}", entry.addr);

        let raw_fd = fd.as_raw_fd();
        // Hold the lock across registration so the first accept batch
        // cannot outrun the stored token.
        let mut state = self.shared.state.lock().unwrap();
        state.fd = Some(fd);
        match self.shared.event_loop.register(
            raw_fd,
            Interest::READABLE,
            Arc::new(Dispatcher(self.clone())),
        ) {
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

    fn dispatch(&self, ready: Ready) {
        if !ready.is_readable() {
            return;
        }
        loop {
            let fd = {
                let state = self.shared.state.lock().unwrap();
                match state.fd.as_ref() {
                    Some(fd) => fd.as_raw_fd(),
                    None => return,
                }
            };
            match socket::accept(fd) {
                Ok((stream, raw)) => {
                    let peer = match raw.to_addr() {
                        Ok(addr) => addr,
                        Err(_) => continue,
                    };
                    match (self.shared.on_accept)(self, &peer) {
                        Some(accepted) => {
                            let res = TcpSocket::adopt(
                                stream,
                                accepted.on_event,
                                accepted.manual_flush,
                                accepted.allow_half_open,
                                accepted.manual_free,
                                self.shared.event_loop.clone(),
                            );
                            if let Err(err) = res {
                                warn!("failed to set up connection from {:?}: {}", peer, err);
                            }
                        }
                        None => trace!("rejected connection from {:?}", peer),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<Addr> {
        let state = self.shared.state.lock().unwrap();
        match state.fd.as_ref() {
            Some(fd) => socket::local_addr(fd.as_raw_fd())?.to_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// The bound port, for servers bound to port 0.
    pub fn local_port(&self) -> io::Result<u16> {
        match self.local_addr()? {
            Addr::Inet(addr) => Ok(addr.port()),
            Addr::Unix(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// The loop connections are accepted onto.
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    /// Stop accepting and close the listening descriptor.
    ///
    /// Connections already accepted are unaffected.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.freed {
            return;
        }
        state.freed = true;
        if let (Some(token), Some(fd)) = (state.token.take(), state.fd.as_ref()) {
            let _ = self.shared.event_loop.deregister(token, fd.as_raw_fd());
        }
        state.fd = None;
        drop(state);
        if self.shared.alloc_loop {
            self.shared.event_loop.shutdown(Shutdown::Async);
        }
    }

    /// Alias of [`TcpServer::close`]; the object itself is freed when the
    /// last handle drops.
    pub fn free(&self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        fmt.debug_struct("TcpServer")
            .field("listening", &state.fd.is_some())
            .finish()
    }
}
