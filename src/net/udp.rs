use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::event_loop::{EventHandler, EventLoop, Shutdown};
use crate::net::addr::{self, Addr, AddrEntry, AddrList, Hints, OpenMode};
use crate::sys::socket;
use crate::{Interest, Ready};

/// Where a datagram came from, shaped like the resolver's output.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    /// Address family of the source.
    pub family: i32,
    /// Always a datagram socket type.
    pub socktype: i32,
    /// `IPPROTO_UDP`, or `IPPROTO_UDPLITE` on a UDP-Lite socket.
    pub protocol: i32,
    /// The source address itself.
    pub addr: Addr,
}

/// Configuration for [`UdpSocket::client`] and [`UdpSocket::server`].
///
/// A destination is either a pre-resolved [`AddrList`] or a
/// hostname/service pair resolved in place. An [`EventLoop`] is attached
/// only when the socket is created with a readability callback; without a
/// loop of its own, one is allocated and started.
#[derive(Debug, Default)]
pub struct UdpOptions {
    addrs: Option<AddrList>,
    host: Option<(String, String)>,
    hints: Option<Hints>,
    event_loop: Option<EventLoop>,
}

impl UdpOptions {
    /// Empty options; a destination must be supplied before use.
    pub fn new() -> UdpOptions {
        UdpOptions::default()
    }

    /// Use a pre-resolved candidate list.
    pub fn addrs(mut self, addrs: AddrList) -> UdpOptions {
        self.addrs = Some(addrs);
        self
    }

    /// Use a single known address.
    pub fn addr(self, addr: SocketAddr) -> UdpOptions {
        self.addrs(vec![AddrEntry::udp(addr)])
    }

    /// Resolve `hostname`/`service` in place.
    pub fn host(mut self, hostname: &str, service: &str) -> UdpOptions {
        self.host = Some((hostname.to_owned(), service.to_owned()));
        self
    }

    /// Override the resolution hints (defaults to UDP hints; use
    /// [`Hints::udp_lite`] for UDP-Lite).
    pub fn hints(mut self, hints: Hints) -> UdpOptions {
        self.hints = Some(hints);
        self
    }

    /// Attach to an existing loop instead of allocating one.
    pub fn event_loop(mut self, event_loop: &EventLoop) -> UdpOptions {
        self.event_loop = Some(event_loop.clone());
        self
    }
}

enum UdpKind {
    Client,
    Server,
}

struct UdpState {
    fd: Option<OwnedFd>,
    token: Option<crate::Token>,
    freed: bool,
}

struct Shared {
    state: Mutex<UdpState>,
    on_event: Option<Box<dyn Fn(&UdpSocket) + Send + Sync>>,
    event_loop: Option<EventLoop>,
    alloc_loop: bool,
    udp_lite: bool,
}

/// A UDP or UDP-Lite endpoint, optionally bound to an [`EventLoop`].
///
/// Clients connect so [`send`] works with a bare buffer; servers bind and
/// answer with [`send_to`]. Created with a callback, the socket registers
/// for readable edges on its loop and the callback drains datagrams with
/// [`read`]; created without one, it is a plain non-blocking socket.
///
/// [`send`]: UdpSocket::send
/// [`send_to`]: UdpSocket::send_to
/// [`read`]: UdpSocket::read
#[derive(Clone)]
pub struct UdpSocket {
    shared: Arc<Shared>,
}

struct Dispatcher(UdpSocket);

impl EventHandler for Dispatcher {
    fn on_event(&self, ready: Ready) {
        if ready.is_readable() {
            if let Some(on_event) = self.0.shared.on_event.as_ref() {
                on_event(&self.0);
            }
        }
    }
}

impl UdpSocket {
    /// A connected datagram socket without readability events.
    pub fn client(options: UdpOptions) -> io::Result<UdpSocket> {
        UdpSocket::open(options, UdpKind::Client, None)
    }

    /// A connected datagram socket delivering readable edges to
    /// `on_event`.
    pub fn client_with_events<F>(options: UdpOptions, on_event: F) -> io::Result<UdpSocket>
    where
        F: Fn(&UdpSocket) + Send + Sync + 'static,
    {
        UdpSocket::open(options, UdpKind::Client, Some(Box::new(on_event)))
    }

    /// A bound datagram socket without readability events.
    pub fn server(options: UdpOptions) -> io::Result<UdpSocket> {
        UdpSocket::open(options, UdpKind::Server, None)
    }

    /// A bound datagram socket delivering readable edges to `on_event`.
    pub fn server_with_events<F>(options: UdpOptions, on_event: F) -> io::Result<UdpSocket>
    where
        F: Fn(&UdpSocket) + Send + Sync + 'static,
    {
        UdpSocket::open(options, UdpKind::Server, Some(Box::new(on_event)))
    }

    fn open(
        mut options: UdpOptions,
        kind: UdpKind,
        on_event: Option<Box<dyn Fn(&UdpSocket) + Send + Sync>>,
    ) -> io::Result<UdpSocket> {
        let list = match (options.addrs.take(), options.host.take()) {
            (Some(list), _) => list,
            (None, Some((hostname, service))) => {
                let mut hints = options.hints.unwrap_or_else(Hints::udp);
                if let UdpKind::Server = kind {
                    hints = hints.passive();
                }
                addr::resolve(Some(&hostname), Some(&service), hints)?
            }
            (None, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no destination given",
                ))
            }
        };

        let mode = match kind {
            UdpKind::Client => OpenMode::Connect,
            UdpKind::Server => OpenMode::Bind,
        };
        let (fd, entry) = addr::open_socket(&list, mode)?;
        let udp_lite = entry.protocol == libc::IPPROTO_UDPLITE;
        trace!("udp endpoint at {:?}", entry.addr);

        let (event_loop, alloc_loop) = if on_event.is_some() {
            match options.event_loop.take() {
                Some(event_loop) => (Some(event_loop), false),
                None => {
                    let event_loop = EventLoop::new()?;
                    event_loop.start()?;
                    (Some(event_loop), true)
                }
            }
        } else {
            (None, false)
        };

        let raw_fd = fd.as_raw_fd();
        let socket = UdpSocket {
            shared: Arc::new(Shared {
                state: Mutex::new(UdpState {
                    fd: Some(fd),
                    token: None,
                    freed: false,
                }),
                on_event,
                event_loop,
                alloc_loop,
                udp_lite,
            }),
        };

        if let Some(event_loop) = socket.shared.event_loop.as_ref() {
            let mut state = socket.shared.state.lock().unwrap();
            match event_loop.register(
                raw_fd,
                Interest::READABLE,
                Arc::new(Dispatcher(socket.clone())),
            ) {
                Ok(token) => state.token = Some(token),
                Err(err) => {
                    if alloc_loop {
                        event_loop.shutdown(Shutdown::Async);
                    }
                    return Err(err);
                }
            }
        }
        Ok(socket)
    }

    /// Send the whole datagram on a connected socket.
    ///
    /// Datagram sends are atomic; the loop only swallows interruptions.
    pub fn send(&self, buf: &[u8]) -> io::Result<()> {
        let state = self.shared.state.lock().unwrap();
        let fd = match state.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        let mut offset = 0;
        while offset < buf.len() {
            match socket::send(fd, &buf[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Send a datagram to an explicit destination on an unconnected
    /// socket.
    pub fn send_to(&self, buf: &[u8], addr: &Addr) -> io::Result<()> {
        let raw = socket::RawAddr::from_addr(addr)?;
        let state = self.shared.state.lock().unwrap();
        let fd = match state.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        loop {
            match socket::send_to(fd, buf, &raw) {
                Ok(_) => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Receive one datagram, with its source.
    ///
    /// One kernel read per call; bytes beyond `buf.len()` of a larger
    /// datagram are discarded by the kernel.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<(usize, SourceInfo)> {
        let state = self.shared.state.lock().unwrap();
        let fd = match state.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        loop {
            match socket::recv_from(fd, buf) {
                Ok((n, raw)) => {
                    let info = SourceInfo {
                        family: raw.family(),
                        socktype: libc::SOCK_DGRAM,
                        protocol: if self.shared.udp_lite {
                            libc::IPPROTO_UDPLITE
                        } else {
                            libc::IPPROTO_UDP
                        },
                        addr: raw.to_addr()?,
                    };
                    return Ok((n, info));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<Addr> {
        let state = self.shared.state.lock().unwrap();
        match state.fd.as_ref() {
            Some(fd) => socket::local_addr(fd.as_raw_fd())?.to_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Returns `true` for a UDP-Lite socket.
    pub fn is_udp_lite(&self) -> bool {
        self.shared.udp_lite
    }

    /// Close the descriptor and detach from the loop.
    pub fn free(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.freed {
            return;
        }
        state.freed = true;
        if let (Some(token), Some(fd)) = (state.token.take(), state.fd.as_ref()) {
            if let Some(event_loop) = self.shared.event_loop.as_ref() {
                let _ = event_loop.deregister(token, fd.as_raw_fd());
            }
        }
        state.fd = None;
        drop(state);
        if self.shared.alloc_loop {
            if let Some(event_loop) = self.shared.event_loop.as_ref() {
                event_loop.shutdown(Shutdown::Async);
            }
        }
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("UdpSocket")
            .field("udp_lite", &self.shared.udp_lite)
            .finish()
    }
}
