use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::thread;

use dns_lookup::AddrInfoHints;
use log::warn;

use crate::sys::socket::{self, RawAddr};

/// Address family selector for resolution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Family {
    /// Both IPv4 and IPv6, whatever resolution produces.
    #[default]
    Any,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl Family {
    fn raw(self) -> i32 {
        match self {
            Family::Any => libc::AF_UNSPEC,
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
        }
    }
}

/// One destination address: internet or Unix-domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    /// An IPv4 or IPv6 socket address.
    Inet(SocketAddr),
    /// A Unix-domain socket path.
    Unix(PathBuf),
}

/// One connect/bind candidate: an address plus the socket type and
/// protocol to open it with.
///
/// Resolution produces these; they can also be built by hand when the
/// destination is already known.
#[derive(Clone, Debug)]
pub struct AddrEntry {
    /// `SOCK_STREAM`, `SOCK_DGRAM`, ...
    pub socktype: i32,
    /// `IPPROTO_TCP`, `IPPROTO_UDP`, `IPPROTO_UDPLITE`, ...
    pub protocol: i32,
    /// The destination itself.
    pub addr: Addr,
}

impl AddrEntry {
    /// A TCP candidate for `addr`.
    pub fn tcp(addr: SocketAddr) -> AddrEntry {
        AddrEntry {
            socktype: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
            addr: Addr::Inet(addr),
        }
    }

    /// A UDP candidate for `addr`.
    pub fn udp(addr: SocketAddr) -> AddrEntry {
        AddrEntry {
            socktype: libc::SOCK_DGRAM,
            protocol: libc::IPPROTO_UDP,
            addr: Addr::Inet(addr),
        }
    }

    /// A UDP-Lite candidate for `addr`.
    pub fn udp_lite(addr: SocketAddr) -> AddrEntry {
        AddrEntry {
            socktype: libc::SOCK_DGRAM,
            protocol: libc::IPPROTO_UDPLITE,
            addr: Addr::Inet(addr),
        }
    }

    /// A Unix-domain stream candidate for `path`.
    pub fn unix_stream(path: PathBuf) -> AddrEntry {
        AddrEntry {
            socktype: libc::SOCK_STREAM,
            protocol: 0,
            addr: Addr::Unix(path),
        }
    }

    /// A Unix-domain datagram candidate for `path`.
    pub fn unix_datagram(path: PathBuf) -> AddrEntry {
        AddrEntry {
            socktype: libc::SOCK_DGRAM,
            protocol: 0,
            addr: Addr::Unix(path),
        }
    }

    pub(crate) fn family(&self) -> i32 {
        match &self.addr {
            Addr::Inet(SocketAddr::V4(_)) => libc::AF_INET,
            Addr::Inet(SocketAddr::V6(_)) => libc::AF_INET6,
            Addr::Unix(_) => libc::AF_UNIX,
        }
    }
}

/// The candidates a resolution produced, tried in order.
pub type AddrList = Vec<AddrEntry>;

/// Hints narrowing what [`resolve`] asks the resolver for, mirroring
/// `addrinfo` hints.
#[derive(Copy, Clone, Debug, Default)]
pub struct Hints {
    /// Restrict the address family.
    pub family: Family,
    /// Restrict the socket type (0 accepts any).
    pub socktype: i32,
    /// Restrict the protocol (0 accepts any).
    pub protocol: i32,
    /// `AI_*` flags, e.g. `AI_PASSIVE` for listening addresses.
    pub flags: i32,
}

impl Hints {
    /// Hints for a TCP endpoint.
    pub fn tcp() -> Hints {
        Hints {
            socktype: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
            ..Hints::default()
        }
    }

    /// Hints for a UDP endpoint.
    pub fn udp() -> Hints {
        Hints {
            socktype: libc::SOCK_DGRAM,
            protocol: libc::IPPROTO_UDP,
            ..Hints::default()
        }
    }

    /// Hints for a UDP-Lite endpoint.
    pub fn udp_lite() -> Hints {
        Hints {
            socktype: libc::SOCK_DGRAM,
            protocol: libc::IPPROTO_UDPLITE,
            ..Hints::default()
        }
    }

    /// Ask for addresses suitable for binding a server.
    pub fn passive(mut self) -> Hints {
        self.flags |= libc::AI_PASSIVE;
        self
    }

    /// Restrict the address family.
    pub fn family(mut self, family: Family) -> Hints {
        self.family = family;
        self
    }
}

/// Resolve `hostname`/`service` into connect or bind candidates.
///
/// Blocks in the resolver; use [`resolve_async`] from latency-sensitive
/// threads. An empty hostname with [`Hints::passive`] resolves to wildcard
/// bind addresses.
pub fn resolve(hostname: Option<&str>, service: Option<&str>, hints: Hints) -> io::Result<AddrList> {
    let hints = AddrInfoHints {
        flags: hints.flags,
        address: hints.family.raw(),
        socktype: hints.socktype,
        protocol: hints.protocol,
    };
    let entries = dns_lookup::getaddrinfo(hostname, service, Some(hints))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("resolution failed: {err:?}")))?;

    let mut list = AddrList::new();
    for entry in entries {
        let entry = entry?;
        list.push(AddrEntry {
            socktype: entry.socktype,
            protocol: entry.protocol,
            addr: Addr::Inet(entry.sockaddr),
        });
    }
    Ok(list)
}

/// A deferred resolution, handed to [`resolve_async`].
#[derive(Clone, Debug, Default)]
pub struct ResolveRequest {
    /// Hostname to resolve, `None` for wildcard/loopback per hints.
    pub hostname: Option<String>,
    /// Service name or port number.
    pub service: Option<String>,
    /// Resolution hints.
    pub hints: Hints,
}

/// Resolve on a helper thread and deliver the outcome to `callback`.
///
/// The callback runs on the resolver's thread. It must not block there; an
/// endpoint consuming the result only posts it to its owning loop.
pub fn resolve_async<F>(request: ResolveRequest, callback: F) -> io::Result<()>
where
    F: FnOnce(io::Result<AddrList>) + Send + 'static,
{
    thread::Builder::new()
        .name("evio-resolve".to_owned())
        .spawn(move || {
            let res = resolve(
                request.hostname.as_deref(),
                request.service.as_deref(),
                request.hints,
            );
            if let Err(err) = &res {
                warn!("asynchronous resolution failed: {}", err);
            }
            callback(res);
        })
        .map(|_| ())
}

pub(crate) enum OpenMode {
    Connect,
    Bind,
}

/// Walk `list`, opening a socket per candidate until one succeeds.
///
/// `Ok`/`EINTR`/`EINPROGRESS` succeed immediately (the connect may still be
/// in flight; the caller watches for the writability edge). `EPIPE` and
/// `ECONNRESET` retry the same candidate up to 3 times before advancing.
/// Anything else advances to the next candidate. An exhausted list fails
/// with the most recent error, without leaving a descriptor behind.
pub(crate) fn open_socket(list: &[AddrEntry], mode: OpenMode) -> io::Result<(OwnedFd, &AddrEntry)> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "empty address list");

    for entry in list {
        let raw = match RawAddr::from_addr(&entry.addr) {
            Ok(raw) => raw,
            Err(err) => {
                last_err = err;
                continue;
            }
        };

        let mut resets: u8 = 0;
        loop {
            let fd = match socket::open(entry.family(), entry.socktype, entry.protocol) {
                Ok(fd) => fd,
                Err(err) => {
                    last_err = err;
                    break;
                }
            };

            let res = match mode {
                OpenMode::Connect => socket::connect(fd.as_raw_fd(), &raw),
                OpenMode::Bind => {
                    let _ = socket::set_bool(
                        fd.as_raw_fd(),
                        libc::SOL_SOCKET,
                        libc::SO_REUSEADDR,
                        true,
                    );
                    socket::bind(fd.as_raw_fd(), &raw)
                }
            };

            match res {
                Ok(()) => return Ok((fd, entry)),
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EINPROGRESS) => return Ok((fd, entry)),
                    Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                        last_err = err;
                        resets += 1;
                        if resets < 3 {
                            continue;
                        }
                        break;
                    }
                    _ => {
                        last_err = err;
                        break;
                    }
                },
            }
        }
    }

    Err(last_err)
}
