use std::ffi::OsStr;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::net::Addr;
use crate::sys::syscall;

/// A `sockaddr_storage` paired with the length the kernel filled in or
/// expects, convertible to and from [`Addr`].
pub(crate) struct RawAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawAddr {
    pub(crate) fn new() -> RawAddr {
        RawAddr {
            // SAFETY: all-zeroes is a valid (unspecified) sockaddr_storage.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub(crate) fn from_addr(addr: &Addr) -> io::Result<RawAddr> {
        let mut raw = RawAddr::new();
        match addr {
            Addr::Inet(SocketAddr::V4(addr)) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: addr.port().to_be(),
                    sin_addr: libc::in_addr {
                        // Octets are already in network order.
                        s_addr: u32::from_ne_bytes(addr.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                // SAFETY: sockaddr_in fits in sockaddr_storage.
                unsafe {
                    (&mut raw.storage as *mut _ as *mut libc::sockaddr_in).write(sin);
                }
                raw.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            Addr::Inet(SocketAddr::V6(addr)) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: addr.port().to_be(),
                    sin6_flowinfo: addr.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: addr.ip().octets(),
                    },
                    sin6_scope_id: addr.scope_id(),
                };
                // SAFETY: sockaddr_in6 fits in sockaddr_storage.
                unsafe {
                    (&mut raw.storage as *mut _ as *mut libc::sockaddr_in6).write(sin6);
                }
                raw.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
            Addr::Unix(path) => {
                let bytes = path.as_os_str().as_bytes();
                let mut sun = libc::sockaddr_un {
                    sun_family: libc::AF_UNIX as libc::sa_family_t,
                    sun_path: [0; 108],
                };
                if bytes.len() >= sun.sun_path.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "socket path too long",
                    ));
                }
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes.iter()) {
                    *dst = *src as libc::c_char;
                }
                // SAFETY: sockaddr_un fits in sockaddr_storage.
                unsafe {
                    (&mut raw.storage as *mut _ as *mut libc::sockaddr_un).write(sun);
                }
                raw.len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
            }
        }
        Ok(raw)
    }

    pub(crate) fn to_addr(&self) -> io::Result<Addr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                // SAFETY: family checked above, storage is large enough.
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Ok(Addr::Inet(SocketAddr::V4(SocketAddrV4::new(
                    ip,
                    u16::from_be(sin.sin_port),
                ))))
            }
            libc::AF_INET6 => {
                // SAFETY: family checked above, storage is large enough.
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(Addr::Inet(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                ))))
            }
            libc::AF_UNIX => {
                // SAFETY: family checked above, storage is large enough.
                let sun = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_un) };
                let header = mem::size_of::<libc::sa_family_t>();
                let path_len = (self.len as usize).saturating_sub(header);
                let bytes: Vec<u8> = sun.sun_path[..path_len.min(sun.sun_path.len())]
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                Ok(Addr::Unix(PathBuf::from(OsStr::from_bytes(&bytes))))
            }
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub(crate) fn len_mut(&mut self) -> &mut libc::socklen_t {
        &mut self.len
    }

    pub(crate) fn family(&self) -> libc::c_int {
        self.storage.ss_family as libc::c_int
    }
}

/// Create a non-blocking, close-on-exec socket.
pub(crate) fn open(
    family: libc::c_int,
    socktype: libc::c_int,
    protocol: libc::c_int,
) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(
        family,
        socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        protocol,
    ))?;
    // SAFETY: `socket(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn connect(fd: RawFd, addr: &RawAddr) -> io::Result<()> {
    syscall!(connect(fd, addr.as_ptr(), addr.len())).map(|_| ())
}

pub(crate) fn bind(fd: RawFd, addr: &RawAddr) -> io::Result<()> {
    syscall!(bind(fd, addr.as_ptr(), addr.len())).map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, RawAddr)> {
    let mut addr = RawAddr::new();
    let mut len = addr.len();
    let stream = syscall!(accept4(
        fd,
        addr.as_mut_ptr(),
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    *addr.len_mut() = len;
    // SAFETY: `accept4(2)` ensures the fd is valid.
    Ok((unsafe { OwnedFd::from_raw_fd(stream) }, addr))
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(send(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        libc::MSG_NOSIGNAL,
    ))
    .map(|n| n as usize)
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: &RawAddr) -> io::Result<usize> {
    syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        libc::MSG_NOSIGNAL,
        addr.as_ptr(),
        addr.len(),
    ))
    .map(|n| n as usize)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)).map(|n| n as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, RawAddr)> {
    let mut addr = RawAddr::new();
    let mut len = addr.len();
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        addr.as_mut_ptr(),
        &mut len,
    ))?;
    *addr.len_mut() = len;
    Ok((n as usize, addr))
}

/// Zero-copy transfer from a file descriptor into a socket.
pub(crate) fn sendfile(fd: RawFd, file: RawFd, offset: usize, len: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    syscall!(sendfile(fd, file, &mut off, len)).map(|n| n as usize)
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

/// Read and clear the pending socket error.
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

pub(crate) fn set_bool(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    on: bool,
) -> io::Result<()> {
    let value: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<RawAddr> {
    let mut addr = RawAddr::new();
    let mut len = addr.len();
    syscall!(getsockname(fd, addr.as_mut_ptr(), &mut len))?;
    *addr.len_mut() = len;
    Ok(addr)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<RawAddr> {
    let mut addr = RawAddr::new();
    let mut len = addr.len();
    syscall!(getpeername(fd, addr.as_mut_ptr(), &mut len))?;
    *addr.len_mut() = len;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::RawAddr;
    use crate::net::Addr;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    #[test]
    fn inet_round_trip() {
        for addr in ["127.0.0.1:4080", "[::1]:9"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let raw = RawAddr::from_addr(&Addr::Inet(addr)).unwrap();
            match raw.to_addr().unwrap() {
                Addr::Inet(back) => assert_eq!(back, addr),
                other => panic!("wrong family: {:?}", other),
            }
        }
    }

    #[test]
    fn unix_round_trip() {
        let path = PathBuf::from("/tmp/evio-test.sock");
        let raw = RawAddr::from_addr(&Addr::Unix(path.clone())).unwrap();
        match raw.to_addr().unwrap() {
            Addr::Unix(back) => assert_eq!(back, path),
            other => panic!("wrong family: {:?}", other),
        }
    }

    #[test]
    fn unix_path_too_long() {
        let path = PathBuf::from("/".repeat(200));
        assert!(RawAddr::from_addr(&Addr::Unix(path)).is_err());
    }
}
