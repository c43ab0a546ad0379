//! Networking endpoints: addressing, TCP and UDP.
//!
//! Endpoints attach to an [`EventLoop`] (their own, or one allocated for
//! them) and deliver everything through callbacks on the loop thread.
//! Destinations come either as a pre-resolved [`AddrList`] or as a
//! hostname/service pair resolved through the `getaddrinfo` contract.
//!
//! [`EventLoop`]: crate::EventLoop

mod addr;
mod udp;

pub mod tcp;

pub use self::addr::{
    resolve, resolve_async, Addr, AddrEntry, AddrList, Family, Hints, ResolveRequest,
};
pub use self::tcp::{Accepted, TcpEvent, TcpOptions, TcpServer, TcpSocket};
pub use self::udp::{SourceInfo, UdpOptions, UdpSocket};
