//! TCP endpoints: connecting sockets and accepting servers.

mod server;
mod socket;

pub use self::server::{Accepted, TcpServer};
pub use self::socket::{TcpEvent, TcpOptions, TcpSocket};
