//! TCP networking layer
//!
//! This module provides a state-tracked TCP socket with timeout-bounded,
//! resumable reads and a length-prefixed message protocol on top of the
//! raw byte stream, plus a broadcast-capable UDP datagram socket.
//!
//! # Architecture
//!
//! - `SocketOps` abstracts the OS handle (poll, recv, send, close)
//! - `FdSocketOps` is the single Unix implementation over `socket2`
//! - `TcpSocket` drives the connection state machine on top of it
//! - `UdpSocket` sends and receives whole datagrams
//!
//! # Examples
//!
//! ```no_run
//! use hostwire::net::{TcpSocket, Timeout};
//!
//! let mut socket = TcpSocket::new(true);
//! socket.connect("127.0.0.1", 9000, true).unwrap();
//! socket.send(b"ping").unwrap();
//!
//! let mut reply = bytes::BytesMut::new();
//! if socket.receive(&mut reply, Timeout::from_millis(500)).unwrap() {
//!     println!("got {} bytes", reply.len());
//! }
//! ```

pub mod ops;
pub mod socket;
pub mod timeout;
pub mod udp;

pub use ops::{FdSocketOps, PollEvents, SocketOps};
pub use socket::{SocketState, TcpSocket};
pub use timeout::Timeout;
pub use udp::UdpSocket;

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Once;

/// Result type for socket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Socket operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unable to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No IPv4 address found for {0}")]
    NoSuitableAddress(String),

    #[error("Operation not valid in state {0:?}")]
    InvalidState(SocketState),

    #[error("Socket is not bound")]
    NotBound,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Buffer too small: {got} bytes, need {needed}")]
    BufferTooSmall { needed: usize, got: usize },
}

/// Size of the little-endian length prefix of a framed message
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Largest framed message `TcpSocket::receive` accepts by default
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload of a single IPv4 UDP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

static STARTUP: Once = Once::new();

/// Perform process-wide socket initialization exactly once
///
/// `socket2` suppresses `SIGPIPE` per call (`MSG_NOSIGNAL`) or per socket
/// (`SO_NOSIGPIPE`) on the mainstream Unixes. Only targets with neither
/// fall back to ignoring the signal for the process.
pub fn startup() {
    STARTUP.call_once(|| {
        #[cfg(all(
            unix,
            not(any(
                target_os = "linux",
                target_os = "android",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
                target_os = "illumos",
                target_os = "solaris",
                target_vendor = "apple",
            ))
        ))]
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        tracing::debug!("socket layer initialized");
    });
}

/// Resolve `host:port`, keeping only the first IPv4 result
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    let addrs = (host, port).to_socket_addrs().map_err(|source| Error::Resolve {
        host: host.to_string(),
        source,
    })?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::NoSuitableAddress(host.to_string()))
}
