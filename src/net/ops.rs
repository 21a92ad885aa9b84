//! Socket operations abstraction
//!
//! `SocketOps` is the seam between the connection state machine in
//! `TcpSocket` and the operating system. There is exactly one
//! implementation per platform; on Unix it is `FdSocketOps`, which wraps a
//! `socket2::Socket` and waits for readiness with `poll(2)`. The same type
//! carries both stream and datagram handles.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Socket operations trait
pub trait SocketOps {
    /// Wait until the handle is ready for `events`
    ///
    /// Returns false if `timeout` elapsed first. `None` waits forever and
    /// a zero timeout only samples the current readiness.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool>;

    /// Receive into `buf`; `Ok(0)` is an orderly close by the peer
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send from `buf`, returning the number of bytes accepted by the kernel
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Pending asynchronous error (used to resolve a non-blocking connect)
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    fn peer_addr(&self) -> Option<SocketAddrV4>;

    fn local_addr(&self) -> Option<SocketAddrV4>;

    /// Release the handle
    fn close(&mut self) -> io::Result<()>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Plain file descriptor socket operations
pub struct FdSocketOps {
    socket: Socket,
}

impl FdSocketOps {
    /// Create a fresh IPv4 TCP handle
    pub fn tcp_v4() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        Ok(FdSocketOps { socket })
    }

    /// Create a fresh IPv4 UDP handle that may send to broadcast addresses
    pub fn udp_v4() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;
        Ok(FdSocketOps { socket })
    }

    /// Wrap an existing socket
    pub fn from_socket(socket: Socket) -> Self {
        FdSocketOps { socket }
    }

    pub fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        self.socket.bind(&SockAddr::from(addr))
    }

    /// Connect to `addr`
    ///
    /// Returns `Ok(true)` once connected and `Ok(false)` when a
    /// non-blocking connect is still in progress.
    pub fn connect(&self, addr: SocketAddrV4) -> io::Result<bool> {
        match self.socket.connect(&SockAddr::from(addr)) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Bind to `addr` and start listening
    pub fn bind_listen(&self, addr: SocketAddrV4) -> io::Result<()> {
        self.socket.set_reuse_address(true)?;
        self.socket.bind(&SockAddr::from(addr))?;
        self.socket.listen(libc::SOMAXCONN)
    }

    /// Accept a pending connection
    ///
    /// Returns `Ok(None)` when the listener is non-blocking and nothing is
    /// waiting.
    pub fn accept(&self) -> io::Result<Option<(FdSocketOps, Option<SocketAddrV4>)>> {
        match self.socket.accept() {
            Ok((socket, addr)) => Ok(Some((
                FdSocketOps::from_socket(socket),
                addr.as_socket_ipv4(),
            ))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Receive one datagram, returning its size and sender
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddrV4>)> {
        // SAFETY: every initialized byte is a valid `MaybeUninit<u8>`, and
        // recvfrom(2) only ever writes initialized bytes into the slice
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, from) = self.socket.recv_from(uninit)?;
        Ok((n, from.as_socket_ipv4()))
    }

    /// Send one datagram to `addr`
    pub fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(buf, &SockAddr::from(addr))
    }
}

impl SocketOps for FdSocketOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

        let mut pfd = pollfd {
            fd: self.socket.as_raw_fd(),
            events: match events {
                PollEvents::Read => POLLIN,
                PollEvents::Write => POLLOUT,
            },
            revents: 0,
        };

        // Round up so a sub-millisecond remainder still waits
        let timeout_ms = timeout
            .map(|d| ((d.as_nanos() + 999_999) / 1_000_000).min(i32::MAX as u128) as i32)
            .unwrap_or(-1); // -1 = infinite

        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        // Errors and hangups count as ready; the following call reports them
        Ok(result > 0 && pfd.revents & (pfd.events | POLLERR | POLLHUP) != 0)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.socket.set_nodelay(nodelay)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.socket.take_error()
    }

    fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.socket.peer_addr().ok().and_then(|a| a.as_socket_ipv4())
    }

    fn local_addr(&self) -> Option<SocketAddrV4> {
        self.socket.local_addr().ok().and_then(|a| a.as_socket_ipv4())
    }

    fn close(&mut self) -> io::Result<()> {
        use std::net::Shutdown;

        match self.socket.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Listening or already reset sockets have nothing to shut down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
