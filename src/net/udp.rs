//! Datagram socket
//!
//! `UdpSocket` moves whole datagrams. There is no connection state: a
//! bound socket receives from anyone, and `send` creates an unbound handle
//! on first use if `bind` was never called. Broadcast is always enabled.

use super::ops::{FdSocketOps, PollEvents, SocketOps};
use super::{resolve_ipv4, startup, Error, Result, Timeout, MAX_DATAGRAM_SIZE};
use bytes::BytesMut;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

/// IPv4 UDP socket
#[derive(Default)]
pub struct UdpSocket {
    ops: Option<FdSocketOps>,
    peer: Option<SocketAddrV4>,
    last_error: Option<String>,
}

impl UdpSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// The limited broadcast address `255.255.255.255:port`
    pub fn broadcast_address(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, port)
    }

    /// Bind to all interfaces on `port`
    pub fn bind(&mut self, port: u16) -> Result<()> {
        self.bind_on(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Bind to `addr:port`, replacing any open handle
    pub fn bind_on(&mut self, addr: Ipv4Addr, port: u16) -> Result<()> {
        startup();
        self.disconnect();

        let ops = self.open()?;
        if let Err(e) = ops.bind(SocketAddrV4::new(addr, port)) {
            return Err(self.record(e));
        }

        self.ops = Some(ops);
        tracing::debug!(%addr, port, "udp socket bound");
        Ok(())
    }

    /// Close the handle; safe to call repeatedly
    pub fn disconnect(&mut self) {
        if let Some(mut ops) = self.ops.take() {
            let _ = ops.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.ops.is_some()
    }

    /// Port the handle is bound to locally
    pub fn local_port(&self) -> Option<u16> {
        self.ops
            .as_ref()
            .and_then(|ops| ops.local_addr())
            .map(|addr| addr.port())
    }

    /// Sender of the most recently received datagram
    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    /// Dotted IPv4 address of the most recent sender
    pub fn peer_ip(&self) -> Option<String> {
        self.peer.map(|addr| addr.ip().to_string())
    }

    /// Description of the most recent OS error seen by this socket
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Receive one datagram into `buffer`
    ///
    /// Returns `Ok(false)` if nothing arrived before `timeout` expired; a
    /// zero timeout only checks what is already queued. On success the
    /// buffer holds exactly the datagram and `peer` names its sender.
    pub fn receive(&mut self, buffer: &mut BytesMut, timeout: Timeout) -> Result<bool> {
        buffer.clear();

        loop {
            let ops = self.ops.as_ref().ok_or(Error::NotBound)?;

            let got = match ops.poll(PollEvents::Read, timeout.remaining()) {
                Ok(true) => {
                    buffer.resize(MAX_DATAGRAM_SIZE, 0);
                    ops.recv_from(&mut buffer[..])
                }
                Ok(false) => Err(io::ErrorKind::WouldBlock.into()),
                Err(e) => Err(e),
            };

            match got {
                Ok((n, from)) => {
                    buffer.truncate(n);
                    self.peer = from;
                    tracing::trace!(n, peer = ?from, "datagram received");
                    return Ok(true);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    buffer.clear();
                }
                Err(e) => {
                    buffer.clear();
                    let err = self.record(e);
                    self.disconnect();
                    return Err(err);
                }
            }

            if timeout.timed_out() {
                return Ok(false);
            }
        }
    }

    /// Send `data` as one datagram to `to`
    pub fn send(&mut self, to: SocketAddrV4, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge(data.len()));
        }

        if self.ops.is_none() {
            startup();
            let ops = self.open()?;
            self.ops = Some(ops);
        }

        let sent = match self.ops.as_ref() {
            Some(ops) => ops.send_to(data, to),
            None => return Err(Error::NotBound),
        };

        match sent {
            Ok(n) if n == data.len() => {
                tracing::trace!(n, %to, "datagram sent");
                Ok(())
            }
            Ok(n) => Err(self.record(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram: {} of {} bytes", n, data.len()),
            ))),
            Err(e) => Err(self.record(e)),
        }
    }

    /// Resolve `host` and send `data` to `host:port`
    pub fn send_to_host(&mut self, host: &str, port: u16, data: &[u8]) -> Result<()> {
        let to = resolve_ipv4(host, port)?;
        self.send(to, data)
    }

    /// Send the contents of `buffer` as one datagram
    pub fn send_buffer(&mut self, to: SocketAddrV4, buffer: &BytesMut) -> Result<()> {
        self.send(to, &buffer[..])
    }

    fn open(&mut self) -> Result<FdSocketOps> {
        let ops = FdSocketOps::udp_v4()
            .and_then(|ops| ops.set_nonblocking(true).map(|_| ops))
            .map_err(|e| self.record(e))?;
        Ok(ops)
    }

    fn record(&mut self, e: io::Error) -> Error {
        self.last_error = Some(e.to_string());
        Error::Io(e)
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local_port", &self.local_port())
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound() -> (UdpSocket, SocketAddrV4) {
        let mut socket = UdpSocket::new();
        socket.bind_on(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = socket.local_port().unwrap();
        (socket, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn test_send_and_reply() {
        let (mut server, server_addr) = bound();

        let mut client = UdpSocket::new();
        assert!(!client.is_open());
        client.send(server_addr, b"hello").unwrap();
        assert!(client.is_open());

        let mut buffer = BytesMut::new();
        assert!(server.receive(&mut buffer, Timeout::from_millis(1000)).unwrap());
        assert_eq!(&buffer[..], b"hello");
        assert_eq!(server.peer_ip().as_deref(), Some("127.0.0.1"));

        let reply_to = server.peer().unwrap();
        server.send(reply_to, b"world").unwrap();

        assert!(client.receive(&mut buffer, Timeout::from_millis(1000)).unwrap());
        assert_eq!(&buffer[..], b"world");
        assert_eq!(client.peer(), Some(server_addr));
    }

    #[test]
    fn test_datagram_boundaries_are_kept() {
        let (mut server, server_addr) = bound();
        let mut client = UdpSocket::new();

        client.send(server_addr, b"one").unwrap();
        client.send_to_host("127.0.0.1", server_addr.port(), b"second").unwrap();

        let mut buffer = BytesMut::new();
        assert!(server.receive(&mut buffer, Timeout::from_millis(1000)).unwrap());
        assert_eq!(&buffer[..], b"one");
        assert!(server.receive(&mut buffer, Timeout::from_millis(1000)).unwrap());
        assert_eq!(&buffer[..], b"second");
    }

    #[test]
    fn test_receive_times_out() {
        let (mut server, _) = bound();
        let mut buffer = BytesMut::from(&b"stale"[..]);

        assert!(!server.receive(&mut buffer, Timeout::from_millis(0)).unwrap());
        assert!(!server.receive(&mut buffer, Timeout::from_millis(30)).unwrap());
        assert!(buffer.is_empty());
        assert!(server.is_open());
    }

    #[test]
    fn test_unbound_receive() {
        let mut socket = UdpSocket::new();
        let mut buffer = BytesMut::new();
        assert!(matches!(
            socket.receive(&mut buffer, Timeout::from_millis(0)),
            Err(Error::NotBound)
        ));

        let (mut server, _) = bound();
        server.disconnect();
        server.disconnect();
        assert!(matches!(
            server.receive(&mut buffer, Timeout::from_millis(0)),
            Err(Error::NotBound)
        ));
    }

    #[test]
    fn test_oversized_datagram() {
        let mut socket = UdpSocket::new();
        let data = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let to = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        assert!(matches!(
            socket.send(to, &data),
            Err(Error::MessageTooLarge(n)) if n == MAX_DATAGRAM_SIZE + 1
        ));
        assert!(!socket.is_open());
    }

    #[test]
    fn test_broadcast_address() {
        let addr = UdpSocket::broadcast_address(5000);
        assert_eq!(*addr.ip(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(addr.port(), 5000);
    }
}
