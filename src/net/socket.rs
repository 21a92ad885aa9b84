//! State-tracked TCP socket
//!
//! `TcpSocket` wraps one OS handle and tracks where it is in its life
//! cycle. Reads are buffered so that a read cut short by its timeout can
//! be resumed by the next call with the same length without losing the
//! bytes that already arrived. On top of that sits a message protocol:
//! every message is a `u32` little-endian length followed by exactly that
//! many payload bytes.

use super::ops::{FdSocketOps, PollEvents, SocketOps};
use super::{
    resolve_ipv4, startup, Error, Result, Timeout, DEFAULT_MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE,
};
use bytes::BytesMut;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No handle; initial and final state
    Idle,
    /// Bound and accepting connections
    Listening,
    /// Non-blocking connect issued, see `TcpSocket::connect_finished`
    Connecting,
    /// Peer accepted by a listening socket
    Host,
    /// Client side of an established connection
    Connected,
}

impl SocketState {
    /// Whether data can flow in this state
    pub fn is_open(&self) -> bool {
        matches!(self, SocketState::Host | SocketState::Connected)
    }
}

/// TCP socket with an explicit state machine
pub struct TcpSocket {
    state: SocketState,
    ops: Option<FdSocketOps>,
    peer: Option<SocketAddrV4>,

    blocking: bool,
    delay_enabled: bool,

    // buffered receive
    receiving: bool,
    recv_buffer: BytesMut,
    bytes_received: usize,

    // message framing
    header_received: bool,
    message_length: usize,
    max_message_size: usize,

    last_error: Option<(io::ErrorKind, String)>,
}

impl TcpSocket {
    /// Create an idle socket
    ///
    /// `blocking` selects the OS blocking mode applied to the handle once
    /// it exists. Reads are bounded by their timeout either way.
    pub fn new(blocking: bool) -> Self {
        TcpSocket {
            state: SocketState::Idle,
            ops: None,
            peer: None,
            blocking,
            delay_enabled: false,
            receiving: false,
            recv_buffer: BytesMut::new(),
            bytes_received: 0,
            header_received: false,
            message_length: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            last_error: None,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Description of the most recent OS error seen by this socket
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_ref().map(|(_, msg)| msg.as_str())
    }

    /// Dotted IPv4 address of the peer, if connected
    pub fn peer_ip(&self) -> Option<String> {
        if !self.state.is_open() {
            return None;
        }
        self.peer.map(|addr| addr.ip().to_string())
    }

    /// Port the handle is bound to locally
    pub fn local_port(&self) -> Option<u16> {
        self.ops
            .as_ref()
            .and_then(|ops| ops.local_addr())
            .map(|addr| addr.port())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Whether Nagle's algorithm is enabled
    pub fn delayed_sending(&self) -> bool {
        self.delay_enabled
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Limit the length a peer may announce in a message header
    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
    }

    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        self.blocking = blocking;
        self.update_socket()
    }

    /// Enable or disable Nagle's algorithm
    pub fn set_delayed_sending(&mut self, enabled: bool) -> Result<()> {
        self.delay_enabled = enabled;
        self.update_socket()
    }

    /// Bind to all interfaces and listen on `port`
    pub fn listen(&mut self, port: u16) -> Result<()> {
        self.listen_on(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Bind to `addr:port` and listen
    pub fn listen_on(&mut self, addr: Ipv4Addr, port: u16) -> Result<()> {
        startup();
        self.disconnect();

        let ops = FdSocketOps::tcp_v4().map_err(|e| self.record(e))?;
        if let Err(e) = ops.bind_listen(SocketAddrV4::new(addr, port)) {
            return Err(self.record(e));
        }

        self.ops = Some(ops);
        self.state = SocketState::Listening;
        self.update_socket()?;

        tracing::debug!(%addr, port, "listening");
        Ok(())
    }

    /// Accept a pending connection
    ///
    /// `block` sets the listener's blocking mode for this call. With
    /// `block == false` and nothing pending, returns `Ok(None)`. The
    /// accepted socket is in state `Host` and inherits this socket's
    /// blocking, Nagle and message size settings.
    pub fn accept(&mut self, block: bool) -> Result<Option<TcpSocket>> {
        if self.state != SocketState::Listening {
            return Err(Error::InvalidState(self.state));
        }

        let accepted = {
            let ops = self.ops.as_ref().ok_or(Error::InvalidState(self.state))?;
            ops.set_nonblocking(!block)
                .and_then(|_| ops.accept())
        };

        let (child, peer) = match accepted {
            Ok(Some(pair)) => pair,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.record(e)),
        };

        let mut socket = TcpSocket::new(self.blocking);
        socket.delay_enabled = self.delay_enabled;
        socket.max_message_size = self.max_message_size;
        socket.ops = Some(child);
        socket.peer = peer;
        socket.state = SocketState::Host;
        socket.update_socket()?;

        tracing::debug!(peer = ?socket.peer, "accepted connection");
        Ok(Some(socket))
    }

    /// Connect to `host:port` over IPv4
    ///
    /// With `block == true` the connect completes before returning and
    /// the result is `Ok(true)`. Otherwise the connect is issued
    /// non-blocking; `Ok(false)` means it is in progress and must be
    /// completed with `connect_finished`.
    pub fn connect(&mut self, host: &str, port: u16, block: bool) -> Result<bool> {
        startup();
        self.disconnect();

        let addr = resolve_ipv4(host, port)?;
        let ops = FdSocketOps::tcp_v4().map_err(|e| self.record(e))?;

        let connected = match ops
            .set_nonblocking(!block)
            .and_then(|_| ops.connect(addr))
        {
            Ok(connected) => connected,
            Err(e) => return Err(self.record(e)),
        };

        self.ops = Some(ops);
        self.peer = Some(addr);
        self.state = if connected {
            SocketState::Connected
        } else {
            SocketState::Connecting
        };

        if connected {
            self.update_socket()?;
        }

        tracing::debug!(%addr, state = ?self.state, "connect issued");
        Ok(connected)
    }

    /// Check on a non-blocking connect without waiting
    ///
    /// Returns `None` while the connect is still pending, otherwise
    /// `Some(success)`. A failed connect leaves the socket idle. Calling
    /// this on a socket that is not connecting reports whether it is
    /// connected.
    pub fn connect_finished(&mut self) -> Option<bool> {
        if self.state != SocketState::Connecting {
            return Some(self.state == SocketState::Connected);
        }

        let polled = match self.ops.as_ref() {
            Some(ops) => ops
                .poll(PollEvents::Write, Some(std::time::Duration::ZERO))
                .and_then(|ready| {
                    if ready {
                        ops.take_error().map(Some)
                    } else {
                        Ok(None)
                    }
                }),
            None => return Some(false),
        };

        match polled {
            Ok(None) => None,
            Ok(Some(None)) => {
                self.state = SocketState::Connected;
                if self.update_socket().is_err() {
                    self.disconnect();
                    return Some(false);
                }
                tracing::debug!(peer = ?self.peer, "connected");
                Some(true)
            }
            Ok(Some(Some(e))) | Err(e) => {
                self.fatal(e);
                Some(false)
            }
        }
    }

    /// Close the handle and return to `Idle`; safe to call repeatedly
    pub fn disconnect(&mut self) {
        if let Some(mut ops) = self.ops.take() {
            let _ = ops.close();
            tracing::debug!(peer = ?self.peer, "disconnected");
        }

        self.state = SocketState::Idle;
        self.peer = None;
        self.receiving = false;
        self.bytes_received = 0;
        self.header_received = false;
        self.message_length = 0;
    }

    /// Buffered read of exactly `length` bytes
    ///
    /// Returns `Ok(true)` once all `length` bytes are available; they are
    /// copied into `output` if given, which must hold at least `length`
    /// bytes. Returns `Ok(false)` if `timeout` expires first; the bytes
    /// received so far are kept, and the next call with the same `length`
    /// continues where this one stopped. With `peek` set the bytes stay
    /// buffered and the next call returns them again.
    ///
    /// A peer close or a non-retryable error disconnects the socket and
    /// is returned as an error.
    pub fn read(
        &mut self,
        output: Option<&mut [u8]>,
        length: usize,
        timeout: Timeout,
        peek: bool,
    ) -> Result<bool> {
        if !self.state.is_open() {
            return Err(Error::InvalidState(self.state));
        }

        if let Some(out) = output.as_deref() {
            if out.len() < length {
                return Err(Error::BufferTooSmall {
                    needed: length,
                    got: out.len(),
                });
            }
        }

        if !self.receiving {
            self.recv_buffer.clear();
            self.recv_buffer.resize(length, 0);
            self.receiving = true;
            self.bytes_received = 0;
        } else if self.recv_buffer.len() < length {
            self.recv_buffer.resize(length, 0);
        }

        loop {
            if self.bytes_received >= length {
                if let Some(out) = output {
                    out[..length].copy_from_slice(&self.recv_buffer[..length]);
                }
                if !peek {
                    self.receiving = false;
                }
                return Ok(true);
            }

            let ops = self.ops.as_mut().ok_or(Error::InvalidState(self.state))?;

            let got = match ops.poll(PollEvents::Read, timeout.remaining()) {
                Ok(true) => ops.recv(&mut self.recv_buffer[self.bytes_received..length]),
                Ok(false) => Err(io::ErrorKind::WouldBlock.into()),
                Err(e) => Err(e),
            };

            match got {
                Ok(0) => {
                    self.disconnect();
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => {
                    self.bytes_received += n;
                    tracing::trace!(n, received = self.bytes_received, length, "recv");
                    continue;
                }
                Err(e) if is_retryable(&e) => {}
                Err(e) => return Err(self.fatal(e)),
            }

            if timeout.timed_out() {
                return Ok(false);
            }
        }
    }

    /// Buffered read filling all of `buf`
    pub fn read_exact(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<bool> {
        let length = buf.len();
        self.read(Some(buf), length, timeout, false)
    }

    /// Buffered read of `length` bytes that are thrown away
    pub fn skip(&mut self, length: usize, timeout: Timeout) -> Result<bool> {
        self.read(None, length, timeout, false)
    }

    /// A single raw receive
    ///
    /// Returns `Ok(0)` if nothing is available on a non-blocking socket.
    /// A peer close or any other error disconnects the socket.
    pub fn read_unbuffered(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.state.is_open() {
            return Err(Error::InvalidState(self.state));
        }

        let ops = self.ops.as_mut().ok_or(Error::InvalidState(self.state))?;
        match ops.recv(buf) {
            Ok(0) if !buf.is_empty() => {
                self.disconnect();
                Err(Error::ConnectionClosed)
            }
            Ok(n) => Ok(n),
            Err(e) if is_retryable(&e) => Ok(0),
            Err(e) => Err(self.fatal(e)),
        }
    }

    /// Receive one framed message into `buffer`
    ///
    /// Returns `Ok(false)` on timeout. A header that already arrived is
    /// not read again: the next call resumes with the payload. A header
    /// announcing more than `max_message_size` bytes is an error and
    /// disconnects the socket.
    pub fn receive(&mut self, buffer: &mut BytesMut, timeout: Timeout) -> Result<bool> {
        if !self.state.is_open() {
            return Err(Error::InvalidState(self.state));
        }

        buffer.clear();

        if !self.header_received {
            let mut header = [0u8; MESSAGE_HEADER_SIZE];
            if !self.read_exact(&mut header, timeout)? {
                return Ok(false);
            }
            let length = u32::from_le_bytes(header) as usize;
            if length > self.max_message_size {
                tracing::debug!(peer = ?self.peer, length, "oversized message header");
                self.disconnect();
                return Err(Error::MessageTooLarge(length));
            }
            self.message_length = length;
            self.header_received = true;
        }

        let length = self.message_length;
        buffer.resize(length, 0);

        if self.read(Some(&mut buffer[..]), length, timeout, false)? {
            self.header_received = false;
            Ok(true)
        } else {
            buffer.clear();
            Ok(false)
        }
    }

    /// Send one framed message
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let length = u32::try_from(data.len()).map_err(|_| Error::MessageTooLarge(data.len()))?;

        self.write_all(&length.to_le_bytes())?;
        self.write_all(data)
    }

    /// Send the contents of `buffer` as one framed message
    pub fn send_buffer(&mut self, buffer: &BytesMut) -> Result<()> {
        self.send(&buffer[..])
    }

    /// Blocking write
    ///
    /// Loops until everything is sent, waiting for the socket to become
    /// writable whenever the kernel buffer is full. The count is short
    /// only if a non-retryable error occurred; the socket is then
    /// disconnected and `last_error` describes the failure.
    pub fn write(&mut self, input: &[u8]) -> Result<usize> {
        if !self.state.is_open() {
            return Err(Error::InvalidState(self.state));
        }

        let mut sent_total = 0;

        while sent_total < input.len() {
            let ops = match self.ops.as_mut() {
                Some(ops) => ops,
                None => break,
            };

            match ops.send(&input[sent_total..]) {
                Ok(0) => {
                    self.fatal(io::ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => sent_total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = ops.poll(PollEvents::Write, None) {
                        self.fatal(e);
                        break;
                    }
                }
                Err(e) => {
                    self.fatal(e);
                    break;
                }
            }
        }

        tracing::trace!(sent = sent_total, length = input.len(), "write");
        Ok(sent_total)
    }

    /// Blocking write that fails unless all of `input` was sent
    pub fn write_all(&mut self, input: &[u8]) -> Result<()> {
        if self.write(input)? == input.len() {
            return Ok(());
        }

        let (kind, msg) = self
            .last_error
            .clone()
            .unwrap_or((io::ErrorKind::WriteZero, "short write".to_string()));
        Err(Error::Io(io::Error::new(kind, msg)))
    }

    /// Push the blocking and Nagle settings down to the handle
    fn update_socket(&mut self) -> Result<()> {
        let applied = match self.ops.as_ref() {
            Some(ops) => ops
                .set_nonblocking(!self.blocking)
                .and_then(|_| ops.set_nodelay(!self.delay_enabled)),
            None => Ok(()),
        };

        applied.map_err(|e| self.record(e))
    }

    fn record(&mut self, e: io::Error) -> Error {
        self.last_error = Some((e.kind(), e.to_string()));
        Error::Io(e)
    }

    /// Record a non-retryable error and drop the connection
    fn fatal(&mut self, e: io::Error) -> Error {
        tracing::debug!(peer = ?self.peer, error = %e, "fatal socket error");
        let err = self.record(e);
        self.disconnect();
        err
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        TcpSocket::new(false)
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("blocking", &self.blocking)
            .field("delay_enabled", &self.delay_enabled)
            .finish()
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
