//! hostwire - TCP sockets and a per-host HTTP/1.1 GET client
//!
//! This crate provides a state-tracked TCP socket with resumable,
//! timeout-bounded reads and a length-prefixed message protocol, a UDP
//! datagram socket, and an HTTP/1.1 GET client that runs one worker
//! session per remote host.

pub mod http;
pub mod net;
