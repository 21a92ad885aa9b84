//! HTTP/1.1 GET client
//!
//! This module multiplexes many logical GET requests over one persistent
//! connection per remote host.
//!
//! # Architecture
//!
//! - `HttpClient` maps host names to sessions, creating them lazily
//! - `HttpSession` is a per-host worker thread with a FIFO request queue
//!   and a single persistent `TcpSocket`
//! - `HttpRequest` carries the resource, timeout and status of one GET and
//!   reports progress through a `RequestListener`
//!
//! # Examples
//!
//! ```no_run
//! use hostwire::http::{HttpClient, HttpRequest, RequestListener, RequestStatus};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Printer;
//!
//! impl RequestListener for Printer {
//!     fn on_data_ready(&self, _request: &HttpRequest, _length: u64) -> bool {
//!         true
//!     }
//!
//!     fn on_data(&self, _request: &HttpRequest, data: &[u8]) {
//!         print!("{}", String::from_utf8_lossy(data));
//!     }
//!
//!     fn on_status_change(&self, request: &HttpRequest) {
//!         if request.status() == RequestStatus::Failed {
//!             eprintln!("failed: {}", request.fail_reason());
//!         }
//!     }
//! }
//!
//! let client = HttpClient::new();
//! client.request(HttpRequest::new("http://example.com/index.html", Arc::new(Printer)));
//! client.wait_for(Some(Duration::from_secs(10)));
//! ```

pub mod client;
pub mod request;
pub mod response;
pub mod session;
pub mod uri;

pub use client::HttpClient;
pub use request::{HttpRequest, Method, RequestListener, RequestStatus};
pub use response::ResponseHead;
pub use session::{HttpSession, SessionConfig};
pub use uri::{Uri, UriParts};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
///
/// The `Display` text of the request-level variants is what a failed
/// request reports as its fail reason.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to connect to {0}")]
    Connect(String),

    #[error("HTTP error: {0}")]
    Status(String),

    #[error("Connection lost or timed out")]
    ConnectionLost,

    #[error("Unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default size of the chunks a response body is delivered in
pub const DEFAULT_BUFFER_SIZE: usize = 0x1000;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
