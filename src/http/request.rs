//! HTTP request value and listener interface

use crate::net::Timeout;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
}

impl Method {
    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request life cycle
///
/// `Ready -> Queued -> Processing -> {Successful | Failed | Aborted}`.
/// Queued requests can also go straight to `Aborted` when cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Ready,
    Queued,
    Processing,
    Successful,
    Failed,
    Aborted,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Successful | RequestStatus::Failed | RequestStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Ready => "ready",
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Successful => "successful",
            RequestStatus::Failed => "failed",
            RequestStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receives the progress of a request
///
/// All callbacks for one request come from the session thread that owns
/// it, one at a time. `on_status_change` for `Queued` runs on the
/// submitting thread before the request is handed to its session.
pub trait RequestListener: Send + Sync {
    /// A body of `length` bytes follows; return true to receive it
    fn on_data_ready(&self, _request: &HttpRequest, _length: u64) -> bool {
        false
    }

    /// One chunk of the body
    fn on_data(&self, _request: &HttpRequest, _data: &[u8]) {}

    /// The request moved to a new status
    fn on_status_change(&self, _request: &HttpRequest) {}
}

/// One GET request
pub struct HttpRequest {
    url: String,
    host: String,
    path: String,
    method: Method,
    listener: Arc<dyn RequestListener>,
    pub(crate) timeout: Timeout,
    status: RequestStatus,
    fail_reason: String,
    pub(crate) connection_lost: bool,
}

impl HttpRequest {
    /// Create a request for `url` (`[http://]host[:port]/path`)
    pub fn new(url: impl Into<String>, listener: Arc<dyn RequestListener>) -> Self {
        HttpRequest {
            url: url.into(),
            host: String::new(),
            path: String::new(),
            method: Method::Get,
            listener,
            timeout: Timeout::infinite(),
            status: RequestStatus::Ready,
            fail_reason: String::new(),
            connection_lost: false,
        }
    }

    /// Bound every step of the exchange by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Timeout::new(timeout);
        self
    }

    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    /// The URL as submitted
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host key the request was routed by, empty until submitted
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path sent in the request line
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Why the request failed; empty unless `status()` is `Failed`
    pub fn fail_reason(&self) -> &str {
        &self.fail_reason
    }

    pub fn timeout(&self) -> &Timeout {
        &self.timeout
    }

    pub(crate) fn listener(&self) -> Arc<dyn RequestListener> {
        Arc::clone(&self.listener)
    }

    pub(crate) fn set_target(&mut self, host: &str, path: &str) {
        self.host = host.to_string();
        self.path = path.to_string();
    }

    pub(crate) fn change_status(&mut self, status: RequestStatus) {
        self.status = status;
        let listener = self.listener();
        listener.on_status_change(self);
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.fail_reason = reason.into();
        tracing::warn!(url = %self.url, reason = %self.fail_reason, "request failed");
        self.change_status(RequestStatus::Failed);
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("status", &self.status)
            .field("fail_reason", &self.fail_reason)
            .finish()
    }
}
