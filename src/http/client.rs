//! HTTP client façade
//!
//! Routes each request to the session for its host, creating sessions on
//! first use. Sessions are never removed, so every request for one host
//! goes through the same queue and the same connection.

use super::uri::Uri;
use super::{HttpRequest, HttpSession, SessionConfig};
use crate::net::Timeout;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// HTTP GET client
#[derive(Debug, Default)]
pub struct HttpClient {
    sessions: Mutex<HashMap<String, Arc<HttpSession>>>,
    config: SessionConfig,
}

impl HttpClient {
    /// Create a client with default session settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client whose sessions use `config`
    pub fn with_config(config: SessionConfig) -> Self {
        HttpClient {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Submit a request
    ///
    /// The URL is split into a host key and a path; the request is queued
    /// on the session for that host. Progress and failures are reported
    /// through the request's listener.
    pub fn request(&self, mut request: HttpRequest) {
        let (host, path) = Uri::split_target(request.url());
        let (host, path) = (host.to_string(), path.to_string());
        request.set_target(&host, &path);

        self.session(&host).request(request);
    }

    /// Abort everything still queued on every session
    pub fn cancel_all_requests(&self) {
        for session in self.snapshot() {
            session.cancel_all_requests();
        }
    }

    /// True if any session is still working
    pub fn is_running(&self) -> bool {
        self.snapshot().iter().any(|session| session.is_running())
    }

    /// Wait for every session to drain its queue
    ///
    /// `timeout` bounds the whole wait, not each session. `None` waits
    /// forever. Returns false if some session is still running when it
    /// expires.
    pub fn wait_for(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(Timeout::new).unwrap_or_default();

        self.snapshot()
            .iter()
            .all(|session| session.wait_for(deadline.remaining()))
    }

    /// Host keys of all sessions created so far
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.lock_sessions().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// The session for `host`, created if needed
    pub fn session(&self, host: &str) -> Arc<HttpSession> {
        let mut sessions = self.lock_sessions();

        if let Some(session) = sessions.get(host) {
            return Arc::clone(session);
        }

        tracing::debug!(%host, "creating session");
        let session = Arc::new(HttpSession::new(host, self.config));
        sessions.insert(host.to_string(), Arc::clone(&session));
        session
    }

    fn snapshot(&self) -> Vec<Arc<HttpSession>> {
        self.lock_sessions().values().cloned().collect()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<HttpSession>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
