//! Per-host request worker
//!
//! An `HttpSession` owns the FIFO queue of requests for one host and a
//! worker thread that drains it over a single persistent connection.
//! The worker exits when the queue runs dry and is restarted by the next
//! `request`. The connection outlives the thread: on exit the worker parks
//! its socket in the queue state and the next worker picks it up.

use super::response::ResponseHead;
use super::uri::{split_host_port, Uri};
use super::{Error, HttpRequest, RequestStatus, Result, CRLF, DEFAULT_BUFFER_SIZE, DEFAULT_HTTP_PORT};
use crate::net::{TcpSocket, Timeout};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Port used when the host key has no `:port` suffix
    pub port: u16,
    /// Chunk size for body delivery
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            port: DEFAULT_HTTP_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Worker for all requests to one host
pub struct HttpSession {
    shared: Arc<Shared>,
}

struct Shared {
    host: String,
    default_port: u16,
    buffer_size: AtomicUsize,
    queue: Mutex<SessionQueue>,
    idle: Condvar,
}

#[derive(Default)]
struct SessionQueue {
    requests: VecDeque<HttpRequest>,
    running: bool,
    worker: Option<JoinHandle<()>>,
    parked: Option<TcpSocket>,
}

impl HttpSession {
    /// Create an idle session for `host` (`name[:port]`)
    pub fn new(host: impl Into<String>, config: SessionConfig) -> Self {
        HttpSession {
            shared: Arc::new(Shared {
                host: host.into(),
                default_port: config.port,
                buffer_size: AtomicUsize::new(config.buffer_size.max(1)),
                queue: Mutex::new(SessionQueue::default()),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.shared.host
    }

    pub fn set_buffer_size(&self, size: usize) {
        self.shared.buffer_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size.load(Ordering::Relaxed)
    }

    /// Queue `request`, starting the worker if it is not running
    pub fn request(&self, mut request: HttpRequest) {
        request.change_status(RequestStatus::Queued);

        let mut queue = self.shared.lock_queue();
        queue.requests.push_back(request);

        if queue.running {
            return;
        }

        // The previous worker has already given up the lock for good
        if let Some(finished) = queue.worker.take() {
            let _ = finished.join();
        }

        let shared = Arc::clone(&self.shared);
        let socket = queue.parked.take();
        let spawned = thread::Builder::new()
            .name(format!("http-session-{}", self.shared.host))
            .spawn(move || Worker::new(shared, socket).run());

        match spawned {
            Ok(handle) => {
                queue.running = true;
                queue.worker = Some(handle);
                tracing::debug!(host = %self.shared.host, "session worker started");
            }
            Err(e) => {
                let failed = queue.requests.pop_back();
                drop(queue);
                if let Some(mut request) = failed {
                    request.fail(format!("Unable to start session worker: {}", e));
                }
            }
        }
    }

    /// Abort every request still waiting in the queue
    ///
    /// A request that is already being processed runs to completion.
    pub fn cancel_all_requests(&self) {
        let drained: Vec<HttpRequest> = self.shared.lock_queue().requests.drain(..).collect();

        if !drained.is_empty() {
            tracing::debug!(host = %self.shared.host, count = drained.len(), "requests aborted");
        }

        for mut request in drained {
            request.change_status(RequestStatus::Aborted);
        }
    }

    /// Whether the worker thread is busy with the queue
    pub fn is_running(&self) -> bool {
        self.shared.lock_queue().running
    }

    /// Number of requests waiting behind the current one
    pub fn queued(&self) -> usize {
        self.shared.lock_queue().requests.len()
    }

    /// Wait until the worker has drained the queue
    ///
    /// `None` waits forever. Returns false if the worker is still running
    /// when `timeout` expires.
    pub fn wait_for(&self, timeout: Option<Duration>) -> bool {
        let queue = self.shared.lock_queue();

        let queue = match timeout {
            Some(timeout) => {
                self.shared
                    .idle
                    .wait_timeout_while(queue, timeout, |q| q.running)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
            None => self
                .shared
                .idle
                .wait_while(queue, |q| q.running)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        };

        !queue.running
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("host", &self.shared.host)
            .field("buffer_size", &self.buffer_size())
            .finish()
    }
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, SessionQueue> {
        // A panicking listener must not wedge the whole session
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of one attempt at a request
enum Attempt {
    Done,
    Retry,
}

/// State owned by the worker thread
struct Worker {
    shared: Arc<Shared>,
    socket: Option<TcpSocket>,
}

impl Worker {
    fn new(shared: Arc<Shared>, socket: Option<TcpSocket>) -> Self {
        Worker { shared, socket }
    }

    fn run(mut self) {
        loop {
            let request = {
                let mut queue = self.shared.lock_queue();
                match queue.requests.pop_front() {
                    Some(request) => request,
                    None => {
                        queue.parked = self.socket.take();
                        queue.running = false;
                        self.shared.idle.notify_all();
                        tracing::debug!(host = %self.shared.host, "session worker idle");
                        return;
                    }
                }
            };

            // A panicking listener costs its own request and the connection
            // it was using, never the worker
            if panic::catch_unwind(AssertUnwindSafe(|| self.process(request))).is_err() {
                tracing::error!(host = %self.shared.host, "request listener panicked");
                self.socket = None;
            }
        }
    }

    /// Drive one request to a terminal status
    fn process(&mut self, mut request: HttpRequest) {
        tracing::debug!(host = %self.shared.host, path = %request.path(), "processing request");
        request.change_status(RequestStatus::Processing);

        loop {
            match self.attempt(&mut request) {
                Ok(Attempt::Done) => {
                    request.change_status(RequestStatus::Successful);
                    break;
                }
                Ok(Attempt::Retry) => {
                    tracing::debug!(host = %self.shared.host, "connection lost, retrying once");
                }
                Err(e) => {
                    request.fail(e.to_string());
                    break;
                }
            }
        }
    }

    /// One request/response exchange over the persistent connection
    fn attempt(&mut self, request: &mut HttpRequest) -> Result<Attempt> {
        let head = format!(
            "{} {} HTTP/1.1{crlf}Host: {}{crlf}{crlf}",
            request.method(),
            Uri::escape(request.path()),
            self.shared.host,
            crlf = CRLF,
        );

        let socket = self.connected_socket()?;
        request.timeout.reset();

        // A stale connection can fail on write as well as on read
        let sent = socket.write_all(head.as_bytes()).is_ok();

        let mut response = ResponseHead::new();
        loop {
            let line = if sent {
                read_line(socket, &request.timeout)
            } else {
                None
            };

            let Some(line) = line else {
                self.socket = None;

                if request.connection_lost {
                    return Err(Error::ConnectionLost);
                }
                request.connection_lost = true;
                return Ok(Attempt::Retry);
            };

            if line.is_empty() {
                break;
            }
            response.interpret(&line);
        }

        tracing::debug!(
            host = %self.shared.host,
            status = ?response.status_code(),
            length = response.content_length,
            "response head received"
        );

        let failure = response.failure();

        if response.transfer_encoding.is_some() {
            // Body length unknown, the connection cannot be reused
            self.socket = None;
            return Err(failure.unwrap_or(Error::ConnectionLost));
        }

        if response.content_length > 0 {
            self.receive_body(request, response.content_length, failure.is_none())?;
        }

        if !response.keeps_connection() {
            self.socket = None;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(Attempt::Done),
        }
    }

    /// Stream `length` body bytes to the listener in fixed-size chunks
    ///
    /// The body is always read off the connection; the listener only sees
    /// it if `deliver` is set and it asks for it.
    fn receive_body(&mut self, request: &HttpRequest, length: u64, deliver: bool) -> Result<()> {
        let listener = request.listener();
        let wants = deliver && listener.on_data_ready(request, length);

        let buffer_size = self.shared.buffer_size.load(Ordering::Relaxed);
        let mut buffer = vec![0u8; buffer_size];
        let mut remaining = length;

        while remaining > 0 {
            let chunk = remaining.min(buffer_size as u64) as usize;

            let complete = match self.socket.as_mut() {
                Some(socket) => matches!(
                    socket.read_exact(&mut buffer[..chunk], request.timeout),
                    Ok(true)
                ),
                None => false,
            };

            if !complete {
                self.socket = None;
                return Err(Error::ConnectionLost);
            }

            if wants {
                listener.on_data(request, &buffer[..chunk]);
            }
            remaining -= chunk as u64;
        }

        Ok(())
    }

    /// The persistent connection, opened on first use
    fn connected_socket(&mut self) -> Result<&mut TcpSocket> {
        let reusable = self
            .socket
            .as_ref()
            .map_or(false, |socket| socket.state().is_open());

        if !reusable {
            self.socket = Some(self.connect()?);
        }

        self.socket
            .as_mut()
            .ok_or_else(|| Error::Connect(self.shared.host.clone()))
    }

    fn connect(&self) -> Result<TcpSocket> {
        let host = &self.shared.host;
        let unable = || Error::Connect(host.clone());

        let (name, port) = split_host_port(host).map_err(|_| unable())?;
        let port = port.unwrap_or(self.shared.default_port);

        let mut socket = TcpSocket::new(true);
        match socket.connect(name, port, true) {
            Ok(_) => {
                tracing::debug!(%host, port, "session connected");
                Ok(socket)
            }
            Err(e) => {
                tracing::warn!(%host, port, error = %e, "connect failed");
                Err(unable())
            }
        }
    }
}

/// Read one response line, tolerating a missing CR
///
/// Returns `None` if the connection failed or `timeout` expired.
fn read_line(socket: &mut TcpSocket, timeout: &Timeout) -> Option<String> {
    let mut line = Vec::new();

    loop {
        let mut next = [0u8; 1];
        match socket.read_exact(&mut next, *timeout) {
            Ok(true) => {}
            Ok(false) | Err(_) => return None,
        }

        match next[0] {
            0 | b'\n' => break,
            b'\r' => {}
            c => line.push(c),
        }
    }

    Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestListener;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RequestListener for Recorder {
        fn on_data_ready(&self, _request: &HttpRequest, length: u64) -> bool {
            self.events.lock().unwrap().push(format!("ready {}", length));
            true
        }

        fn on_data(&self, _request: &HttpRequest, data: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("data {}", String::from_utf8_lossy(data)));
        }

        fn on_status_change(&self, request: &HttpRequest) {
            let mut event = format!("{} {}", request.path(), request.status());
            if request.status() == RequestStatus::Failed {
                event = format!("{} ({})", event, request.fail_reason());
            }
            self.events.lock().unwrap().push(event);
        }
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).unwrap() == 0 {
                break;
            }
            request.push(byte[0]);
        }
        String::from_utf8(request).unwrap()
    }

    fn queued(path: &str, recorder: &Arc<Recorder>, host: &str) -> HttpRequest {
        let mut request = HttpRequest::new(path, recorder.clone());
        request.set_target(host, path);
        request.set_timeout(Timeout::new(Duration::from_secs(2)));
        request
    }

    #[test]
    fn test_read_line_variants() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"first\r\nsecond\n\r\n").unwrap();
            thread::sleep(Duration::from_millis(100));
        });

        let mut socket = TcpSocket::new(true);
        socket.connect("127.0.0.1", port, true).unwrap();
        let timeout = Timeout::new(Duration::from_secs(1));

        assert_eq!(read_line(&mut socket, &timeout).as_deref(), Some("first"));
        assert_eq!(read_line(&mut socket, &timeout).as_deref(), Some("second"));
        assert_eq!(read_line(&mut socket, &timeout).as_deref(), Some(""));

        handle.join().unwrap();
    }

    #[test]
    fn test_session_get() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = format!("127.0.0.1:{}", port);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();
            request
        });

        let recorder = Arc::new(Recorder::default());
        let session = HttpSession::new(host.clone(), SessionConfig::default());
        session.request(queued("/a b.txt", &recorder, &host));

        assert!(session.wait_for(Some(Duration::from_secs(5))));
        assert!(!session.is_running());

        let request = server.join().unwrap();
        assert_eq!(
            request,
            format!("GET /a%20b.txt HTTP/1.1\r\nHost: {}\r\n\r\n", host)
        );

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "/a b.txt queued",
                "/a b.txt processing",
                "ready 5",
                "data hello",
                "/a b.txt successful",
            ]
        );
    }

    #[test]
    fn test_body_delivered_in_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = format!("127.0.0.1:{}", port);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabcdefghij")
                .unwrap();
        });

        let recorder = Arc::new(Recorder::default());
        let session = HttpSession::new(
            host.clone(),
            SessionConfig {
                port: DEFAULT_HTTP_PORT,
                buffer_size: 4,
            },
        );
        assert_eq!(session.buffer_size(), 4);
        session.request(queued("/", &recorder, &host));
        assert!(session.wait_for(Some(Duration::from_secs(5))));
        server.join().unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[2], "ready 10");
        assert_eq!(events[3], "data abcd");
        assert_eq!(events[4], "data efgh");
        assert_eq!(events[5], "data ij");
        assert_eq!(events[6], "/ successful");
    }

    #[test]
    fn test_unable_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let host = format!("127.0.0.1:{}", port);

        let recorder = Arc::new(Recorder::default());
        let session = HttpSession::new(host.clone(), SessionConfig::default());
        session.request(queued("/x", &recorder, &host));
        assert!(session.wait_for(Some(Duration::from_secs(5))));

        let events = recorder.events.lock().unwrap();
        assert_eq!(
            events.last().unwrap(),
            &format!("/x failed (Unable to connect to {})", host)
        );
    }

    #[test]
    fn test_wait_for_idle_session() {
        let session = HttpSession::new("example.test", SessionConfig::default());
        assert!(!session.is_running());
        assert!(session.wait_for(Some(Duration::from_millis(10))));
        assert_eq!(session.host_name(), "example.test");
        assert_eq!(session.queued(), 0);
    }

    struct Panicker;

    impl RequestListener for Panicker {
        fn on_data_ready(&self, _request: &HttpRequest, _length: u64) -> bool {
            panic!("listener blew up");
        }
    }

    #[test]
    fn test_listener_panic_spares_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = format!("127.0.0.1:{}", port);

        // The panicking request's connection is dropped, so expect two
        let server = thread::spawn(move || {
            for body in ["ok", "fine"] {
                let (mut stream, _) = listener.accept().unwrap();
                read_request(&mut stream);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });

        let session = HttpSession::new(host.clone(), SessionConfig::default());

        let mut doomed = HttpRequest::new("/boom", Arc::new(Panicker));
        doomed.set_target(&host, "/boom");
        doomed.set_timeout(Timeout::new(Duration::from_secs(2)));
        session.request(doomed);
        assert!(session.wait_for(Some(Duration::from_secs(5))));
        assert!(!session.is_running());

        let recorder = Arc::new(Recorder::default());
        session.request(queued("/after", &recorder, &host));
        assert!(session.wait_for(Some(Duration::from_secs(5))));
        server.join().unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "/after queued",
                "/after processing",
                "ready 4",
                "data fine",
                "/after successful",
            ]
        );
    }
}
