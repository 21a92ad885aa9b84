//! Response head interpretation
//!
//! The session reads a response one line at a time. `ResponseHead`
//! collects the few things the client acts on: the status line, the body
//! length, whether the server will close the connection and whether the
//! body uses a transfer encoding the client cannot decode. Every other
//! header is consumed and ignored.

use super::Error;

/// What the client learned from a response head
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status line, if one was seen
    pub status_line: Option<String>,
    /// Set when the status code is not 2xx
    pub status_error: Option<String>,
    /// Declared body length (`Content-Length`), zero if absent
    pub content_length: u64,
    /// `Connection: close` was sent
    pub close: bool,
    /// Value of an unsupported `Transfer-Encoding` header
    pub transfer_encoding: Option<String>,
}

impl ResponseHead {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one header line (without its line terminator)
    pub fn interpret(&mut self, line: &str) {
        if line.starts_with("HTTP") {
            if !is_success_status(line) {
                self.status_error = Some(line.to_string());
            }
            self.status_line = Some(line.to_string());
            return;
        }

        let Some((name, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("Content-Length") {
            // Unparseable lengths count as no body
            self.content_length = value.parse::<u64>().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("Connection") {
            if value.eq_ignore_ascii_case("close") {
                self.close = true;
            }
        } else if name.eq_ignore_ascii_case("Transfer-Encoding")
            && !value.eq_ignore_ascii_case("identity")
        {
            self.transfer_encoding = Some(value.to_string());
        }
    }

    /// The failure this response represents, if any
    ///
    /// An unsupported transfer encoding wins over a bad status because the
    /// body cannot be drained either way.
    pub fn failure(&self) -> Option<Error> {
        if let Some(encoding) = &self.transfer_encoding {
            return Some(Error::UnsupportedTransferEncoding(encoding.clone()));
        }
        self.status_error.clone().map(Error::Status)
    }

    /// Whether the connection can carry the next request
    pub fn keeps_connection(&self) -> bool {
        !self.close && self.transfer_encoding.is_none()
    }

    /// Numeric status code, if the status line carried one
    pub fn status_code(&self) -> Option<u16> {
        self.status_line
            .as_deref()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
    }
}

/// True if the second token of a status line starts with `2`
fn is_success_status(line: &str) -> bool {
    line.split_whitespace()
        .nth(1)
        .map_or(false, |code| code.starts_with('2'))
}
