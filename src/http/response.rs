//! Per-request HTTP response writer.
//!
//! A [`Response`] is handed to every handler and middleware as `&mut Response`.
//! It enforces the finalization invariants of the dispatch core:
//!
//! - the status is **write-once**: the first non-zero [`status`](Response::status)
//!   call wins, later calls are ignored;
//! - the head (status line + headers) is **committed exactly once**, either
//!   explicitly through [`write_header`](Response::write_header) or implicitly by
//!   the first [`write`](Response::write). Headers changed after the commit do
//!   not reach the wire;
//! - once [`hijacked`](Response::hijack), every write is a logged no-op.
//!
//! Bytes are buffered in-process; the server serializes the committed head and
//! the body with [`into_bytes`](Response::into_bytes) once dispatch is over.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{error, warn};

use super::{Headers, StatusCode};

/// Content type used for every structured (JSON) body.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Takes over the raw connection once dispatch has finished.
///
/// Receives the stream and any bytes the server had already read past the
/// current request.
pub type Upgrade =
    Box<dyn FnOnce(TcpStream, Bytes) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

// The head as it was when it was committed.
#[derive(Debug, Clone)]
struct Head {
    status: u16,
    headers: Headers,
}

/// A mutable, write-once HTTP response.
///
/// # Examples
///
/// ```
/// use trellis::http::{Response, StatusCode};
///
/// let mut res = Response::new();
/// res.status(StatusCode::Created);
/// res.status(StatusCode::Ok); // ignored: status is write-once
/// res.write(b"done");
///
/// assert_eq!(res.status_code(), 201);
/// assert!(res.is_header_written());
/// assert!(!res.is_empty());
/// ```
pub struct Response {
    status: u16,
    headers: Headers,
    head: Option<Head>,
    body: BytesMut,
    hijacked: bool,
    upgrade: Option<Upgrade>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 0,
            headers: Headers::new(),
            head: None,
            body: BytesMut::new(),
            hijacked: false,
            upgrade: None,
        }
    }

    /// Sets the status if none has been set yet. `0` is ignored.
    pub fn status(&mut self, code: impl Into<u16>) {
        let code = code.into();
        if self.status == 0 {
            self.status = code;
        }
    }

    /// Current status; `0` while unset.
    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Live header map. Changes made after the head is committed are not sent.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// `true` until the first body byte is written.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn is_header_written(&self) -> bool {
        self.head.is_some()
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Commits the head. `code` only applies if no status was set before;
    /// with neither, the head goes out as 200. A second call is a no-op.
    pub fn write_header(&mut self, code: impl Into<u16>) {
        if self.hijacked {
            warn!("write_header on a hijacked response ignored");
            return;
        }
        if let Some(head) = &self.head {
            warn!(committed = head.status, "header already written");
            return;
        }
        self.status(code);
        if self.status == 0 {
            self.status = StatusCode::Ok.as_u16();
        }
        self.head = Some(Head {
            status: self.status,
            headers: self.headers.clone(),
        });
    }

    /// Appends to the body, committing the head first if needed (status
    /// defaults to 200). Returns the number of bytes accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if self.hijacked {
            warn!(len = bytes.len(), "write on a hijacked response ignored");
            return 0;
        }
        if self.head.is_none() {
            self.write_header(self.status);
        }
        self.body.put_slice(bytes);
        bytes.len()
    }

    /// Writes a plain-text body.
    pub fn string(&mut self, code: impl Into<u16>, body: &str) {
        if !self.is_header_written() && !self.headers.contains("content-type") {
            self.headers.set("Content-Type", "text/plain; charset=utf-8");
        }
        self.write_header(code);
        self.write(body.as_bytes());
    }

    /// Serializes `value` and writes it with the JSON content type.
    ///
    /// A value that fails to serialize turns into a bare 500 for the status
    /// handler to fill in.
    pub fn json<T>(&mut self, code: impl Into<u16>, value: &T)
    where
        T: Serialize + ?Sized,
    {
        let code = code.into();
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if !self.is_header_written() {
                    self.headers.set("Content-Type", JSON_CONTENT_TYPE);
                }
                self.write_header(code);
                self.write(&bytes);
            }
            Err(e) => {
                error!(error = %e, "failed to serialize JSON response body");
                self.status(StatusCode::InternalServerError);
            }
        }
    }

    /// Marks the connection as taken over; `upgrade` runs after dispatch and
    /// nothing else is written.
    ///
    /// Returns `false` (and keeps the response as-is) when the head was already
    /// committed or the response is already hijacked.
    pub fn hijack<F, Fut>(&mut self, upgrade: F) -> bool
    where
        F: FnOnce(TcpStream, Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.hijacked || self.head.is_some() {
            return false;
        }
        self.hijacked = true;
        self.upgrade = Some(Box::new(move |stream, rest| Box::pin(upgrade(stream, rest))));
        true
    }

    /// Removes the upgrade installed by [`hijack`](Self::hijack).
    pub fn take_upgrade(&mut self) -> Option<Upgrade> {
        self.upgrade.take()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Headers as committed, if the head was written.
    pub fn committed_headers(&self) -> Option<&Headers> {
        self.head.as_ref().map(|h| &h.headers)
    }

    /// Serializes the committed head and the body in HTTP/1.1 wire format.
    ///
    /// `include_body` is `false` for `HEAD` requests; `Content-Length` still
    /// reflects the body that would have been sent.
    pub fn into_bytes(self, keep_alive: bool, include_body: bool) -> BytesMut {
        let (status, mut headers) = match self.head {
            Some(head) => (head.status, head.headers),
            None => {
                let status = if self.status == 0 { 200 } else { self.status };
                (status, self.headers)
            }
        };
        let content_length = self.body.len();

        if content_length > 0 && !headers.contains("content-type") {
            headers.insert("Content-Type", "text/plain; charset=utf-8");
        }
        headers.remove("content-length");
        headers.set("Connection", if keep_alive { "keep-alive" } else { "close" });

        let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + content_length);
        buf.put(format!("HTTP/1.1 {} {}\r\n", status, StatusCode::reason(status)).as_bytes());
        buf.put(headers.to_string().as_bytes());
        buf.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());
        if include_body {
            buf.put_slice(&self.body);
        }
        buf
    }

    /// Returns the response to its freshly-constructed state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("header_written", &self.head.is_some())
            .field("body_len", &self.body.len())
            .field("hijacked", &self.hijacked)
            .finish()
    }
}
