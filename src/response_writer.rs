//! Response state tracking over a write-once response sink.
//!
//! An HTTP response commits exactly once: after the status line goes out no
//! header can change. [`ResponseWriter`] decorates the host server's
//! [`RawResponse`] and records what has happened so far, so a middleware that
//! runs after `next` can see the final status and body size, and a middleware
//! that runs before it can register a hook that fires right before commit.
//!
//! ```text
//! w.before(hook_a)       w.before(hook_b)
//!        │                      │
//!        ▼                      ▼
//! w.write(b"hi") ──► write_status(200) ──► hook_b, hook_a ──► raw.write_status ──► raw.write
//! ```
//!
//! Optional transport capabilities (flush, hijack, push) are queried on the
//! raw sink through the `as_*` methods rather than expressed as supertraits.

use std::fmt;
use std::io;
use std::mem;

use http::{HeaderMap, StatusCode};
use hyper::upgrade::OnUpgrade;
use tracing::warn;

use crate::error::Error;

// ── Raw sink ──────────────────────────────────────────────────────────────────

/// The host server's response-writing capability.
///
/// `write_status` sends the response head with whatever is in
/// [`headers_mut`](RawResponse::headers_mut) at that moment.
pub trait RawResponse: Send {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
    fn write_status(&mut self, status: StatusCode);
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn as_flush(&mut self) -> Option<&mut dyn Flush> { None }
    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> { None }
    fn as_push(&mut self) -> Option<&mut dyn Push> { None }
}

/// Sinks that can push buffered body bytes to the client before the handler returns.
pub trait Flush {
    fn flush(&mut self) -> io::Result<()>;
}

/// Sinks that can hand the underlying connection over to the caller.
///
/// The caller is expected to answer `101 Switching Protocols` and then await
/// the returned [`OnUpgrade`].
pub trait Hijack {
    fn hijack(&mut self) -> Result<OnUpgrade, Error>;
}

/// Sinks that can initiate an HTTP/2 server push.
pub trait Push {
    fn push(&mut self, target: &str, headers: HeaderMap) -> Result<(), Error>;
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

type BeforeFn = Box<dyn FnOnce(&mut ResponseWriter) + Send + 'static>;

/// Per-request response wrapper handed to every middleware in the chain.
pub struct ResponseWriter {
    raw: Box<dyn RawResponse>,
    status: Option<StatusCode>,
    committed: bool,
    size: usize,
    before: Vec<BeforeFn>,
}

impl ResponseWriter {
    pub fn new(raw: impl RawResponse + 'static) -> Self {
        Self::from_boxed(Box::new(raw))
    }

    pub fn from_boxed(raw: Box<dyn RawResponse>) -> Self {
        Self { raw, status: None, committed: false, size: 0, before: Vec::new() }
    }

    /// The status written so far, `None` until `write_status` (or the first `write`).
    pub fn status(&self) -> Option<StatusCode> { self.status }

    /// Whether the response head has been sent.
    pub fn written(&self) -> bool { self.committed }

    /// Total body bytes accepted by the raw sink.
    pub fn size(&self) -> usize { self.size }

    /// Pending response headers. Changes after commit are not sent.
    pub fn headers(&self) -> &HeaderMap { self.raw.headers() }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { self.raw.headers_mut() }

    /// Registers `f` to run immediately before the response commits.
    ///
    /// Hooks run once, most recently registered first, and may still modify
    /// headers.
    pub fn before<F>(&mut self, f: F)
    where
        F: FnOnce(&mut ResponseWriter) + Send + 'static,
    {
        self.before.push(Box::new(f));
    }

    /// Commits the response with `status`.
    ///
    /// Only the first call has any effect; later calls are logged and dropped.
    pub fn write_status(&mut self, status: StatusCode) {
        if let Some(previous) = self.status {
            warn!(%previous, ignored = %status, "superfluous write_status call");
            return;
        }

        self.status = Some(status);
        let hooks = mem::take(&mut self.before);
        for hook in hooks.into_iter().rev() {
            hook(self);
        }
        self.raw.write_status(status);
        self.committed = true;
    }

    /// Writes body bytes, committing with `200 OK` first if nothing was committed yet.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_status(StatusCode::OK);
        }
        let n = self.raw.write(buf)?;
        self.size += n;
        Ok(n)
    }

    pub fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes())
    }

    /// Sends buffered body bytes to the client. No-op when the sink cannot flush.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.raw.as_flush().is_none() {
            return Ok(());
        }
        if self.status.is_none() {
            self.write_status(StatusCode::OK);
        }
        match self.raw.as_flush() {
            Some(flusher) => flusher.flush(),
            None => Ok(()),
        }
    }

    /// Takes over the underlying connection.
    pub fn hijack(&mut self) -> Result<OnUpgrade, Error> {
        self.raw.as_hijack().ok_or(Error::HijackUnsupported)?.hijack()
    }

    /// Initiates a server push for `target`.
    pub fn push(&mut self, target: &str, headers: HeaderMap) -> Result<(), Error> {
        self.raw.as_push().ok_or(Error::PushUnsupported)?.push(target, headers)
    }
}

impl io::Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseWriter::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        ResponseWriter::flush(self)
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("status", &self.status)
            .field("committed", &self.committed)
            .field("size", &self.size)
            .field("before", &self.before.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use http::HeaderValue;
    use http::header::{CONTENT_TYPE, SERVER};

    use super::*;
    use crate::test_util::RecordingResponse;

    #[test]
    fn write_commits_ok_implicitly() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        assert!(!w.written());
        assert_eq!(w.status(), None);

        w.write(b"hello").unwrap();
        w.write_str(" world").unwrap();

        assert!(w.written());
        assert_eq!(w.status(), Some(StatusCode::OK));
        assert_eq!(w.size(), 11);

        let rec = rec.lock();
        assert_eq!(rec.status, Some(StatusCode::OK));
        assert_eq!(rec.body, b"hello world");
        assert_eq!(rec.events, ["status 200", "write 5", "write 6"]);
    }

    #[test]
    fn explicit_status_is_kept() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        w.write_status(StatusCode::CREATED);
        write!(w, "id={}", 42).unwrap();

        assert_eq!(w.status(), Some(StatusCode::CREATED));
        assert_eq!(w.size(), 5);
        assert_eq!(rec.lock().status, Some(StatusCode::CREATED));
    }

    #[test]
    fn second_write_status_is_ignored() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        w.write_status(StatusCode::ACCEPTED);
        w.write_status(StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(w.status(), Some(StatusCode::ACCEPTED));
        assert_eq!(rec.lock().events, ["status 202"]);
    }

    #[test]
    fn hooks_run_once_in_reverse_before_commit() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let seen = std::sync::Arc::clone(&seen);
            w.before(move |w| {
                assert!(!w.written());
                seen.lock().push((name, w.status()));
            });
        }

        w.write(b"x").unwrap();
        w.write(b"y").unwrap();
        w.write_status(StatusCode::NOT_FOUND);

        assert_eq!(
            *seen.lock(),
            [
                ("third", Some(StatusCode::OK)),
                ("second", Some(StatusCode::OK)),
                ("first", Some(StatusCode::OK)),
            ],
        );
        assert_eq!(rec.lock().events[0], "status 200");
    }

    #[test]
    fn hooks_can_set_headers_before_commit() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        w.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        w.before(|w| {
            let status = w.status().map_or(0, |s| s.as_u16());
            w.headers_mut().insert(SERVER, HeaderValue::from(status));
        });

        w.write_status(StatusCode::IM_A_TEAPOT);

        let rec = rec.lock();
        assert_eq!(rec.committed_headers[SERVER], "418");
        assert_eq!(rec.committed_headers[CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn flush_commits_when_supported() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw.flushable());
        w.flush().unwrap();

        assert!(w.written());
        assert_eq!(rec.lock().events, ["status 200", "flush"]);
    }

    #[test]
    fn flush_is_noop_without_support() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        w.flush().unwrap();

        assert!(!w.written());
        assert!(rec.lock().events.is_empty());
    }

    #[test]
    fn unsupported_capabilities_report_errors() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);

        assert!(matches!(w.hijack(), Err(Error::HijackUnsupported)));
        assert!(matches!(w.push("/app.css", HeaderMap::new()), Err(Error::PushUnsupported)));
        assert!(!w.written());
        assert!(rec.lock().events.is_empty());
    }

    #[test]
    fn supported_capabilities_are_forwarded() {
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw.hijackable().pushable());

        assert!(w.hijack().is_ok());
        w.push("/app.css", HeaderMap::new()).unwrap();

        assert!(!w.written());
        assert_eq!(w.size(), 0);
        assert_eq!(rec.lock().events, ["hijack", "push /app.css"]);
    }
}
