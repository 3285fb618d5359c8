//! In-memory [`RawResponse`] and [`LogSink`] that record everything they receive.

use std::io;
use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use hyper::upgrade::OnUpgrade;
use parking_lot::Mutex;

use crate::error::Error;
use crate::middleware::LogSink;
use crate::response_writer::{Flush, Hijack, Push, RawResponse};

#[derive(Debug, Default)]
pub(crate) struct Recording {
    pub(crate) status: Option<StatusCode>,
    pub(crate) committed_headers: HeaderMap,
    pub(crate) body: Vec<u8>,
    pub(crate) events: Vec<String>,
}

impl Recording {
    pub(crate) fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("utf-8 body")
    }
}

pub(crate) struct RecordingResponse {
    headers: HeaderMap,
    recording: Arc<Mutex<Recording>>,
    flush: bool,
    hijack: bool,
    push: bool,
}

impl RecordingResponse {
    pub(crate) fn new() -> (Self, Arc<Mutex<Recording>>) {
        let recording = Arc::new(Mutex::new(Recording::default()));
        let raw = Self {
            headers: HeaderMap::new(),
            recording: Arc::clone(&recording),
            flush: false,
            hijack: false,
            push: false,
        };
        (raw, recording)
    }

    pub(crate) fn flushable(mut self) -> Self {
        self.flush = true;
        self
    }

    pub(crate) fn hijackable(mut self) -> Self {
        self.hijack = true;
        self
    }

    pub(crate) fn pushable(mut self) -> Self {
        self.push = true;
        self
    }
}

impl RawResponse for RecordingResponse {
    fn headers(&self) -> &HeaderMap { &self.headers }
    fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    fn write_status(&mut self, status: StatusCode) {
        let mut rec = self.recording.lock();
        rec.status = Some(status);
        rec.committed_headers = self.headers.clone();
        rec.events.push(format!("status {}", status.as_u16()));
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rec = self.recording.lock();
        rec.body.extend_from_slice(buf);
        rec.events.push(format!("write {}", buf.len()));
        Ok(buf.len())
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        if self.flush { Some(self) } else { None }
    }

    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> {
        if self.hijack { Some(self) } else { None }
    }

    fn as_push(&mut self) -> Option<&mut dyn Push> {
        if self.push { Some(self) } else { None }
    }
}

impl Flush for RecordingResponse {
    fn flush(&mut self) -> io::Result<()> {
        self.recording.lock().events.push("flush".to_owned());
        Ok(())
    }
}

impl Hijack for RecordingResponse {
    fn hijack(&mut self) -> Result<OnUpgrade, Error> {
        self.recording.lock().events.push("hijack".to_owned());
        Ok(hyper::upgrade::on(http::Request::new(())))
    }
}

impl Push for RecordingResponse {
    fn push(&mut self, target: &str, _headers: HeaderMap) -> Result<(), Error> {
        self.recording.lock().events.push(format!("push {target}"));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct Lines(Arc<Mutex<Vec<String>>>);

impl Lines {
    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl LogSink for Lines {
    fn log(&self, line: &str) {
        self.0.lock().push(line.to_owned());
    }
}
