//! The hyper side of a [`ResponseWriter`](crate::ResponseWriter).
//!
//! The chain runs on its own task. [`HyperResponse`] is the raw sink it
//! writes to: committing sends the response head through a oneshot, so hyper
//! can start answering while the chain is still running, and body bytes flow
//! through an unbounded channel into [`ResponseBody`].
//!
//! ```text
//!  chain task                              connection task
//! ───────────                              ───────────────
//! write_status ──── oneshot(head) ───────► dispatch returns Response
//! write / flush ─── mpsc(chunk) ─────────► ResponseBody::poll_frame
//! ```

use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use hyper::body::{Body, Frame};
use hyper::upgrade::OnUpgrade;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::response_writer::{Flush, Hijack, RawResponse};

/// Buffered body bytes are sent on once they reach this size.
const FLUSH_THRESHOLD: usize = 8 * 1024;

pub(crate) type Chunk = io::Result<Bytes>;
pub(crate) type Head = http::Response<ResponseBody>;

// ── ResponseBody ──────────────────────────────────────────────────────────────

/// Streaming response body fed by the chain task.
///
/// An `Err` chunk aborts the response; hyper resets the stream or closes the
/// connection.
#[derive(Debug)]
pub struct ResponseBody {
    rx: Option<mpsc::UnboundedReceiver<Chunk>>,
}

impl ResponseBody {
    pub(crate) fn empty() -> Self {
        Self { rx: None }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx).map(|chunk| chunk.map(|res| res.map(Frame::data))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }
}

// ── HyperResponse ─────────────────────────────────────────────────────────────

/// Raw sink writing into a hyper response.
pub(crate) struct HyperResponse {
    headers: HeaderMap,
    head: Option<oneshot::Sender<Head>>,
    body: Option<ResponseBody>,
    tx: mpsc::UnboundedSender<Chunk>,
    buf: BytesMut,
    upgrade: Option<OnUpgrade>,
}

impl HyperResponse {
    /// The sink, a receiver for the response head, and a sender the caller can
    /// use to abort the body after the sink is gone.
    pub(crate) fn new(
        upgrade: OnUpgrade,
    ) -> (Self, oneshot::Receiver<Head>, mpsc::UnboundedSender<Chunk>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = tx.clone();
        let sink = Self {
            headers: HeaderMap::new(),
            head: Some(head_tx),
            body: Some(ResponseBody { rx: Some(rx) }),
            tx,
            buf: BytesMut::new(),
            upgrade: Some(upgrade),
        };
        (sink, head_rx, abort)
    }

    fn send_head(&mut self, status: StatusCode) {
        let Some(head) = self.head.take() else { return };
        let body = self.body.take().unwrap_or_else(ResponseBody::empty);
        let mut res = http::Response::new(body);
        *res.status_mut() = status;
        *res.headers_mut() = mem::take(&mut self.headers);
        // The receiver is gone if the client already disconnected.
        let _ = head.send(res);
    }

    fn send_buffered(&mut self) {
        if !self.buf.is_empty() {
            let _ = self.tx.send(Ok(self.buf.split().freeze()));
        }
    }
}

impl RawResponse for HyperResponse {
    fn headers(&self) -> &HeaderMap { &self.headers }
    fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    fn write_status(&mut self, status: StatusCode) {
        self.send_head(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"));
        }
        self.buf.extend_from_slice(buf);
        if self.head.is_none() && self.buf.len() >= FLUSH_THRESHOLD {
            self.send_buffered();
        }
        Ok(buf.len())
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> { Some(self) }
    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> { Some(self) }
}

impl Flush for HyperResponse {
    fn flush(&mut self) -> io::Result<()> {
        self.send_head(StatusCode::OK);
        self.send_buffered();
        Ok(())
    }
}

impl Hijack for HyperResponse {
    fn hijack(&mut self) -> Result<OnUpgrade, Error> {
        self.upgrade.take().ok_or(Error::AlreadyHijacked)
    }
}

impl Drop for HyperResponse {
    fn drop(&mut self) {
        // Without a head there is nobody to read the body; `dispatch` decides
        // what to answer.
        if self.head.is_none() {
            self.send_buffered();
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::ResponseWriter;

    fn sink() -> (HyperResponse, oneshot::Receiver<Head>) {
        let (sink, head, _abort) = HyperResponse::new(hyper::upgrade::on(http::Request::new(())));
        (sink, head)
    }

    #[tokio::test]
    async fn head_is_sent_at_commit() {
        let (raw, mut head_rx) = sink();
        let mut w = ResponseWriter::new(raw);
        w.headers_mut().insert("x-id", "7".parse().unwrap());
        assert!(head_rx.try_recv().is_err());

        w.write_status(StatusCode::CREATED);
        let res = head_rx.try_recv().unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers()["x-id"], "7");

        w.write_str("part one, ").unwrap();
        w.flush().unwrap();
        w.write_str("part two").unwrap();
        drop(w);

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "part one, part two");
    }

    #[tokio::test]
    async fn dropped_without_commit_sends_nothing() {
        let (raw, head_rx) = sink();
        drop(raw);
        assert!(head_rx.await.is_err());
    }

    #[tokio::test]
    async fn hijack_hands_over_once() {
        let (raw, _head_rx) = sink();
        let mut w = ResponseWriter::new(raw);
        assert!(w.hijack().is_ok());
        assert!(matches!(w.hijack(), Err(Error::AlreadyHijacked)));
        assert!(matches!(w.push("/style.css", HeaderMap::new()), Err(Error::PushUnsupported)));
    }
}
