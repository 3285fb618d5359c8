//! HTTP server and graceful shutdown.
//!
//! Every request runs its chain on a task of its own. The response head goes
//! back to hyper the moment the chain commits a status, and the body streams
//! after it, so a link that flushes early reaches the client early.
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. Stops calling `listener.accept()`, so no new connections are made.
//! 2. Lets every in-flight connection task run to completion.
//! 3. Returns from [`Server::serve`], which lets `main` exit cleanly.
//!
//! [`Server::serve_with_shutdown`] takes any future as the signal instead.
//!
//! # Upgrades
//!
//! [`ResponseWriter::hijack`] hands out hyper's `OnUpgrade`. The link that
//! takes it answers `101 Switching Protocols` and awaits the upgrade on a task
//! it spawns; the connection is only handed over after that response is sent.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::body::{HyperResponse, ResponseBody};
use crate::error::Error;
use crate::middleware::panic_message;
use crate::request::Request;
use crate::response_writer::ResponseWriter;
use crate::stack::Stack;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use relay::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr }
    }

    /// Starts accepting connections and running each request through `stack`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing). Pass an
    /// `Arc<Stack>` to keep pushing middleware while the server runs.
    pub async fn serve(self, stack: impl Into<Arc<Stack>>) -> Result<(), Error> {
        self.serve_with_shutdown(stack, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but stops accepting once `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        stack: impl Into<Arc<Stack>>,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let stack = stack.into();

        info!(addr = %self.addr, "relay listening");

        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Checked first so a signal stops accepting even with
                // connections queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let stack = Arc::clone(&stack);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| dispatch(Arc::clone(&stack), req));

                        // HTTP/1.1 or HTTP/2, whatever the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("relay stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs one hyper request through `stack` and returns the response head as
/// soon as the chain commits it.
///
/// Never fails as far as hyper is concerned. An unreadable request body is a
/// `400`. A panic no link recovers from is a `500` with an empty body if
/// nothing was committed yet, and an aborted body stream otherwise. A chain
/// that finishes without writing anything answers `200`.
pub async fn dispatch<B>(
    stack: Arc<Stack>,
    mut req: http::Request<B>,
) -> Result<http::Response<ResponseBody>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let upgrade = hyper::upgrade::on(&mut req);
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(path = parts.uri.path(), "failed to read request body: {e}");
            return Ok(empty(StatusCode::BAD_REQUEST));
        }
    };
    let req = Request::from_parts(parts, body);

    let (raw, head, abort) = HyperResponse::new(upgrade);
    let task = tokio::spawn(async move {
        let mut w = ResponseWriter::new(raw);
        let outcome = AssertUnwindSafe(stack.serve_writer(&mut w, req))
            .catch_unwind()
            .await;
        match outcome {
            Ok(()) => {
                if !w.written() {
                    w.write_status(StatusCode::OK);
                }
            }
            Err(payload) => {
                error!(panic = %panic_message(&*payload), "unrecovered panic in middleware chain");
                if w.written() {
                    let _ = abort.send(Err(io::Error::other("middleware chain panicked")));
                } else {
                    w.write_status(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
        }
    });

    match head.await {
        Ok(res) => Ok(res),
        Err(_) => {
            // The task ended without committing, which only happens if it died
            // outside the chain.
            if let Err(e) = task.await {
                error!("request task failed: {e}");
            }
            Ok(empty(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn empty(status: StatusCode) -> http::Response<ResponseBody> {
    let mut res = http::Response::new(ResponseBody::empty());
    *res.status_mut() = status;
    res
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT. On Windows only Ctrl-C is
/// available.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
