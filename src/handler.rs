//! Middleware trait, the `Next` continuation, and handler adapters.
//!
//! # How a chain link is called
//!
//! Every link implements [`Middleware`]. It receives the per-request
//! [`ResponseWriter`], the [`Request`], and a [`Next`] bound to the rest of
//! the chain:
//!
//! ```text
//! logger.handle(w, req, next) ─┐
//!                              │ next.run(w, req).await
//!                              ▼
//!          recovery.handle(w, req, next) ─┐
//!                                         │ (does not call next: short-circuit)
//!                                         ▼
//!                                      remaining links never run
//! ```
//!
//! `Next` is consumed by [`Next::run`], so a link delegates at most once.
//! Not calling it ends the chain for this request.
//!
//! Plain handlers (`async fn(Request) -> impl IntoResponse`) know nothing
//! about delegation. [`wrap`] turns one into a link that writes the returned
//! response and then always continues.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::chain::Chain;
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::response_writer::ResponseWriter;

/// A heap-allocated, type-erased future borrowing one request's state.
///
/// The lifetime ties the future to the writer and request it was handed, so a
/// link cannot keep either alive past the request.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

// ── Middleware ────────────────────────────────────────────────────────────────

/// One link in a [`Stack`](crate::Stack).
///
/// ```rust
/// use relay::{BoxFuture, Middleware, Next, Request, ResponseWriter};
///
/// struct PoweredBy;
///
/// impl Middleware for PoweredBy {
///     fn handle<'a>(
///         &'a self,
///         w: &'a mut ResponseWriter,
///         req: &'a mut Request,
///         next: Next<'a>,
///     ) -> BoxFuture<'a> {
///         Box::pin(async move {
///             w.headers_mut().insert("x-powered-by", "relay".parse().unwrap());
///             next.run(w, req).await;
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a>;
}

/// A middleware shared between the handler list and every chain built from it.
pub type BoxedMiddleware = Arc<dyn Middleware>;

// ── Next ──────────────────────────────────────────────────────────────────────

/// The rest of the chain, from the link after the current one.
pub struct Next<'a> {
    chain: &'a Chain,
    node: Option<usize>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a Chain, node: Option<usize>) -> Self {
        Self { chain, node }
    }

    /// Runs the remaining links and resolves once all of them have returned.
    pub fn run<'b>(self, w: &'b mut ResponseWriter, req: &'b mut Request) -> BoxFuture<'b>
    where
        'a: 'b,
    {
        match self.node {
            Some(index) => self.chain.serve_node(index, w, req),
            None => Box::pin(async {}),
        }
    }
}

// ── Void ──────────────────────────────────────────────────────────────────────

/// Does nothing and never continues. Terminates every chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct Void;

impl Middleware for Void {
    fn handle<'a>(
        &'a self,
        _w: &'a mut ResponseWriter,
        _req: &'a mut Request,
        _next: Next<'a>,
    ) -> BoxFuture<'a> {
        Box::pin(async {})
    }
}

// ── FromFn ────────────────────────────────────────────────────────────────────

/// Middleware built from a closure. See [`from_fn`].
#[derive(Clone, Copy)]
pub struct FromFn<F>(F);

/// Turns a closure with the [`Middleware::handle`] signature into middleware.
///
/// ```rust
/// use relay::{Stack, from_fn};
///
/// let stack = Stack::default();
/// stack.push(from_fn(|w, req, next| Box::pin(async move {
///     if req.header("authorization").is_none() {
///         w.write_status(http::StatusCode::UNAUTHORIZED);
///         return;
///     }
///     next.run(w, req).await;
/// })));
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: for<'a> Fn(&'a mut ResponseWriter, &'a mut Request, Next<'a>) -> BoxFuture<'a>
        + Send
        + Sync
        + 'static,
{
    FromFn(f)
}

impl<F> Middleware for FromFn<F>
where
    F: for<'a> Fn(&'a mut ResponseWriter, &'a mut Request, Next<'a>) -> BoxFuture<'a>
        + Send
        + Sync
        + 'static,
{
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a> {
        (self.0)(w, req, next)
    }
}

// ── Plain handlers ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a [`Response`].
pub(crate) type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Internal dispatch interface for plain handlers.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> ResponseFuture;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every plain handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
///
/// The trait is **sealed** (via the private `Sealed` supertrait): only the
/// blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Newtype wrapper that holds a concrete handler `F` and implements
/// [`ErasedHandler`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> ResponseFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// A plain handler adapted into a chain link. See [`wrap`].
pub struct Wrap(BoxedHandler);

/// Adapts a plain handler into middleware.
///
/// The handler runs to completion on a copy of the request, its response is
/// written through the chain's writer, and then the chain always continues.
pub fn wrap(handler: impl Handler) -> Wrap {
    Wrap(handler.into_boxed_handler())
}

impl Middleware for Wrap {
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            let response = self.0.call(req.clone()).await;
            if let Err(e) = response.write_to(w) {
                debug!(path = req.path(), "failed to write handler response: {e}");
            }
            next.run(w, req).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode, Uri};

    use super::*;
    use crate::test_util::RecordingResponse;

    async fn created(req: Request) -> Response {
        Response::builder()
            .status(StatusCode::CREATED)
            .text(format!("made {}", req.path()))
    }

    #[tokio::test]
    async fn wrapped_handler_writes_then_continues() {
        let chain = Chain::build(&[
            Arc::new(wrap(created)) as BoxedMiddleware,
            Arc::new(from_fn(|w, req, next| Box::pin(async move {
                w.write_str(" and continued").unwrap();
                next.run(w, req).await;
            }))),
        ]);

        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        let mut req = Request::new(Method::POST, Uri::from_static("/widgets"));
        chain.serve(&mut w, &mut req).await;

        let rec = rec.lock();
        assert_eq!(rec.status, Some(StatusCode::CREATED));
        assert_eq!(rec.body_str(), "made /widgets and continued");
    }

    #[tokio::test]
    async fn void_writes_nothing() {
        let chain = Chain::build(&[Arc::new(Void) as BoxedMiddleware]);
        let (raw, rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        let mut req = Request::new(Method::GET, Uri::from_static("/"));
        chain.serve(&mut w, &mut req).await;

        assert!(!w.written());
        assert!(rec.lock().events.is_empty());
    }
}
