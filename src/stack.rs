//! The middleware stack: an ordered handler list plus the chain built from it.
//!
//! # Changing a live stack
//!
//! A `Stack` may be shared with a running [`Server`](crate::Server) and still
//! grow. Every push builds a complete new [`Chain`] next to the old one and
//! then swaps one `Arc` under a write lock. A request clones the current `Arc`
//! on entry, so it runs against either the old chain or the new one, never a
//! mix. Pushes are serialized through an upgradable read lock, which still
//! lets requests in while the new chain is being built.

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::chain::Chain;
use crate::handler::{BoxFuture, BoxedMiddleware, Handler, Middleware, Next, from_fn, wrap};
use crate::middleware::{Dir, Logger, Recovery, Static};
use crate::request::Request;
use crate::response_writer::{RawResponse, ResponseWriter};

struct Built {
    handlers: Vec<BoxedMiddleware>,
    chain: Chain,
}

impl Built {
    fn new(handlers: Vec<BoxedMiddleware>) -> Self {
        let chain = Chain::build(&handlers);
        Self { handlers, chain }
    }
}

/// An ordered list of middleware, invoked first to last.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relay::{Request, Response, Server, Stack};
/// use relay::middleware::{Logger, Recovery};
///
/// async fn hello(_req: Request) -> Response {
///     Response::text("hello")
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let stack = Stack::new(vec![Arc::new(Recovery::new()), Arc::new(Logger::new())]);
///     stack.push_handler(hello);
///
///     Server::bind("0.0.0.0:3000").serve(stack).await.unwrap();
/// }
/// ```
pub struct Stack {
    current: RwLock<Arc<Built>>,
}

impl Stack {
    /// Builds a stack running `handlers` in order.
    pub fn new(handlers: Vec<BoxedMiddleware>) -> Self {
        Self { current: RwLock::new(Arc::new(Built::new(handlers))) }
    }

    /// Recovery, logging, and static files from `./public`.
    pub fn classic() -> Self {
        Self::new(vec![
            Arc::new(Recovery::new()),
            Arc::new(Logger::new()),
            Arc::new(Static::new(Dir::new("public"))),
        ])
    }

    /// A new stack with `handlers` appended to this one's. `self` is unchanged.
    pub fn with(&self, handlers: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        let mut all = self.handlers();
        all.extend(handlers);
        Self::new(all)
    }

    /// Appends `middleware` and publishes the rebuilt chain.
    pub fn push(&self, middleware: impl Middleware) {
        self.push_boxed(Arc::new(middleware));
    }

    /// Appends an already shared middleware.
    pub fn push_boxed(&self, middleware: BoxedMiddleware) {
        let current = self.current.upgradable_read();
        let mut handlers = current.handlers.clone();
        handlers.push(middleware);
        let next = Arc::new(Built::new(handlers));
        *RwLockUpgradableReadGuard::upgrade(current) = next;
    }

    /// Appends a closure with the [`Middleware::handle`] signature.
    pub fn push_fn<F>(&self, f: F)
    where
        F: for<'a> Fn(&'a mut ResponseWriter, &'a mut Request, Next<'a>) -> BoxFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.push(from_fn(f));
    }

    /// Appends a plain handler. It always continues to the next link.
    pub fn push_handler(&self, handler: impl Handler) {
        self.push(wrap(handler));
    }

    /// A snapshot of the current handler list.
    pub fn handlers(&self) -> Vec<BoxedMiddleware> {
        self.current.read().handlers.clone()
    }

    /// Serves one request: wraps `raw` and runs the chain from its head.
    pub async fn serve(&self, raw: impl RawResponse + 'static, req: Request) {
        let mut w = ResponseWriter::new(raw);
        self.serve_writer(&mut w, req).await;
    }

    /// Like [`serve`](Stack::serve), for callers that want the writer's final state.
    pub async fn serve_writer(&self, w: &mut ResponseWriter, mut req: Request) {
        let built = Arc::clone(&self.current.read());
        built.chain.serve(w, &mut req).await;
    }
}

impl Default for Stack {
    fn default() -> Self { Self::new(Vec::new()) }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let built = self.current.read();
        f.debug_struct("Stack")
            .field("handlers", &built.handlers.len())
            .field("nodes", &built.chain.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode, Uri};

    use super::*;
    use crate::response::Response;
    use crate::test_util::RecordingResponse;

    fn get(path: &'static str) -> Request {
        Request::new(Method::GET, Uri::from_static(path))
    }

    async fn body_of(stack: &Stack) -> String {
        let (raw, rec) = RecordingResponse::new();
        stack.serve(raw, get("/")).await;
        let body = rec.lock().body_str().to_owned();
        body
    }

    async fn say(_req: Request) -> &'static str {
        "a"
    }

    #[tokio::test]
    async fn push_is_visible_to_the_next_request() {
        let stack = Stack::default();
        assert_eq!(body_of(&stack).await, "");

        stack.push_handler(say);
        assert_eq!(body_of(&stack).await, "a");

        stack.push_fn(|w, req, next| Box::pin(async move {
            w.write_str("b").unwrap();
            next.run(w, req).await;
        }));
        assert_eq!(body_of(&stack).await, "ab");
        assert_eq!(stack.handlers().len(), 2);
    }

    #[tokio::test]
    async fn with_leaves_the_original_untouched() {
        let base = Stack::default();
        base.push_handler(say);

        let extended = base.with([Arc::new(wrap(|_req: Request| async { "z" })) as BoxedMiddleware]);

        assert_eq!(base.handlers().len(), 1);
        assert_eq!(extended.handlers().len(), 2);
        assert_eq!(body_of(&base).await, "a");
        assert_eq!(body_of(&extended).await, "az");
    }

    #[tokio::test]
    async fn in_flight_request_keeps_its_chain() {
        let stack = Arc::new(Stack::default());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let gate = parking_lot::Mutex::new(Some((entered_tx, release_rx)));

        stack.push_fn(move |w, req, next| {
            let signals = gate.lock().take();
            Box::pin(async move {
                if let Some((entered, release)) = signals {
                    let _ = entered.send(());
                    let _ = release.await;
                }
                w.write_str("old").unwrap();
                next.run(w, req).await;
            })
        });

        let (raw, rec) = RecordingResponse::new();
        let in_flight = tokio::spawn({
            let stack = Arc::clone(&stack);
            async move { stack.serve(raw, get("/")).await }
        });

        entered_rx.await.unwrap();
        stack.push_handler(|_req: Request| async { Response::text("+new") });
        release_tx.send(()).unwrap();
        in_flight.await.unwrap();

        assert_eq!(rec.lock().body_str(), "old");
        assert_eq!(body_of(&stack).await, "old+new");
    }

    #[tokio::test]
    async fn serve_writer_exposes_final_state() {
        let stack = Stack::default();
        stack.push_handler(|_req: Request| async { StatusCode::ACCEPTED });

        let (raw, _rec) = RecordingResponse::new();
        let mut w = ResponseWriter::new(raw);
        stack.serve_writer(&mut w, get("/")).await;

        assert_eq!(w.status(), Some(StatusCode::ACCEPTED));
        assert!(w.written());
    }
}
