//! Minimal relay example: the classic stack, a hand-written middleware, and
//! a plain handler at the end of the chain.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/hello
//!   curl -i http://localhost:3000/admin
//!   curl -i -H 'x-api-key: letmein' http://localhost:3000/admin
//!   curl -i http://localhost:3000/boom
//!   mkdir -p public && echo hi > public/hi.txt && curl -i http://localhost:3000/hi.txt

use std::sync::Arc;

use relay::middleware::{HtmlPanicFormatter, Recovery};
use relay::{BoxFuture, Middleware, Next, Request, Response, ResponseWriter, Server, Stack};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Recovery, Logger, and Static("public").
    let stack = Arc::new(Stack::classic());

    stack.push(ApiKey { prefix: "/admin", key: "letmein" });

    stack.push_fn(|w, req, next| Box::pin(async move {
        if req.path() == "/boom" {
            panic!("the /boom handler always panics");
        }
        w.headers_mut().insert("x-served-by", "relay".parse().unwrap());
        next.run(w, req).await;
    }));

    stack.push_handler(hello);

    // A second stack sharing the first one's links, with an HTML panic page
    // in front. The original stack is not touched.
    let debug_stack = Stack::new(vec![Arc::new(
        Recovery::new().with_formatter(HtmlPanicFormatter),
    )])
    .with(stack.handlers());
    tracing::info!(links = debug_stack.handlers().len(), "debug stack built");

    Server::bind("0.0.0.0:3000")
        .serve(stack)
        .await
        .expect("server error");
}

async fn hello(req: Request) -> Response {
    Response::text(format!("hello from {}\n", req.path()))
}

// Rejects requests under `prefix` unless they carry the right key. Never
// calls `next` on a rejection, so nothing after it runs.
struct ApiKey {
    prefix: &'static str,
    key: &'static str,
}

impl Middleware for ApiKey {
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            if req.path().starts_with(self.prefix) && req.header("x-api-key") != Some(self.key) {
                let _ = Response::status(http::StatusCode::UNAUTHORIZED).write_to(w);
                return;
            }
            next.run(w, req).await;
        })
    }
}
