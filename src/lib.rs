//! # relay
//!
//! Composable middleware chains for hyper servers.
//!
//! A [`Stack`] is an ordered list of [`Middleware`]. Each link gets the
//! response writer, the request, and a [`Next`] it may run to pass control
//! down the chain. A link that never runs `next` ends the request there; code
//! after `next.run(..).await` runs once everything downstream has finished.
//!
//! ```text
//!  request ──► Recovery ──► Logger ──► Static ──► handler ──► Void
//!                 ◄────────── unwinds in reverse ◄──────────
//! ```
//!
//! ## The contract
//!
//! - **Links are independent.** Nothing but the [`ResponseWriter`] and the
//!   [`Request`] is shared between them.
//! - **The writer remembers.** [`ResponseWriter::status`],
//!   [`written`](ResponseWriter::written) and [`size`](ResponseWriter::size)
//!   answer what downstream did, and [`before`](ResponseWriter::before) hooks
//!   run right before the status goes out.
//! - **Stacks grow while serving.** A push publishes a new chain; requests
//!   already running finish on the one they started with.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use relay::{Request, Response, Server, Stack};
//!
//! #[tokio::main]
//! async fn main() {
//!     let stack = Stack::classic();
//!     stack.push_handler(hello);
//!
//!     Server::bind("0.0.0.0:3000").serve(stack).await.unwrap();
//! }
//!
//! async fn hello(req: Request) -> Response {
//!     Response::text(format!("hello from {}", req.path()))
//! }
//! ```
//!
//! ## Writing middleware
//!
//! ```rust
//! use relay::{BoxFuture, Middleware, Next, Request, ResponseWriter};
//!
//! struct PoweredBy;
//!
//! impl Middleware for PoweredBy {
//!     fn handle<'a>(
//!         &'a self,
//!         w: &'a mut ResponseWriter,
//!         req: &'a mut Request,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a> {
//!         Box::pin(async move {
//!             w.headers_mut().insert("x-powered-by", "relay".parse().unwrap());
//!             next.run(w, req).await;
//!         })
//!     }
//! }
//! ```

mod body;
mod chain;
mod error;
mod handler;
mod request;
mod response;
mod response_writer;
mod server;
mod stack;

#[cfg(test)]
mod test_util;

pub mod middleware;

pub use body::ResponseBody;
pub use error::Error;
pub use handler::{BoxFuture, BoxedMiddleware, FromFn, Handler, Middleware, Next, Void, Wrap, from_fn, wrap};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use response_writer::{Flush, Hijack, Push, RawResponse, ResponseWriter};
pub use server::{Server, dispatch};
pub use stack::Stack;
