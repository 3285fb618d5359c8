//! The dispatch list built from a handler sequence.
//!
//! Nodes live in one boxed slice and point at their successor by index:
//!
//! ```text
//! index:     0          1          2          3 (terminal)
//!         [logger] ──► [static] ──► [app] ──► [Void]
//! next:    Some(1)    Some(2)    Some(3)     None
//! ```
//!
//! A chain is immutable once built. [`Stack`](crate::Stack) rebuilds it from
//! scratch whenever its handler list changes.

use std::sync::Arc;

use crate::handler::{BoxFuture, BoxedMiddleware, Next, Void};
use crate::request::Request;
use crate::response_writer::ResponseWriter;

struct Node {
    middleware: BoxedMiddleware,
    next: Option<usize>,
}

pub(crate) struct Chain {
    nodes: Box<[Node]>,
}

impl Chain {
    /// Links `handlers` in order, ending in a terminal [`Void`] node.
    pub(crate) fn build(handlers: &[BoxedMiddleware]) -> Self {
        let mut nodes = Vec::with_capacity(handlers.len() + 1);
        nodes.push(Node { middleware: Arc::new(Void), next: None });
        for (index, middleware) in handlers.iter().enumerate().rev() {
            nodes.push(Node { middleware: Arc::clone(middleware), next: Some(index + 1) });
        }
        // Built tail first; flip so node `i` holds `handlers[i]`.
        nodes.reverse();
        Self { nodes: nodes.into_boxed_slice() }
    }

    /// Number of nodes, terminal included.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Runs the chain from its head.
    pub(crate) fn serve<'a>(&'a self, w: &'a mut ResponseWriter, req: &'a mut Request) -> BoxFuture<'a> {
        self.serve_node(0, w, req)
    }

    pub(crate) fn serve_node<'a>(
        &'a self,
        index: usize,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
    ) -> BoxFuture<'a> {
        let node = &self.nodes[index];
        node.middleware.handle(w, req, Next::new(self, node.next))
    }
}
