//! Panic recovery.
//!
//! [`Recovery`] is the chain's failure boundary. It awaits the rest of the
//! chain inside `catch_unwind`; when a downstream link panics it commits a
//! `500` (unless the response already went out), writes a body produced by a
//! [`PanicFormatter`], logs the panic with its backtrace, and hands a
//! [`PanicInformation`] snapshot to an optional callback.
//!
//! The backtrace has to be taken at the panic site, before unwinding. The
//! first `Recovery` constructed installs a process panic hook that records
//! one per thread and then calls the hook that was installed before it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use http::StatusCode;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tracing::{Level, debug};

use super::{LogSink, TracingSink};
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::ContentType;
use crate::response_writer::ResponseWriter;

/// Maximum number of backtrace bytes kept per panic.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

// ── Backtrace capture ─────────────────────────────────────────────────────────

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

// ── PanicInformation ──────────────────────────────────────────────────────────

/// What was caught, and for which request.
pub struct PanicInformation<'a> {
    payload: &'a (dyn Any + Send),
    message: String,
    stack: Option<String>,
    request: &'a Request,
}

impl PanicInformation<'_> {
    /// The panic payload as passed to `panic!`.
    pub fn payload(&self) -> &(dyn Any + Send) { self.payload }

    /// The payload rendered as text.
    pub fn message(&self) -> &str { &self.message }

    /// The backtrace, if the middleware is configured to expose it.
    pub fn stack(&self) -> Option<&str> { self.stack.as_deref() }

    pub fn request(&self) -> &Request { self.request }

    /// `METHOD path[?query]`.
    pub fn request_description(&self) -> String {
        match self.request.query() {
            Some(query) if !query.is_empty() => {
                format!("{} {}?{}", self.request.method(), self.request.path(), query)
            }
            _ => format!("{} {}", self.request.method(), self.request.path()),
        }
    }
}

impl fmt::Debug for PanicInformation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicInformation")
            .field("message", &self.message)
            .field("stack", &self.stack.as_ref().map(String::len))
            .field("request", &self.request_description())
            .finish()
    }
}

// ── Formatters ────────────────────────────────────────────────────────────────

/// Renders the body of the error response.
pub trait PanicFormatter: Send + Sync + 'static {
    /// Set on the response when it has no content type yet.
    fn content_type(&self) -> ContentType;
    fn format(&self, info: &PanicInformation<'_>) -> String;
}

/// `PANIC: <message>\n<stack>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextPanicFormatter;

impl PanicFormatter for TextPanicFormatter {
    fn content_type(&self) -> ContentType { ContentType::Text }

    fn format(&self, info: &PanicInformation<'_>) -> String {
        format!("PANIC: {}\n{}", info.message(), info.stack().unwrap_or(""))
    }
}

/// A small HTML page with the request, the message, and the stack if present.
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlPanicFormatter;

impl PanicFormatter for HtmlPanicFormatter {
    fn content_type(&self) -> ContentType { ContentType::Html }

    fn format(&self, info: &PanicInformation<'_>) -> String {
        let mut page = String::from("<body>\n<h1>Panic</h1>\n\n<div>\n");
        page.push_str(&format!("<h3> {} </h3>\n", escape_html(&info.request_description())));
        page.push_str(&format!("<h4> {} </h4>\n</div>\n", escape_html(info.message())));
        if let Some(stack) = info.stack() {
            page.push_str("\n<div>\n<h3> Runtime stack</h3>\n");
            page.push_str(&format!("<pre> {} </pre>\n</div>\n", escape_html(stack)));
        }
        page.push_str("</body>\n");
        page
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&'  => out.push_str("&amp;"),
            '<'  => out.push_str("&lt;"),
            '>'  => out.push_str("&gt;"),
            '"'  => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c    => out.push(c),
        }
    }
    out
}

// ── Recovery ──────────────────────────────────────────────────────────────────

type PanicHandler = Arc<dyn Fn(&PanicInformation<'_>) + Send + Sync + 'static>;

/// Catches panics from every link after it.
pub struct Recovery {
    logger: Arc<dyn LogSink>,
    formatter: Box<dyn PanicFormatter>,
    print_stack: bool,
    stack_size: usize,
    on_panic: Option<PanicHandler>,
}

impl Recovery {
    /// Plain-text bodies with the stack included, logging through `tracing` at `ERROR`.
    pub fn new() -> Self {
        install_backtrace_hook();
        Self {
            logger: Arc::new(TracingSink::new(Level::ERROR)),
            formatter: Box::new(TextPanicFormatter),
            print_stack: true,
            stack_size: DEFAULT_STACK_SIZE,
            on_panic: None,
        }
    }

    pub fn with_formatter(mut self, formatter: impl PanicFormatter) -> Self {
        self.formatter = Box::new(formatter);
        self
    }

    pub fn with_sink(mut self, sink: impl LogSink) -> Self {
        self.logger = Arc::new(sink);
        self
    }

    /// Whether the backtrace goes into the response and the callback snapshot.
    /// It is always logged.
    pub fn print_stack(mut self, print: bool) -> Self {
        self.print_stack = print;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Called after the error response is written. A panic inside `f` is caught and logged.
    pub fn on_panic<F>(mut self, f: F) -> Self
    where
        F: Fn(&PanicInformation<'_>) + Send + Sync + 'static,
    {
        self.on_panic = Some(Arc::new(f));
        self
    }

    fn recover(&self, w: &mut ResponseWriter, req: &Request, payload: Box<dyn Any + Send>) {
        let stack = take_backtrace().map(|s| truncate(s, self.stack_size));
        let message = panic_message(&*payload);
        self.logger.log(&format!("PANIC: {message}\n{}", stack.as_deref().unwrap_or("")));

        let info = PanicInformation {
            payload: &*payload,
            message,
            stack: if self.print_stack { stack } else { None },
            request: req,
        };

        if !w.written() {
            let headers = w.headers_mut();
            headers.remove(CONTENT_LENGTH);
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, self.formatter.content_type().header_value());
            }
            w.write_status(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if let Err(e) = w.write_str(&self.formatter.format(&info)) {
            debug!("failed to write panic response: {e}");
        }

        if let Some(on_panic) = &self.on_panic {
            if let Err(nested) = panic::catch_unwind(AssertUnwindSafe(|| on_panic(&info))) {
                let trace = take_backtrace().unwrap_or_default();
                self.logger.log(&format!(
                    "panic handler panicked: {}\n{trace}",
                    panic_message(&*nested),
                ));
            }
        }
    }
}

impl Default for Recovery {
    fn default() -> Self { Self::new() }
}

impl Middleware for Recovery {
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            // Drop a trace left behind by a panic someone else caught.
            take_backtrace();
            let outcome = AssertUnwindSafe(next.run(w, req)).catch_unwind().await;
            if let Err(payload) = outcome {
                self.recover(w, req, payload);
            }
        })
    }
}
