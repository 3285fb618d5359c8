//! Access logging.
//!
//! The line layout is a template with `{field}` placeholders, parsed once when
//! the logger is configured:
//!
//! | Field | Value |
//! |---|---|
//! | `{start}` | request start, local time, formatted with the date format |
//! | `{status}` | final status code, `0` if nothing was written |
//! | `{duration}` | time spent in the rest of the chain |
//! | `{host}` | requested host |
//! | `{method}` | request method |
//! | `{path}` | request path, without the query |
//!
//! `{{` and `}}` produce literal braces.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use tracing::Level;

use super::{LogSink, TracingSink};
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response_writer::ResponseWriter;

pub const DEFAULT_FORMAT: &str = "{start} | {status} | \t {duration} | {host} | {method} {path} \n";

/// RFC 3339 with a numeric offset.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Field {
    Start,
    Status,
    Duration,
    Host,
    Method,
    Path,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "start"    => Some(Self::Start),
            "status"   => Some(Self::Status),
            "duration" => Some(Self::Duration),
            "host"     => Some(Self::Host),
            "method"   => Some(Self::Method),
            "path"     => Some(Self::Path),
            _          => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    Literal(String),
    Field(Field),
}

fn parse_template(format: &str) -> Result<Vec<Segment>, Error> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(Error::Template(format!("unclosed `{{{name}`"))),
                    }
                }
                let field = Field::from_name(name.trim())
                    .ok_or_else(|| Error::Template(format!("unknown field `{name}`")))?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(field));
            }
            '}' => return Err(Error::Template("unmatched `}`".to_owned())),
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn check_date_format(format: &str) -> Result<(), Error> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(Error::Template(format!("invalid date format `{format}`")));
    }
    Ok(())
}

struct Entry<'a> {
    start: DateTime<Local>,
    status: u16,
    duration: Duration,
    host: &'a str,
    method: &'a str,
    path: &'a str,
}

/// Logs one line per request once the rest of the chain has finished.
///
/// Durations are only meaningful if downstream links await `next` instead of
/// handing the request off to a background task.
pub struct Logger {
    sink: Arc<dyn LogSink>,
    date_format: String,
    template: Vec<Segment>,
}

impl Logger {
    /// Default format and date format, logging through `tracing` at `INFO`.
    pub fn new() -> Self {
        Self {
            sink: Arc::new(TracingSink::new(Level::INFO)),
            date_format: DEFAULT_DATE_FORMAT.to_owned(),
            template: parse_template(DEFAULT_FORMAT).expect("default log format is valid"),
        }
    }

    /// Replaces the line template. Fails on unknown fields or unbalanced braces.
    pub fn with_format(mut self, format: &str) -> Result<Self, Error> {
        self.template = parse_template(format)?;
        Ok(self)
    }

    /// Replaces the strftime-style format used for `{start}`.
    pub fn with_date_format(mut self, format: impl Into<String>) -> Result<Self, Error> {
        let format = format.into();
        check_date_format(&format)?;
        self.date_format = format;
        Ok(self)
    }

    pub fn with_sink(mut self, sink: impl LogSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    fn render(&self, entry: &Entry<'_>) -> String {
        let mut line = String::with_capacity(96);
        for segment in &self.template {
            // Writing into a String only fails if a Display impl does, and the
            // date format was validated up front.
            let _ = match segment {
                Segment::Literal(text) => {
                    line.push_str(text);
                    Ok(())
                }
                Segment::Field(Field::Start) => write!(line, "{}", entry.start.format(&self.date_format)),
                Segment::Field(Field::Status) => write!(line, "{}", entry.status),
                Segment::Field(Field::Duration) => write!(line, "{:?}", entry.duration),
                Segment::Field(Field::Host) => write!(line, "{}", entry.host),
                Segment::Field(Field::Method) => write!(line, "{}", entry.method),
                Segment::Field(Field::Path) => write!(line, "{}", entry.path),
            };
        }
        line
    }
}

impl Default for Logger {
    fn default() -> Self { Self::new() }
}

impl Middleware for Logger {
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            let start = Local::now();
            let timer = Instant::now();

            next.run(w, req).await;

            let entry = Entry {
                start,
                status: w.status().map_or(0, |s| s.as_u16()),
                duration: timer.elapsed(),
                host: req.host(),
                method: req.method().as_str(),
                path: req.path(),
            };
            self.sink.log(&self.render(&entry));
        })
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};

    use super::*;
    use crate::Stack;
    use crate::test_util::{Lines, RecordingResponse};

    #[test]
    fn parses_fields_and_escapes() {
        let segments = parse_template("{{{status}}} {method}").unwrap();
        assert_eq!(
            segments,
            [
                Segment::Literal("{".to_owned()),
                Segment::Field(Field::Status),
                Segment::Literal("} ".to_owned()),
                Segment::Field(Field::Method),
            ],
        );
    }

    #[test]
    fn rejects_bad_templates() {
        assert!(matches!(parse_template("{nope}"), Err(Error::Template(_))));
        assert!(matches!(parse_template("{status"), Err(Error::Template(_))));
        assert!(matches!(parse_template("status}"), Err(Error::Template(_))));
        assert!(Logger::new().with_date_format("%Q").is_err());
    }

    #[tokio::test]
    async fn logs_after_downstream_finishes() {
        let lines = Lines::default();
        let logger = Logger::new().with_sink(lines.clone());

        let stack = Stack::default();
        stack.push(logger);
        stack.push_fn(|w, _req, _next| Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            w.write_status(StatusCode::CREATED);
            w.write_str("hello").unwrap();
        }));

        let (raw, rec) = RecordingResponse::new();
        let req = http::Request::get("/greet?x=1")
            .header("host", "example.com")
            .body(bytes::Bytes::new())
            .unwrap();
        stack.serve(raw, req.into()).await;

        assert_eq!(rec.lock().status, Some(StatusCode::CREATED));
        assert_eq!(rec.lock().body_str(), "hello");

        let lines = lines.take();
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split(" | ").collect();
        assert_eq!(fields.len(), 5, "{:?}", lines[0]);
        assert!(DateTime::parse_from_rfc3339(fields[0]).is_ok(), "{}", fields[0]);
        assert_eq!(fields[1], "201");
        assert!(fields[2].starts_with("\t "));
        assert!(fields[2].ends_with("ms"), "{}", fields[2]);
        assert_ne!(fields[2], "\t 0ns");
        assert_eq!(fields[3], "example.com");
        assert_eq!(fields[4], "GET /greet \n");
    }

    #[tokio::test]
    async fn custom_format_and_unwritten_status() {
        let lines = Lines::default();
        let logger = Logger::new()
            .with_format("{method} {path} -> {status}")
            .unwrap()
            .with_sink(lines.clone());

        let stack = Stack::default();
        stack.push(logger);

        let (raw, _rec) = RecordingResponse::new();
        stack.serve(raw, Request::new(Method::DELETE, "/items/7".parse().unwrap())).await;

        assert_eq!(lines.take(), ["DELETE /items/7 -> 0"]);
    }
}
