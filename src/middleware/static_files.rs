//! Static file serving with fall-through.
//!
//! A miss of any kind (wrong method, outside the prefix, not found, not
//! readable, no index file) runs the next link instead, so from the chain's
//! point of view a missing file and "this middleware declined" look the same.
//!
//! Request paths are percent-decoded before lookup. Conditional requests
//! honour `If-Unmodified-Since`, `If-None-Match: *` and `If-Modified-Since`;
//! no entity tags are generated and ranges are not supported.

use std::io;
use std::path::{MAIN_SEPARATOR, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::ContentType;
use crate::response_writer::ResponseWriter;

pub const DEFAULT_INDEX_FILE: &str = "index.html";

const CHUNK_SIZE: usize = 32 * 1024;

// ── Virtual filesystem ────────────────────────────────────────────────────────

/// What the static middleware needs to know about an opened file.
#[derive(Clone, Copy, Debug)]
pub struct Metadata {
    pub is_dir: bool,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// A read-only tree of files addressed by slash-separated paths.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    async fn open(&self, path: &str) -> io::Result<Box<dyn File>>;
}

/// An opened entry of a [`FileSystem`].
#[async_trait]
pub trait File: Send {
    async fn metadata(&mut self) -> io::Result<Metadata>;
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The local directory tree rooted at a path.
///
/// `..` segments are resolved lexically and cannot climb above the root.
#[derive(Clone, Debug)]
pub struct Dir {
    root: PathBuf,
}

impl Dir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if name.contains('\0') || (MAIN_SEPARATOR != '/' && name.contains(MAIN_SEPARATOR)) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid character in file path"));
        }
        let mut segments = Vec::new();
        for segment in name.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        let mut path = self.root.clone();
        path.extend(segments);
        Ok(path)
    }
}

#[async_trait]
impl FileSystem for Dir {
    async fn open(&self, path: &str) -> io::Result<Box<dyn File>> {
        let file = tokio::fs::File::open(self.resolve(path)?).await?;
        Ok(Box::new(DirFile(file)))
    }
}

struct DirFile(tokio::fs::File);

#[async_trait]
impl File for DirFile {
    async fn metadata(&mut self) -> io::Result<Metadata> {
        let meta = self.0.metadata().await?;
        Ok(Metadata {
            is_dir: meta.is_dir(),
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

// ── Static ────────────────────────────────────────────────────────────────────

/// Serves `GET`/`HEAD` requests from a [`FileSystem`].
pub struct Static {
    fs: Arc<dyn FileSystem>,
    prefix: String,
    index_file: String,
}

impl Static {
    pub fn new(fs: impl FileSystem) -> Self {
        Self {
            fs: Arc::new(fs),
            prefix: String::new(),
            index_file: DEFAULT_INDEX_FILE.to_owned(),
        }
    }

    /// Only serve paths under `prefix`, with `prefix` stripped before lookup.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_index_file(mut self, name: impl Into<String>) -> Self {
        self.index_file = name.into();
        self
    }

    /// The filesystem path for a request path, or `None` if it is outside the prefix.
    fn file_name<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') { Some(rest) } else { None }
    }

    async fn open(&self, name: &str) -> Option<(Box<dyn File>, Metadata)> {
        let mut file = self.fs.open(name).await.ok()?;
        let meta = file.metadata().await.ok()?;
        Some((file, meta))
    }

    /// Serves the request if possible. Returns `false` when it should fall through.
    async fn try_serve(&self, w: &mut ResponseWriter, req: &Request) -> bool {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return false;
        }
        let Some(path) = decode_path(req.path()) else {
            return false;
        };
        let Some(mut name) = self.file_name(&path).map(str::to_owned) else {
            return false;
        };
        let Some((mut file, mut meta)) = self.open(&name).await else {
            return false;
        };

        if meta.is_dir {
            if !req.path().ends_with('/') {
                redirect(w, req, &format!("{}/", req.path()));
                return true;
            }
            name = format!("{}/{}", name.trim_end_matches('/'), self.index_file);
            match self.open(&name).await {
                Some((index, index_meta)) if !index_meta.is_dir => {
                    file = index;
                    meta = index_meta;
                }
                _ => return false,
            }
        }

        serve_content(w, req, &name, file.as_mut(), meta).await;
        true
    }
}

impl Middleware for Static {
    fn handle<'a>(
        &'a self,
        w: &'a mut ResponseWriter,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            if !self.try_serve(w, req).await {
                next.run(w, req).await;
            }
        })
    }
}

/// The percent-decoded request path. `None` if it is not UTF-8 or contains NUL.
fn decode_path(raw: &str) -> Option<String> {
    let path = percent_decode_str(raw).decode_utf8().ok()?;
    if path.contains('\0') {
        return None;
    }
    Some(path.into_owned())
}

// ── Response helpers ──────────────────────────────────────────────────────────

fn redirect(w: &mut ResponseWriter, req: &Request, location: &str) {
    let Ok(value) = HeaderValue::try_from(location) else {
        w.write_status(StatusCode::BAD_REQUEST);
        return;
    };
    let headers = w.headers_mut();
    headers.insert(header::LOCATION, value);
    if req.method() == Method::GET {
        headers.insert(header::CONTENT_TYPE, ContentType::Html.header_value());
        w.write_status(StatusCode::FOUND);
        let _ = w.write_str(&format!("<a href=\"{}\">Found</a>.\n", escape_href(location)));
    } else {
        w.write_status(StatusCode::FOUND);
    }
}

fn escape_href(location: &str) -> String {
    location.replace('&', "&amp;").replace('"', "&#34;").replace('<', "&lt;")
}

/// Truncates to whole seconds, the resolution of HTTP dates.
fn whole_seconds(time: SystemTime) -> Option<SystemTime> {
    let secs = time.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

fn header_date(req: &Request, name: header::HeaderName) -> Option<SystemTime> {
    httpdate::parse_http_date(req.headers().get(name)?.to_str().ok()?).ok()
}

async fn serve_content(
    w: &mut ResponseWriter,
    req: &Request,
    name: &str,
    file: &mut dyn File,
    meta: Metadata,
) {
    let modified = meta.modified.and_then(whole_seconds).filter(|t| *t > UNIX_EPOCH);

    if let (Some(modified), Some(since)) = (modified, header_date(req, header::IF_UNMODIFIED_SINCE)) {
        if modified > since {
            w.write_status(StatusCode::PRECONDITION_FAILED);
            return;
        }
    }
    if let Some(modified) = modified {
        if let Ok(value) = HeaderValue::try_from(httpdate::fmt_http_date(modified)) {
            w.headers_mut().insert(header::LAST_MODIFIED, value);
        }
    }

    // Files carry no entity tag, so only `*` can match; any other
    // If-None-Match list matches nothing and overrides If-Modified-Since.
    let not_modified = match req.headers().get(header::IF_NONE_MATCH) {
        Some(value) => value
            .to_str()
            .is_ok_and(|list| list.split(',').any(|tag| tag.trim() == "*")),
        None => matches!(
            (modified, header_date(req, header::IF_MODIFIED_SINCE)),
            (Some(modified), Some(since)) if modified <= since
        ),
    };
    if not_modified {
        let headers = w.headers_mut();
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::CONTENT_LENGTH);
        w.write_status(StatusCode::NOT_MODIFIED);
        return;
    }

    let headers = w.headers_mut();
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(name)));
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len));
    w.write_status(StatusCode::OK);

    if req.method() == Method::HEAD {
        return;
    }

    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(file = name, "static read failed: {e}");
                break;
            }
        };
        if let Err(e) = w.write(&buf[..n]) {
            debug!(file = name, "static write failed: {e}");
            break;
        }
    }
}

fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => ContentType::Html.as_str(),
        Some("css")          => ContentType::Css.as_str(),
        Some("js" | "mjs")   => ContentType::JavaScript.as_str(),
        Some("json")         => ContentType::Json.as_str(),
        Some("txt")          => ContentType::Text.as_str(),
        Some("csv")          => ContentType::Csv.as_str(),
        Some("xml")          => ContentType::Xml.as_str(),
        Some("pdf")          => ContentType::Pdf.as_str(),
        Some("svg")          => "image/svg+xml",
        Some("png")          => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif")          => "image/gif",
        Some("webp")         => "image/webp",
        Some("ico")          => "image/vnd.microsoft.icon",
        Some("wasm")         => "application/wasm",
        Some("woff2")        => "font/woff2",
        _                    => ContentType::OctetStream.as_str(),
    }
}
