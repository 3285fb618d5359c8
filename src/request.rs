//! Incoming HTTP request type.
//!
//! The body is collected before the chain runs, so every middleware sees the
//! same bytes and a plain handler can take its own copy cheaply.

use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, Uri, Version, header};

/// An incoming HTTP request as seen by the middleware chain.
///
/// Middleware may annotate the request for later links through
/// [`extensions_mut`](Request::extensions_mut).
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
}

impl Request {
    /// A bodiless request, mostly useful in tests.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            extensions: Extensions::new(),
            body: Bytes::new(),
        }
    }

    pub(crate) fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            extensions: parts.extensions,
            body,
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn extensions(&self) -> &Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.extensions }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Case-insensitive header lookup. Values that are not visible ASCII are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The requested host: the URI authority for absolute-form requests,
    /// otherwise the `Host` header. Empty when neither is present.
    pub fn host(&self) -> &str {
        match self.uri.authority() {
            Some(authority) => authority.as_str(),
            None => self.headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
        }
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::from_parts(parts, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_prefers_authority() {
        let req = Request::new(Method::GET, Uri::from_static("http://example.com:8080/a"));
        assert_eq!(req.host(), "example.com:8080");

        let req: Request = http::Request::get("/a")
            .header("host", "internal.local")
            .body(Bytes::new())
            .unwrap()
            .into();
        assert_eq!(req.host(), "internal.local");
        assert_eq!(req.header("HOST"), Some("internal.local"));
    }

    #[test]
    fn host_is_empty_without_header() {
        let req = Request::new(Method::GET, Uri::from_static("/"));
        assert_eq!(req.host(), "");
    }
}
