//! Unified error type.

use std::fmt;

/// The error type returned by relay's fallible operations.
///
/// A panicking handler is not an `Error`: it is either caught by
/// [`Recovery`](crate::middleware::Recovery) or aborts the request. This type
/// surfaces infrastructure failures (binding, I/O on the response sink),
/// configuration mistakes, and capabilities the underlying transport lacks.
#[derive(Debug)]
pub enum Error {
    /// I/O failure while binding, accepting, or writing.
    Io(std::io::Error),
    /// A logger template referenced an unknown field or left a brace open.
    Template(String),
    /// The raw response sink cannot hand over its connection.
    HijackUnsupported,
    /// The connection was already taken over by an earlier `hijack` call.
    AlreadyHijacked,
    /// The raw response sink cannot initiate a server push.
    PushUnsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Template(msg) => write!(f, "invalid log template: {msg}"),
            Self::HijackUnsupported => f.write_str("response writer does not support hijacking"),
            Self::AlreadyHijacked => f.write_str("connection already hijacked"),
            Self::PushUnsupported => f.write_str("response writer does not support server push"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
