//! Built-in middleware.
//!
//! - [`Recovery`]: turns a panic anywhere downstream into a `500` response.
//!   Put it first so it guards every link after it.
//! - [`Logger`]: one access-log line per request, after the chain unwinds.
//! - [`Static`]: serves files from a [`FileSystem`], falling through on a miss.
//!
//! Logger and Recovery emit their lines through a [`LogSink`]. The default,
//! [`TracingSink`], forwards to `tracing`.

mod logger;
mod recovery;
mod static_files;

pub use logger::{DEFAULT_DATE_FORMAT, DEFAULT_FORMAT, Logger};
pub use recovery::{
    DEFAULT_STACK_SIZE, HtmlPanicFormatter, PanicFormatter, PanicInformation, Recovery,
    TextPanicFormatter,
};
pub use static_files::{DEFAULT_INDEX_FILE, Dir, File, FileSystem, Metadata, Static};

pub(crate) use recovery::panic_message;

use tracing::Level;

/// Destination for lines produced by built-in middleware.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, line: &str);
}

/// Forwards each line to `tracing` at a fixed level, trailing whitespace trimmed.
#[derive(Clone, Copy, Debug)]
pub struct TracingSink {
    level: Level,
}

impl TracingSink {
    pub const fn new(level: Level) -> Self {
        Self { level }
    }
}

impl LogSink for TracingSink {
    fn log(&self, line: &str) {
        let line = line.trim_end();
        // `event!` needs a constant level.
        if self.level == Level::ERROR {
            tracing::error!("{line}");
        } else if self.level == Level::WARN {
            tracing::warn!("{line}");
        } else if self.level == Level::INFO {
            tracing::info!("{line}");
        } else if self.level == Level::DEBUG {
            tracing::debug!("{line}");
        } else {
            tracing::trace!("{line}");
        }
    }
}
