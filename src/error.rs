//! Error types for channel construction and streaming

use std::time::Duration;

/// Result type alias for channel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Everything a Sink, Source or Registry can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A live Sink already owns this channel name
    #[error("channel '{name}' already has a live sink")]
    NameInUse { name: String },

    /// No Sink has allocated this channel yet
    #[error("channel '{name}' does not exist")]
    NotFound { name: String },

    /// No Sink appeared within the connect timeout
    #[error("timed out after {waited:?} waiting for a sink on channel '{name}'")]
    ConnectTimeout { name: String, waited: Duration },

    /// Zero, overflowing or otherwise malformed payload shape
    #[error("invalid payload descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// Configuration value out of range
    #[error("invalid channel configuration: {parameter} - {message}")]
    InvalidConfig { parameter: String, message: String },

    /// Channel names are short tokens
    #[error("invalid channel name '{name}': {message}")]
    InvalidName { name: String, message: String },

    /// The advertised descriptor is not what the Source expected
    #[error("channel '{name}' carries {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// A reader stopped heartbeating. Handled inside the Sink, never returned to stages.
    #[error("reader {pid} on channel '{name}' stopped responding")]
    ReaderTimeout { name: String, pid: u32 },

    /// Publish after end-of-stream. A bug in the calling stage.
    #[error("channel '{name}' is closed")]
    AlreadyClosed { name: String },

    /// Every reader entry in the segment is taken
    #[error("channel '{name}' has no free reader entries (max {max})")]
    TooManyReaders { name: String, max: usize },

    /// The process-level shutdown flag was raised during a blocking call
    #[error("interrupted by shutdown")]
    Interrupted,

    /// The segment does not look like one of ours
    #[error("channel '{name}' segment is corrupt: {message}")]
    Corrupt { name: String, message: String },

    /// I/O related errors (shm_open, mmap, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_descriptor(message: impl Into<String>) -> Self {
        Error::InvalidDescriptor {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(parameter: &str, message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            parameter: parameter.to_owned(),
            message: message.into(),
        }
    }

    /// Handshake and configuration failures: operator misconfiguration, the stage
    /// should exit non-zero instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NameInUse { .. }
                | Error::ConnectTimeout { .. }
                | Error::InvalidDescriptor { .. }
                | Error::InvalidConfig { .. }
                | Error::InvalidName { .. }
                | Error::TypeMismatch { .. }
                | Error::TooManyReaders { .. }
                | Error::Corrupt { .. }
        )
    }

    /// Interruption is the graceful path, same as end-of-stream.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}
