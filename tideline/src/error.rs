use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by tideline.
///
/// Cloneable so that one failure can be observed by every holder of an
/// [`AsyncResult`](crate::AsyncResult) and copied into composites.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An async result was completed a second time.
    #[error("result is already complete: {}", completion_state(.succeeded))]
    AlreadyComplete {
        /// Whether the earlier completion was a success.
        succeeded: bool,
    },
    /// The endpoint wait queue is at `max_wait_queue_size`.
    #[error("connection pool reached max wait queue size")]
    QueueFull,
    /// The transport could not establish a connection.
    #[error("connect failed: {0}")]
    Connect(Arc<io::Error>),
    /// A context-affine call ran outside the owning context.
    #[error("wrong context")]
    WrongContext,
    /// A join predicate rejected an all-terminal composite.
    #[error("composite failed")]
    CompositeFailed,
    /// Positional composite access out of range.
    #[error("index {index} out of bounds for composite of {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of children.
        len: usize,
    },
    /// The endpoint pool kept being retired underneath the request.
    #[error("endpoint pool unavailable")]
    PoolUnavailable,
    /// The connection manager has been closed.
    #[error("connection manager closed")]
    PoolClosed,
    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// Write buffer water marks would be inverted.
    #[error("invalid write buffer water marks: low {low} > high {high}")]
    InvalidWaterMark {
        /// Low water mark.
        low: usize,
        /// High water mark.
        high: usize,
    },
    /// No verified peer certificate chain is available.
    #[error("peer not verified")]
    PeerUnverified,
    /// Channel or thread I/O failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// Caller-supplied failure message.
    #[error("{0}")]
    Failed(String),
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    Config(String),
}

fn completion_state(succeeded: &bool) -> &'static str {
    if *succeeded { "succeeded" } else { "failed" }
}

impl Error {
    /// Wrap an I/O error as a connect failure.
    pub fn connect(err: io::Error) -> Self {
        Error::Connect(Arc::new(err))
    }

    /// Build a generic failure from a message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
