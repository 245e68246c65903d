//! Error types for qtsort.
//!
//! Errors are `Clone` so that a failed pipeline stage can hand the very same
//! error to every producer that touches it afterwards.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, QtSortError>;

#[derive(Debug, Clone, Error)]
pub enum QtSortError {
    /// Malformed or out-of-order quadtree codes, or elements routed outside
    /// the expected tile range.
    #[error("structural error: {0}")]
    Structural(String),

    /// The group finder widened its tolerance past `50 * target` without
    /// accounting for the whole tree.
    #[error(
        "group finder did not converge: target={target}, max={max}, {remaining} weight unassigned"
    )]
    Capacity {
        target: i64,
        max: i64,
        remaining: i64,
    },

    /// Raised to a thread blocked on (or later touching) a cancelled queue.
    #[error("operation cancelled")]
    Cancelled,

    /// Push or finish on a queue which already holds its end marker.
    #[error("queue already finished")]
    QueueFinished,

    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid file format")]
    InvalidFormat,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl QtSortError {
    /// True when this error only reports that a peer cancelled the pipeline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QtSortError::Cancelled)
    }
}

impl From<io::Error> for QtSortError {
    fn from(err: io::Error) -> Self {
        QtSortError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for QtSortError {
    fn from(err: serde_json::Error) -> Self {
        QtSortError::Serialization(err.to_string())
    }
}

#[cfg(feature = "snapshot")]
impl From<bincode::Error> for QtSortError {
    fn from(err: bincode::Error) -> Self {
        QtSortError::Serialization(err.to_string())
    }
}
