//! Buffer Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Every kind here is recoverable at the request level. The closest thing to
//! a fatal condition is [`ErrorKind::SourceUnavailable`], which is how the
//! service signals that the record source keeps failing.

use crate::criteria::FilterHash;
use derive_more::{Display, Error};

/// A buffer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed filter input. Rejected before any build is attempted; fix
    /// the input and try again.
    #[display("invalid filter criteria: {_0}")]
    InvalidCriteria(#[error(not(source))] String),
    /// The source query or the materialization write failed. Any previously
    /// published buffer for the same hash is untouched; retry the refresh.
    #[display("buffer build failed")]
    BuildFailure,
    /// No Ready buffer exists for the hash (never built, evicted, or the
    /// build failed). Call refresh again before paginating.
    #[display("no buffer for filter hash {_0}")]
    NotFound(#[error(not(source))] FilterHash),
    /// The cursor is malformed or no longer resolves against the buffer.
    /// Restart pagination from the first page.
    #[display("cursor does not resolve against the current buffer")]
    CursorInvalid,
    /// A single buffer would exceed the configured capacity on its own, so
    /// no amount of eviction can make room for it.
    #[display("buffer exceeds configured storage capacity")]
    StorageExhausted,
    /// The record source has failed repeatedly; the service is degraded.
    #[display("record source unavailable")]
    SourceUnavailable,
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Serialization/deserialization error.
    #[display("invalid buffer data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BuildFailure | Self::SourceUnavailable | Self::Database)
    }
}
