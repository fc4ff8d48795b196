//! Record Source Error Types

use derive_more::{Display, Error};

/// A record source error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for record source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source could not be reached at all (connection refused, pool
    /// closed, timed out).
    #[display("record source unreachable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The source was reached but the query failed.
    #[display("record source query failed")]
    Query,
    /// The source returned a record that doesn't make sense.
    #[display("invalid record: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Query)
    }
}
