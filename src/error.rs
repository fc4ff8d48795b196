//! CLI error types and exit codes.

use derive_more::{Display, Error};
use glint_buffer::error::ErrorKind as BufferErrorKind;
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not create directory {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    #[display("could not prepare the media table")]
    Source,
    #[display("{_0}")]
    Buffer(#[error(not(source))] BufferErrorKind),
    #[display("could not write output")]
    Output,
}

/// Wrap a buffer error, keeping its kind so the exit code can reflect it.
pub fn buffer<T>(result: glint_buffer::error::Result<T>) -> Result<T> {
    result.map_err(|err| {
        let kind = ErrorKind::Buffer((*err).clone());
        err.raise(kind)
    })
}

/// Process exit codes.
///
/// Retryable failures get their own code so scripts can tell "try again"
/// from "fix your input".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    /// Anything not covered below.
    Failure = 1,
    /// Invalid configuration.
    Config = 2,
    /// Invalid criteria, hash or cursor.
    Usage = 3,
    /// No buffer exists for the hash.
    NotFound = 4,
    /// The build failed or the record source is unavailable; retrying may help.
    Unavailable = 5,
    /// The buffer would exceed the configured storage bound.
    StorageExhausted = 6,
}

impl From<&ErrorKind> for ExitCode {
    fn from(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::Config => Self::Config,
            ErrorKind::Buffer(kind) => match kind {
                BufferErrorKind::InvalidCriteria(_) | BufferErrorKind::CursorInvalid => Self::Usage,
                BufferErrorKind::NotFound(_) => Self::NotFound,
                BufferErrorKind::StorageExhausted => Self::StorageExhausted,
                kind if kind.is_retryable() => Self::Unavailable,
                _ => Self::Failure,
            },
            ErrorKind::Io(_) | ErrorKind::Source | ErrorKind::Output => Self::Failure,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_buffer::FilterCriteria;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Config, ExitCode::Config)]
    #[case(ErrorKind::Output, ExitCode::Failure)]
    #[case(ErrorKind::Buffer(BufferErrorKind::CursorInvalid), ExitCode::Usage)]
    #[case(ErrorKind::Buffer(BufferErrorKind::InvalidCriteria("sort".to_string())), ExitCode::Usage)]
    #[case(ErrorKind::Buffer(BufferErrorKind::NotFound(FilterCriteria::default().hash())), ExitCode::NotFound)]
    #[case(ErrorKind::Buffer(BufferErrorKind::BuildFailure), ExitCode::Unavailable)]
    #[case(ErrorKind::Buffer(BufferErrorKind::SourceUnavailable), ExitCode::Unavailable)]
    #[case(ErrorKind::Buffer(BufferErrorKind::StorageExhausted), ExitCode::StorageExhausted)]
    #[case(ErrorKind::Buffer(BufferErrorKind::Migration), ExitCode::Failure)]
    fn test_exit_code(#[case] kind: ErrorKind, #[case] expected: ExitCode) {
        assert_eq!(ExitCode::from(&kind), expected);
    }

    #[test]
    fn test_buffer_keeps_kind() {
        let result: glint_buffer::error::Result<()> = Err(exn::Exn::from(BufferErrorKind::CursorInvalid));
        let err = buffer(result).unwrap_err();
        assert_eq!(*err, ErrorKind::Buffer(BufferErrorKind::CursorInvalid));
    }
}
