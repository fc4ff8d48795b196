//! The primary record source buffers are materialized from.
//!
//! The buffer engine never answers filtered queries itself; it asks a
//! [`RecordSource`] once per build and freezes whatever comes back. Any store
//! that can filter by the [`FilterCriteria`] predicates and return records in
//! the requested order (with the record id as a deterministic tie-break) can
//! act as a source.

pub mod error;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod sqlite;

#[cfg(any(test, feature = "mock"))]
pub use self::mock::MemorySource;
pub use self::sqlite::SqliteSource;
use crate::criteria::FilterCriteria;
use crate::record::MediaRecord;
use crate::source::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;
use std::sync::Arc;

pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<MediaRecord>> + Send + 'a>>;
pub type SourceHandle = Arc<dyn RecordSource + Send + Sync>;

/// Read-only access to the primary record store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Name of the source, used for logging only.
    fn name(&self) -> &str;

    /// Stream every record matching `criteria`, ordered by
    /// [`FilterCriteria::compare`]: the sort key in the requested direction
    /// with missing keys last, ties broken on record id in the same direction.
    ///
    /// Errors may be yielded at any point in the stream; the consumer stops
    /// at the first one.
    fn query<'a>(&'a self, criteria: &'a FilterCriteria) -> RecordStream<'a>;

    /// Count the records matching `criteria`.
    ///
    /// Default implementation drains [`query()`](Self::query).
    async fn count(&self, criteria: &FilterCriteria) -> Result<u64> {
        self.query(criteria).try_fold(0u64, |count, _| async move { Ok(count + 1) }).await
    }
}
