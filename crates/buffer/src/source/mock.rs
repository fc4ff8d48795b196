//! In-memory record source for testing.

use super::RecordStream;
use crate::criteria::FilterCriteria;
use crate::record::MediaRecord;
use crate::source::RecordSource;
use crate::source::error::{ErrorKind, Result};
use async_stream::stream;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// In-memory record source for testing.
///
/// Records live in a `Vec` behind a [`RwLock`], filtered and sorted on every
/// query exactly as [`FilterCriteria::matches`] and
/// [`FilterCriteria::compare`] describe. The source also counts the queries
/// it has answered (one per physical buffer build), can be slowed down to
/// keep builds in flight, and can be told to fail. Counting records is
/// neither counted as a query nor subject to injected failures.
///
/// # Examples
///
/// ```
/// use glint_buffer::record::MediaRecord;
/// use glint_buffer::source::{MemorySource, RecordSource};
/// use glint_buffer::FilterCriteria;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let source = MemorySource::with_records((1..=3).map(MediaRecord::sample));
/// assert_eq!(source.count(&FilterCriteria::default()).await.unwrap(), 3);
/// assert_eq!(source.query_count(), 0);
/// # }
/// ```
pub struct MemorySource {
    name: String,
    records: RwLock<Vec<MediaRecord>>,
    queries: AtomicU64,
    failures: AtomicU32,
    delay: Option<Duration>,
}

impl MemorySource {
    pub fn with_records(records: impl IntoIterator<Item = MediaRecord>) -> Self {
        Self {
            name: "memory".to_string(),
            records: RwLock::new(records.into_iter().collect()),
            queries: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep for `delay` before yielding each record.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `count` queries fail part-way through the stream.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of queries started so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub async fn insert(&self, record: MediaRecord) {
        self.records.write().await.push(record);
    }

    /// Remove the record with `id`. Returns whether there was one.
    pub async fn remove(&self, id: i64) -> bool {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|record| record.id != id);
        records.len() != before
    }

    fn take_failure(&self) -> bool {
        self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}
impl Default for MemorySource {
    fn default() -> Self {
        Self::with_records([])
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn query<'a>(&'a self, criteria: &'a FilterCriteria) -> RecordStream<'a> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let fail = self.take_failure();
        Box::pin(stream! {
            // Snapshot under the read lock, then drop it before yielding.
            let mut matching: Vec<MediaRecord> = {
                let guard = self.records.read().await;
                guard.iter().filter(|record| criteria.matches(record)).cloned().collect()
            };
            matching.sort_by(|a, b| criteria.compare(a, b));
            let halfway = matching.len() / 2;
            for (index, record) in matching.into_iter().enumerate() {
                if fail && index == halfway {
                    yield Err(exn::Exn::from(ErrorKind::Unavailable("simulated outage".to_string())));
                    return;
                }
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(record);
            }
            if fail {
                yield Err(exn::Exn::from(ErrorKind::Unavailable("simulated outage".to_string())));
            }
        })
    }

    async fn count(&self, criteria: &FilterCriteria) -> Result<u64> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|record| criteria.matches(record)).count() as u64)
    }
}
