//! Building and publishing buffer tables.
//!
//! A build never touches a table readers can see. Rows are streamed from the
//! record source into a freshly named staging table, the keyset index is
//! built once the table is complete, and only then is the table published
//! through [`Registry::publish`], which swaps the registry pointer and drops
//! the previous table in one transaction. If anything fails, the build times
//! out or the build's future is dropped, the staging table is dropped and the
//! registry is untouched.
//!
//! Staging tables in flight are tracked by name so the orphan sweep can run
//! at any time without pulling a table out from under a running build.
//!
//! # Size accounting
//!
//! Buffer sizes are estimated while inserting rather than measured, as the
//! JSON payload length plus the sort key twice (table and index) plus a fixed
//! per-row overhead. The estimate only needs to be consistent, since it is
//! compared against itself for eviction. Before anything is staged, the
//! source's match count times the per-row overhead gives a lower bound that
//! rejects hopeless builds without streaming a single record.

use crate::Database;
use crate::criteria::{FilterCriteria, FilterHash};
use crate::error::{ErrorKind, Result};
use crate::health::{SourceHealth, SourceStatus};
use crate::record::{MediaRecord, SortKey};
use crate::registry::{Registry, RegistryEntry, TABLE_PREFIX};
use crate::source::RecordSource;
use exn::ResultExt;
use futures::TryStreamExt;
use glint_config::BufferConfig;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

/// Rough per-row overhead of the rowid, record id and b-tree bookkeeping.
const ROW_OVERHEAD_BYTES: u64 = 32;

pub(crate) fn estimated_row_size(payload: &str, key: &SortKey) -> u64 {
    payload.len() as u64 + 2 * key.estimated_size() as u64 + ROW_OVERHEAD_BYTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub insert_batch_size: usize,
    pub max_total_size_bytes: u64,
    pub build_timeout: Duration,
}
impl From<&BufferConfig> for BuildOptions {
    fn from(config: &BufferConfig) -> Self {
        Self {
            insert_batch_size: (config.insert_batch_size as usize).max(1),
            max_total_size_bytes: config.max_total_size_bytes,
            build_timeout: config.build_timeout(),
        }
    }
}
impl Default for BuildOptions {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}

/// A row on its way into a buffer table.
struct StagedRow {
    position: i64,
    record_id: i64,
    sort_key: SortKey,
    payload: String,
}

struct Materialized {
    row_count: u64,
    byte_size: u64,
}

type StagingSet = Arc<Mutex<HashSet<String>>>;

/// Drop a staging table after a failed build. Failure here only leaves an
/// orphan for the next sweep, so it is logged and swallowed.
async fn discard(registry: &Registry, table: &str) {
    match registry.discard_unregistered(table).await {
        Ok(true) => debug!(%table, "dropped staging table"),
        Ok(false) => warn!(%table, "staging table was published after all; keeping it"),
        Err(err) => error!(%table, error = ?err, "failed to drop staging table; leaving it for the orphan sweep"),
    }
}

/// A staging table owned by one build.
///
/// The name is listed in the staging set until the guard goes away. A guard
/// dropped without [`StagingTable::keep`] or [`StagingTable::discard`] (the
/// build's future was dropped mid-way) drops the table on a background task.
struct StagingTable {
    name: String,
    registry: Registry,
    staging: StagingSet,
    armed: bool,
}
impl StagingTable {
    fn new(name: String, registry: Registry, staging: StagingSet) -> Self {
        staging.lock().unwrap_or_else(PoisonError::into_inner).insert(name.clone());
        Self { name, registry, staging, armed: true }
    }

    /// The table was published; it belongs to the registry now.
    fn keep(mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        self.armed = false;
        discard(&self.registry, &self.name).await;
    }

    fn release(staging: &StagingSet, name: &str) {
        staging.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
    }
}
impl Drop for StagingTable {
    fn drop(&mut self) {
        if !self.armed {
            Self::release(&self.staging, &self.name);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(table = %self.name, "build abandoned outside a runtime; leaving staging table for the orphan sweep");
            Self::release(&self.staging, &self.name);
            return;
        };
        warn!(table = %self.name, "build abandoned; dropping staging table");
        let (name, registry, staging) = (self.name.clone(), self.registry.clone(), self.staging.clone());
        runtime.spawn(async move {
            discard(&registry, &name).await;
            Self::release(&staging, &name);
        });
    }
}

#[derive(Debug)]
pub struct BufferStore {
    pool: SqlitePool,
    registry: Registry,
    options: BuildOptions,
    generation: AtomicU64,
    staging: StagingSet,
}

impl BufferStore {
    pub fn new(db: &Database, registry: Registry, options: BuildOptions) -> Self {
        Self { pool: db.pool().clone(), registry, options, generation: AtomicU64::new(0), staging: StagingSet::default() }
    }

    /// Unique, never reused name for a new buffer table.
    fn staging_name(&self, hash: &FilterHash) -> String {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        format!("{TABLE_PREFIX}{}_{millis}_{generation}", hash.short())
    }

    /// Build a new buffer for `criteria` and publish it, replacing any
    /// previous buffer for the same hash.
    ///
    /// Returns the published entry. On failure the previous buffer (if any)
    /// is still published and the error is one of
    /// [`ErrorKind::BuildFailure`], [`ErrorKind::StorageExhausted`] or
    /// [`ErrorKind::SourceUnavailable`].
    #[instrument(skip_all, fields(sort = %criteria.sort(), source = source.name()))]
    pub async fn build(
        &self,
        source: &dyn RecordSource,
        criteria: &FilterCriteria,
        health: &SourceHealth,
    ) -> Result<RegistryEntry> {
        self.check_storage(source, criteria).await?;
        let hash = criteria.hash();
        let table = StagingTable::new(self.staging_name(&hash), self.registry.clone(), self.staging.clone());
        let started = Instant::now();
        info!(hash = %hash.short(), table = %table.name, "building buffer");
        // Publishing stays outside the timeout: once the registry swap has
        // started it either commits or rolls back on its own.
        let result = match tokio::time::timeout(
            self.options.build_timeout,
            self.materialize(&table.name, source, criteria, health),
        )
        .await
        {
            Ok(Ok(materialized)) => self.publish(&hash, &table.name, criteria, materialized).await,
            Ok(Err(err)) => Err(err),
            Err(elapsed) => {
                warn!(timeout = ?self.options.build_timeout, "buffer build timed out; cancelled");
                Err(elapsed).or_raise(|| ErrorKind::BuildFailure)
            },
        };
        match result {
            Ok(entry) => {
                table.keep();
                info!(rows = entry.row_count, bytes = entry.byte_size, elapsed = ?started.elapsed(), "published buffer");
                Ok(entry)
            },
            Err(err) => {
                table.discard().await;
                let surfaced =
                    matches!(&*err, ErrorKind::BuildFailure | ErrorKind::StorageExhausted | ErrorKind::SourceUnavailable);
                match surfaced {
                    true => Err(err),
                    false => Err(err.raise(ErrorKind::BuildFailure)),
                }
            },
        }
    }

    /// Reject a build whose match count alone can't fit the storage bound.
    ///
    /// Counting is advisory: if the source can't count, the size check
    /// while building still applies.
    async fn check_storage(&self, source: &dyn RecordSource, criteria: &FilterCriteria) -> Result<()> {
        let count = match source.count(criteria).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = ?err, "could not count matching records; checking size while building instead");
                return Ok(());
            },
        };
        let lower_bound = count.saturating_mul(ROW_OVERHEAD_BYTES);
        if lower_bound > self.options.max_total_size_bytes {
            warn!(count, bytes = lower_bound, limit = self.options.max_total_size_bytes, "buffer can't fit storage bounds");
            exn::bail!(ErrorKind::StorageExhausted);
        }
        Ok(())
    }

    async fn publish(
        &self,
        hash: &FilterHash,
        table: &str,
        criteria: &FilterCriteria,
        materialized: Materialized,
    ) -> Result<RegistryEntry> {
        let now = self.registry.now()?;
        let entry = RegistryEntry {
            hash: hash.clone(),
            table_name: table.to_string(),
            criteria: criteria.clone(),
            row_count: materialized.row_count,
            byte_size: materialized.byte_size,
            created_at: now,
            last_accessed_at: now,
        };
        self.registry.publish(&entry).await?;
        Ok(entry)
    }

    async fn materialize(
        &self,
        table: &str,
        source: &dyn RecordSource,
        criteria: &FilterCriteria,
        health: &SourceHealth,
    ) -> Result<Materialized> {
        sqlx::query(&format!(
            r#"CREATE TABLE "{table}" (
                position  INTEGER PRIMARY KEY,
                record_id INTEGER NOT NULL,
                sort_key,
                payload   TEXT NOT NULL
            )"#
        ))
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;

        let sort = criteria.sort();
        let mut batch = Vec::with_capacity(self.options.insert_batch_size);
        let mut position = 0i64;
        let mut byte_size = 0u64;
        let mut records = source.query(criteria);
        loop {
            let record: MediaRecord = match records.try_next().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    let kind = match health.record_failure() {
                        SourceStatus::Degraded { .. } => ErrorKind::SourceUnavailable,
                        SourceStatus::Healthy => ErrorKind::BuildFailure,
                    };
                    return Err(err.raise(kind));
                },
            };
            let sort_key = record.sort_key(sort);
            let payload = serde_json::to_string(&record).or_raise(|| ErrorKind::InvalidData("payload"))?;
            byte_size += estimated_row_size(&payload, &sort_key);
            if byte_size > self.options.max_total_size_bytes {
                warn!(bytes = byte_size, limit = self.options.max_total_size_bytes, "buffer too large for storage bounds");
                exn::bail!(ErrorKind::StorageExhausted);
            }
            batch.push(StagedRow { position, record_id: record.id, sort_key, payload });
            position += 1;
            if batch.len() >= self.options.insert_batch_size {
                self.insert_batch(table, &mut batch).await?;
            }
        }
        // Release the source (and any connection it holds) before the
        // remaining writes.
        drop(records);
        health.record_success();
        self.insert_batch(table, &mut batch).await?;

        sqlx::query(&format!(r#"CREATE INDEX "{table}_keyset" ON "{table}" (sort_key, record_id)"#))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;

        Ok(Materialized { row_count: u64::try_from(position).or_raise(|| ErrorKind::InvalidData("row count"))?, byte_size })
    }

    async fn insert_batch(&self, table: &str, batch: &mut Vec<StagedRow>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!(r#"INSERT INTO "{table}" (position, record_id, sort_key, payload) "#));
        builder.push_values(batch.drain(..), |mut row, staged| {
            row.push_bind(staged.position).push_bind(staged.record_id);
            match staged.sort_key {
                SortKey::Null => row.push_bind(None::<i64>),
                SortKey::Integer(value) => row.push_bind(value),
                SortKey::Text(value) => row.push_bind(value),
            };
            row.push_bind(staged.payload);
        });
        builder.build().execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Drop every buffer table the registry doesn't know about, other than
    /// the staging tables of builds still running in this process.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(&self) -> Result<Vec<String>> {
        let orphans: Vec<String> = {
            let found = self.registry.orphan_tables().await?;
            let staging = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
            found.into_iter().filter(|table| !staging.contains(table)).collect()
        };
        let mut swept = Vec::with_capacity(orphans.len());
        for table in orphans {
            if self.registry.discard_unregistered(&table).await? {
                swept.push(table);
            }
        }
        if !swept.is_empty() {
            warn!(count = swept.len(), "dropped orphaned buffer tables");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{SortDirection, SortField};
    use crate::source::MemorySource;

    async fn store(options: BuildOptions) -> (Database, Registry, BufferStore) {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = Registry::from(&db);
        let store = BufferStore::new(&db, registry.clone(), options);
        (db, registry, store)
    }

    async fn rows(db: &Database, table: &str) -> Vec<(i64, i64)> {
        sqlx::query_as(&format!(r#"SELECT position, record_id FROM "{table}" ORDER BY position"#))
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_staging_names_are_unique_buffer_tables() {
        let (_db, _registry, store) = store(BuildOptions::default()).await;
        let hash = FilterCriteria::default().hash();
        let (a, b) = (store.staging_name(&hash), store.staging_name(&hash));
        assert_ne!(a, b);
        assert!(crate::registry::is_buffer_table(&a));
        assert!(a.starts_with(&format!("buf_{}_", hash.short())));
    }

    #[tokio::test]
    async fn test_build_materializes_in_source_order() {
        let (db, registry, store) = store(BuildOptions { insert_batch_size: 3, ..BuildOptions::default() }).await;
        let source = MemorySource::with_records((1..=10).map(MediaRecord::sample));
        let criteria = FilterCriteria::new(SortField::CreatedAt, SortDirection::Desc);
        let entry = store.build(&source, &criteria, &SourceHealth::new(3)).await.unwrap();
        assert_eq!(entry.row_count, 10);
        assert!(entry.byte_size > 0);
        let ids: Vec<_> = rows(&db, &entry.table_name).await.into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, (1..=10).rev().collect::<Vec<_>>());
        assert_eq!(registry.get(&criteria.hash()).await.unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn test_build_empty_result() {
        let (_db, _registry, store) = store(BuildOptions::default()).await;
        let entry = store.build(&MemorySource::default(), &FilterCriteria::default(), &SourceHealth::new(3)).await.unwrap();
        assert_eq!(entry.row_count, 0);
        assert_eq!(entry.byte_size, 0);
    }

    #[tokio::test]
    async fn test_failed_build_drops_staging_and_keeps_previous() {
        let (_db, registry, store) = store(BuildOptions::default()).await;
        let source = MemorySource::with_records((1..=4).map(MediaRecord::sample));
        let criteria = FilterCriteria::default();
        let health = SourceHealth::new(3);
        let first = store.build(&source, &criteria, &health).await.unwrap();
        source.fail_next(1);
        let err = store.build(&source, &criteria, &health).await.unwrap_err();
        assert_eq!(*err, ErrorKind::BuildFailure);
        assert_eq!(registry.get(&criteria.hash()).await.unwrap(), Some(first));
        assert!(registry.orphan_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_build_is_storage_exhausted() {
        let (_db, registry, store) = store(BuildOptions { max_total_size_bytes: 500, ..BuildOptions::default() }).await;
        let source = MemorySource::with_records((1..=10).map(MediaRecord::sample));
        let err = store.build(&source, &FilterCriteria::default(), &SourceHealth::new(3)).await.unwrap_err();
        assert_eq!(*err, ErrorKind::StorageExhausted);
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.orphan_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_match_count_rejects_build_before_staging() {
        let (_db, registry, store) = store(BuildOptions { max_total_size_bytes: 1000, ..BuildOptions::default() }).await;
        let source = MemorySource::with_records((1..=100).map(MediaRecord::sample));
        let err = store.build(&source, &FilterCriteria::default(), &SourceHealth::new(3)).await.unwrap_err();
        assert_eq!(*err, ErrorKind::StorageExhausted);
        assert_eq!(source.query_count(), 0);
        assert!(registry.orphan_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_build_discards_staging() {
        let (_db, registry, store) = store(BuildOptions::default()).await;
        let source = MemorySource::with_records((1..=50).map(MediaRecord::sample)).with_delay(Duration::from_millis(10));
        let criteria = FilterCriteria::default();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), store.build(&source, &criteria, &SourceHealth::new(3))).await;
        assert!(abandoned.is_err());
        for _ in 0..100 {
            if registry.orphan_tables().await.unwrap().is_empty() && store.staging.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.orphan_tables().await.unwrap().is_empty());
        assert!(store.staging.lock().unwrap().is_empty());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cancels_build() {
        let options = BuildOptions { build_timeout: Duration::from_millis(20), ..BuildOptions::default() };
        let (_db, registry, store) = store(options).await;
        let source = MemorySource::with_records((1..=10).map(MediaRecord::sample)).with_delay(Duration::from_millis(10));
        let err = store.build(&source, &FilterCriteria::default(), &SourceHealth::new(3)).await.unwrap_err();
        assert_eq!(*err, ErrorKind::BuildFailure);
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.orphan_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_source_failures_degrade() {
        let (_db, _registry, store) = store(BuildOptions::default()).await;
        let source = MemorySource::with_records((1..=4).map(MediaRecord::sample));
        let health = SourceHealth::new(2);
        source.fail_next(2);
        let first = store.build(&source, &FilterCriteria::default(), &health).await.unwrap_err();
        assert_eq!(*first, ErrorKind::BuildFailure);
        let second = store.build(&source, &FilterCriteria::default(), &health).await.unwrap_err();
        assert_eq!(*second, ErrorKind::SourceUnavailable);
        assert!(health.is_degraded());
        store.build(&source, &FilterCriteria::default(), &health).await.unwrap();
        assert!(!health.is_degraded());
    }

    #[tokio::test]
    async fn test_sweep_orphans() {
        let (db, registry, store) = store(BuildOptions::default()).await;
        sqlx::query(r#"CREATE TABLE "buf_deadbeef_1_0" (position INTEGER PRIMARY KEY)"#)
            .execute(db.pool())
            .await
            .unwrap();
        let swept = store.sweep_orphans().await.unwrap();
        assert_eq!(swept, vec!["buf_deadbeef_1_0".to_string()]);
        assert!(registry.orphan_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_spares_running_builds() {
        let (db, registry, store) = store(BuildOptions::default()).await;
        let hash = FilterCriteria::default().hash();
        let staging = StagingTable::new(store.staging_name(&hash), registry.clone(), store.staging.clone());
        sqlx::query(&format!(r#"CREATE TABLE "{}" (position INTEGER PRIMARY KEY)"#, staging.name))
            .execute(db.pool())
            .await
            .unwrap();
        assert!(store.sweep_orphans().await.unwrap().is_empty());
        assert_eq!(registry.orphan_tables().await.unwrap(), vec![staging.name.clone()]);
        staging.discard().await;
        assert!(store.staging.lock().unwrap().is_empty());
        assert!(registry.orphan_tables().await.unwrap().is_empty());
    }
}
