//! Registry of published buffers.
//!
//! A row in `buffer_registry` is what makes a buffer Ready: it maps a filter
//! hash to the physical table holding the frozen result set, together with
//! the bookkeeping eviction needs. Publishing, replacing and removing a
//! buffer each happen in a single transaction that also creates or drops the
//! physical table, so readers never see a registry row without its table.

use crate::Database;
use crate::db::reclaim_free_pages;
use crate::criteria::{FilterCriteria, FilterHash};
use crate::error::{ErrorKind, Result};
use crate::models::{RegistryRow, from_nanos, to_nanos};
use exn::ResultExt;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

/// Prefix shared by every buffer table; anything else in the database is
/// never touched by the buffer store.
pub(crate) const TABLE_PREFIX: &str = "buf_";

/// A Ready buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    pub hash: FilterHash,
    pub table_name: String,
    pub criteria: FilterCriteria,
    pub row_count: u64,
    /// Estimated while building, not measured.
    pub byte_size: u64,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

/// Strictly increasing wall clock.
///
/// LRU ordering breaks if two accesses share a timestamp, and the system
/// clock is neither that precise everywhere nor guaranteed monotonic.
#[derive(Debug, Default)]
pub(crate) struct Clock {
    last: AtomicI64,
}
impl Clock {
    pub(crate) fn now(&self) -> Result<OffsetDateTime> {
        let wall = to_nanos(OffsetDateTime::now_utc())?;
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(wall.max(last.saturating_add(1))))
            // The closure always returns Some.
            .unwrap_or_else(|last| last);
        from_nanos(wall.max(previous.saturating_add(1)))
    }
}

/// Whether `name` looks like a table this crate created. Table names can't
/// be bound as parameters, so anything spliced into DDL must pass this.
pub(crate) fn is_buffer_table(name: &str) -> bool {
    name.starts_with(TABLE_PREFIX)
        && name.len() > TABLE_PREFIX.len()
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// The part of a buffer table name after `buf_<hash prefix>_`, which tells
/// successive tables for one hash apart.
pub(crate) fn table_generation(name: &str) -> Option<&str> {
    let (_, generation) = name.strip_prefix(TABLE_PREFIX)?.split_once('_')?;
    (!generation.is_empty()).then_some(generation)
}

/// Drop a buffer table on an existing connection or transaction.
pub(crate) async fn drop_table(conn: &mut SqliteConnection, table: &str) -> Result<()> {
    if !is_buffer_table(table) {
        exn::bail!(ErrorKind::InvalidData("table name"));
    }
    sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Registry {
    pool: SqlitePool,
    clock: Arc<Clock>,
}
impl From<&Database> for Registry {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone(), clock: Arc::default() }
    }
}
impl Registry {
    pub(crate) fn now(&self) -> Result<OffsetDateTime> {
        self.clock.now()
    }

    pub async fn get(&self, hash: &FilterHash) -> Result<Option<RegistryEntry>> {
        let row: Option<RegistryRow> = sqlx::query_as(include_str!("../queries/get_entry.sql"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(RegistryEntry::try_from).transpose()
    }

    /// All Ready buffers, most recently used first.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<RegistryRow> = sqlx::query_as(include_str!("../queries/list_entries.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(RegistryEntry::try_from).collect()
    }

    /// Number of Ready buffers and the sum of their estimated sizes.
    pub async fn totals(&self) -> Result<(u64, u64)> {
        let (count, bytes): (i64, i64) = sqlx::query_as(include_str!("../queries/registry_totals.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok((
            u64::try_from(count).or_raise(|| ErrorKind::InvalidData("buffer count"))?,
            u64::try_from(bytes).or_raise(|| ErrorKind::InvalidData("byte size"))?,
        ))
    }

    /// Mark a buffer as just used. Returns `false` if there's no such buffer.
    pub async fn touch(&self, hash: &FilterHash) -> Result<bool> {
        let now = to_nanos(self.now()?)?;
        let result = sqlx::query(include_str!("../queries/touch_entry.sql"))
            .bind(now)
            .bind(hash.as_str())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Make `entry` the Ready buffer for its hash.
    ///
    /// Any buffer previously registered under the same hash is unregistered
    /// and its table dropped in the same transaction, so a concurrent reader
    /// sees either the old buffer or the new one. Returns the name of the
    /// replaced table, if there was one.
    #[instrument(level = "debug", skip_all, fields(hash = %entry.hash.short(), table = %entry.table_name))]
    pub async fn publish(&self, entry: &RegistryEntry) -> Result<Option<String>> {
        let row = RegistryRow::try_from(entry)?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        // Leading with a write takes the write lock up front instead of
        // upgrading a read snapshot half-way through.
        let replaced: Option<(String,)> = sqlx::query_as(include_str!("../queries/remove_entry.sql"))
            .bind(entry.hash.as_str())
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/insert_entry.sql"))
            .bind(row.hash)
            .bind(row.table_name)
            .bind(row.criteria)
            .bind(row.sort_field)
            .bind(row.row_count)
            .bind(row.byte_size)
            .bind(row.created_at)
            .bind(row.last_accessed_at)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if let Some((old,)) = &replaced
            && old != &entry.table_name
        {
            drop_table(&mut *tx, old).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        if let Some((old,)) = &replaced {
            debug!(replaced = %old, "replaced previously published buffer");
            self.reclaim().await;
        }
        Ok(replaced.map(|(old,)| old))
    }

    /// Unregister a buffer and drop its table. Returns `false` if there was
    /// no such buffer.
    pub async fn remove(&self, hash: &FilterHash) -> Result<bool> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let removed: Option<(String,)> = sqlx::query_as(include_str!("../queries/remove_entry.sql"))
            .bind(hash.as_str())
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some((table,)) = removed else {
            return Ok(false);
        };
        drop_table(&mut *tx, &table).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.reclaim().await;
        Ok(true)
    }

    /// Unregister every buffer and drop their tables. Returns how many were
    /// removed.
    pub async fn remove_all(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let removed: Vec<(String,)> = sqlx::query_as(include_str!("../queries/remove_all_entries.sql"))
            .fetch_all(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for (table,) in &removed {
            drop_table(&mut *tx, table).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        if !removed.is_empty() {
            self.reclaim().await;
        }
        Ok(removed.len() as u64)
    }

    /// The least recently used buffer, other than `protect`.
    pub async fn lru_candidate(&self, protect: Option<&FilterHash>) -> Result<Option<RegistryEntry>> {
        let row: Option<RegistryRow> = sqlx::query_as(include_str!("../queries/lru_candidate.sql"))
            .bind(protect.map(FilterHash::as_str).unwrap_or_default())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(RegistryEntry::try_from).transpose()
    }

    /// Buffer tables with no registry row: leftovers from builds that never
    /// got to publish (crash, kill, power loss).
    pub async fn orphan_tables(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(include_str!("../queries/orphan_tables.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(|(name,)| name).filter(|name| is_buffer_table(name)).collect())
    }

    /// Drop a buffer table unless a registry row points at it. Returns
    /// whether the table was dropped.
    ///
    /// The check and the drop share a transaction, so a table published by
    /// a build that outran its own cleanup is left alone.
    #[instrument(level = "debug", skip(self))]
    pub async fn discard_unregistered(&self, table: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let registered: Option<(i64,)> = sqlx::query_as(include_str!("../queries/table_registered.sql"))
            .bind(table)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if registered.is_some() {
            debug!("table is registered; keeping it");
            return Ok(false);
        }
        drop_table(&mut *tx, table).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.reclaim().await;
        Ok(true)
    }

    /// Give the pages of dropped tables back to the file system. The drop
    /// itself already succeeded, so failure is only logged.
    async fn reclaim(&self) {
        if let Err(err) = reclaim_free_pages(&self.pool).await {
            warn!(error = ?err, "could not reclaim free pages");
        }
    }
}
