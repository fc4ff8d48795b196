//! Keyset pagination over published buffers.
//!
//! A cursor names the last row a caller has seen by its `(sort_key,
//! record_id)` pair. Resuming looks that pair up through the buffer's keyset
//! index to find its position, then reads the rows after it in position
//! order. Positions are assigned in source order at build time, so the page
//! order is exactly the order the source returned.
//!
//! Cursors are only meaningful against the buffer table they were issued
//! from, so each one carries that table's generation. A cursor from an older
//! generation (the buffer was rebuilt since), or one that doesn't resolve,
//! is [`ErrorKind::CursorInvalid`], never a silently wrong page.

use crate::criteria::{FilterHash, SortField};
use crate::error::{Error, ErrorKind, Result};
use crate::record::{MediaRecord, SortKey};
use crate::registry::{is_buffer_table, table_generation};
use exn::{OptionExt, ResultExt};
use glint_config::BufferConfig;
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, instrument};

/// Position of the last row a caller has seen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    /// Generation of the buffer table the cursor was issued from.
    pub generation: String,
    pub sort_key: SortKey,
    pub record_id: i64,
}

fn hex_encode(value: &str) -> String {
    value.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(value: &str) -> Option<String> {
    if value.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..value.len())
        .step_by(2)
        .map(|i| value.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

fn is_generation(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit() || b == b'_')
}

/// `<generation>:<tag>:<value>:<record id>`, where the tag is `n` (no key),
/// `i` (integer) or `s` (text, hex encoded).
impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.generation)?;
        match &self.sort_key {
            SortKey::Null => write!(f, "n::{}", self.record_id),
            SortKey::Integer(value) => write!(f, "i:{value}:{}", self.record_id),
            SortKey::Text(value) => write!(f, "s:{}:{}", hex_encode(value), self.record_id),
        }
    }
}

impl FromStr for Cursor {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(4, ':');
        let (Some(generation), Some(tag), Some(value), Some(id)) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            exn::bail!(ErrorKind::CursorInvalid);
        };
        if !is_generation(generation) {
            exn::bail!(ErrorKind::CursorInvalid);
        }
        let record_id = id.parse::<i64>().or_raise(|| ErrorKind::CursorInvalid)?;
        let sort_key = match (tag, value) {
            ("n", "") => SortKey::Null,
            ("i", value) => SortKey::Integer(value.parse::<i64>().or_raise(|| ErrorKind::CursorInvalid)?),
            ("s", value) => SortKey::Text(hex_decode(value).ok_or_raise(|| ErrorKind::CursorInvalid)?),
            _ => exn::bail!(ErrorKind::CursorInvalid),
        };
        Ok(Self { generation: generation.to_string(), sort_key, record_id })
    }
}

/// One page of a buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Page {
    pub items: Vec<MediaRecord>,
    /// Present exactly when `has_more` is.
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub default_page_size: u32,
    pub max_page_size: u32,
}
impl From<&BufferConfig> for PageOptions {
    fn from(config: &BufferConfig) -> Self {
        Self { default_page_size: config.default_page_size, max_page_size: config.max_page_size }
    }
}
impl Default for PageOptions {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}
impl PageOptions {
    /// Resolve a requested page size into `1..=max_page_size`.
    pub fn limit(&self, requested: Option<u32>) -> u32 {
        let max = self.max_page_size.max(1);
        requested.unwrap_or(self.default_page_size).clamp(1, max)
    }
}

/// Map errors reading a buffer table. The table vanishing underneath us means
/// the buffer was evicted or cleared, which callers handle as [`ErrorKind::NotFound`].
fn table_error(err: sqlx::Error, hash: &FilterHash) -> Error {
    let missing = matches!(&err, sqlx::Error::Database(db) if db.message().contains("no such table"));
    match missing {
        true => exn::Exn::from(err).raise(ErrorKind::NotFound(hash.clone())),
        false => exn::Exn::from(err).raise(ErrorKind::Database),
    }
}

/// Read one page of the buffer published for `hash`.
///
/// The registry lookup and the table reads share one read transaction, so
/// the page comes from a single consistent snapshot even if the buffer is
/// replaced or evicted concurrently.
#[instrument(level = "debug", skip(pool, cursor), fields(hash = %hash.short()))]
pub(crate) async fn fetch_page(pool: &SqlitePool, hash: &FilterHash, cursor: Option<&str>, limit: u32) -> Result<Page> {
    // Parse before touching the database: a malformed cursor is the caller's
    // problem regardless of whether the buffer exists.
    let cursor = cursor.map(Cursor::from_str).transpose()?;
    let mut tx = pool.begin().await.or_raise(|| ErrorKind::Database)?;
    let resolved: Option<(String, String)> = sqlx::query_as(include_str!("../queries/resolve_entry.sql"))
        .bind(hash.as_str())
        .fetch_optional(&mut *tx)
        .await
        .or_raise(|| ErrorKind::Database)?;
    let (table, sort_field) = resolved.ok_or_raise(|| ErrorKind::NotFound(hash.clone()))?;
    if !is_buffer_table(&table) {
        exn::bail!(ErrorKind::InvalidData("table name"));
    }
    let generation = table_generation(&table).ok_or_raise(|| ErrorKind::InvalidData("table name"))?;
    let sort = sort_field.parse::<SortField>().or_raise(|| ErrorKind::InvalidData("sort field"))?;

    let after = match &cursor {
        None => -1,
        Some(cursor) if cursor.generation != generation => {
            debug!(issued = %cursor.generation, current = %generation, "cursor issued by a replaced buffer");
            exn::bail!(ErrorKind::CursorInvalid);
        },
        Some(cursor) => {
            let query = format!(r#"SELECT position FROM "{table}" WHERE sort_key IS ? AND record_id = ?"#);
            let query = sqlx::query_as::<_, (i64,)>(&query);
            let query = match &cursor.sort_key {
                SortKey::Null => query.bind(None::<i64>),
                SortKey::Integer(value) => query.bind(*value),
                SortKey::Text(value) => query.bind(value.as_str()),
            };
            let position = query
                .bind(cursor.record_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| table_error(e, hash))?;
            position.ok_or_raise(|| ErrorKind::CursorInvalid)?.0
        },
    };

    let query = format!(r#"SELECT payload FROM "{table}" WHERE position > ? ORDER BY position LIMIT ?"#);
    let payloads: Vec<(String,)> = sqlx::query_as(&query)
        .bind(after)
        .bind(i64::from(limit) + 1)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| table_error(e, hash))?;
    tx.commit().await.or_raise(|| ErrorKind::Database)?;

    let mut items = payloads
        .into_iter()
        .map(|(payload,)| serde_json::from_str::<MediaRecord>(&payload).or_raise(|| ErrorKind::InvalidData("payload")))
        .collect::<Result<Vec<_>>>()?;
    let has_more = items.len() > limit as usize;
    items.truncate(limit as usize);
    let next_cursor = match has_more {
        true => items.last().map(|last| {
            Cursor { generation: generation.to_string(), sort_key: last.sort_key(sort), record_id: last.id }.to_string()
        }),
        false => None,
    };
    Ok(Page { items, next_cursor, has_more })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::criteria::{FilterCriteria, SortDirection};
    use crate::health::SourceHealth;
    use crate::registry::Registry;
    use crate::source::MemorySource;
    use crate::store::{BufferStore, BuildOptions};
    use rstest::rstest;

    async fn built(records: Vec<MediaRecord>, criteria: &FilterCriteria) -> (Database, BufferStore, FilterHash) {
        let db = Database::connect_in_memory().await.unwrap();
        let store = BufferStore::new(&db, Registry::from(&db), BuildOptions::default());
        let source = MemorySource::with_records(records);
        let entry = store.build(&source, criteria, &SourceHealth::new(3)).await.unwrap();
        (db, store, entry.hash)
    }

    async fn generation(db: &Database, hash: &FilterHash) -> String {
        let entry = Registry::from(db).get(hash).await.unwrap().unwrap();
        table_generation(&entry.table_name).unwrap().to_string()
    }

    fn cursor_at(generation: &str, sort_key: SortKey, record_id: i64) -> Cursor {
        Cursor { generation: generation.to_string(), sort_key, record_id }
    }

    async fn collect_all(db: &Database, hash: &FilterHash, limit: u32) -> (Vec<i64>, Vec<usize>) {
        let (mut ids, mut sizes, mut cursor) = (Vec::new(), Vec::new(), None::<String>);
        loop {
            let page = fetch_page(db.pool(), hash, cursor.as_deref(), limit).await.unwrap();
            assert_eq!(page.has_more, page.next_cursor.is_some());
            sizes.push(page.items.len());
            ids.extend(page.items.iter().map(|r| r.id));
            if !page.has_more {
                return (ids, sizes);
            }
            cursor = page.next_cursor;
        }
    }

    #[rstest]
    #[case(cursor_at("17_0", SortKey::Null, 7), "17_0:n::7")]
    #[case(cursor_at("17_0", SortKey::Integer(-42), 3), "17_0:i:-42:3")]
    #[case(cursor_at("5", SortKey::Text("a:b".to_string()), -1), "5:s:613a62:-1")]
    fn test_cursor_format(#[case] cursor: Cursor, #[case] encoded: &str) {
        assert_eq!(cursor.to_string(), encoded);
        assert_eq!(encoded.parse::<Cursor>().unwrap(), cursor);
    }

    #[test]
    fn test_cursor_text_round_trip() {
        let cursor = cursor_at("1_2", SortKey::Text("ünïcødé 🎞.png".to_string()), 9);
        assert_eq!(cursor.to_string().parse::<Cursor>().unwrap(), cursor);
    }

    #[rstest]
    #[case("")]
    #[case("garbage")]
    #[case("1:i:12")]
    #[case("1:i:twelve:3")]
    #[case("1:x:1:1")]
    #[case("1:n:1:1")]
    #[case("1:s:zz:1")]
    #[case("1:s:abc:1")]
    #[case("1:s:ff:1")]
    #[case("1:i:1:")]
    #[case("i:1:1")]
    #[case(":i:1:1")]
    #[case("1a:i:1:1")]
    fn test_malformed_cursor(#[case] encoded: &str) {
        let err = encoded.parse::<Cursor>().unwrap_err();
        assert_eq!(*err, ErrorKind::CursorInvalid);
    }

    #[rstest]
    #[case(None, 50)]
    #[case(Some(0), 1)]
    #[case(Some(10), 10)]
    #[case(Some(10_000), 200)]
    fn test_limit_clamp(#[case] requested: Option<u32>, #[case] expected: u32) {
        assert_eq!(PageOptions::default().limit(requested), expected);
    }

    #[tokio::test]
    async fn test_pages_cover_buffer_exactly_once() {
        let criteria = FilterCriteria::new(SortField::CreatedAt, SortDirection::Desc);
        let (db, _store, hash) = built((1..=10).map(MediaRecord::sample).collect(), &criteria).await;
        let (ids, sizes) = collect_all(&db, &hash, 3).await;
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(ids, (1..=10).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_duplicate_sort_keys_paginate_on_record_id() {
        // Every sample has the same file size, so the tie-break does all the work.
        let criteria = FilterCriteria::new(SortField::FileSize, SortDirection::Asc);
        let (db, _store, hash) = built((1..=25).map(MediaRecord::sample).collect(), &criteria).await;
        let (ids, _) = collect_all(&db, &hash, 4).await;
        assert_eq!(ids, (1..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_null_and_text_keys() {
        let records = (1..=9)
            .map(|id| {
                let mut record = MediaRecord::sample(id);
                record.score = (id % 3 != 0).then_some(id);
                record
            })
            .collect::<Vec<_>>();
        for sort in [SortField::Score, SortField::FileName] {
            let criteria = FilterCriteria::new(sort, SortDirection::Desc);
            let mut expected = records.clone();
            expected.sort_by(|a, b| criteria.compare(a, b));
            let (db, _store, hash) = built(records.clone(), &criteria).await;
            let (ids, _) = collect_all(&db, &hash, 2).await;
            assert_eq!(ids, expected.iter().map(|r| r.id).collect::<Vec<_>>(), "{sort}");
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_cursor() {
        let (db, _store, hash) = built((1..=4).map(MediaRecord::sample).collect(), &FilterCriteria::default()).await;
        let first = fetch_page(db.pool(), &hash, None, 2).await.unwrap();
        let second = fetch_page(db.pool(), &hash, first.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(!second.has_more);
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn test_empty_buffer() {
        let (db, _store, hash) = built(Vec::new(), &FilterCriteria::default()).await;
        let page = fetch_page(db.pool(), &hash, None, 10).await.unwrap();
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_unknown_hash_is_not_found() {
        let db = Database::connect_in_memory().await.unwrap();
        let hash = FilterCriteria::default().hash();
        let err = fetch_page(db.pool(), &hash, None, 10).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound(hash));
    }

    #[tokio::test]
    async fn test_unresolvable_cursor() {
        let (db, _store, hash) = built((1..=4).map(MediaRecord::sample).collect(), &FilterCriteria::default()).await;
        let stranger = cursor_at(&generation(&db, &hash).await, SortKey::Integer(0), 99).to_string();
        let err = fetch_page(db.pool(), &hash, Some(&stranger), 2).await.unwrap_err();
        assert_eq!(*err, ErrorKind::CursorInvalid);
        let err = fetch_page(db.pool(), &hash, Some("not a cursor"), 2).await.unwrap_err();
        assert_eq!(*err, ErrorKind::CursorInvalid);
    }

    #[tokio::test]
    async fn test_cursor_from_replaced_table() {
        let records: Vec<_> = (1..=6).map(MediaRecord::sample).collect();
        let criteria = FilterCriteria::default();
        let (db, store, hash) = built(records.clone(), &criteria).await;
        let first = fetch_page(db.pool(), &hash, None, 2).await.unwrap();
        let issued = first.next_cursor.unwrap();

        // Same rows, new table: the old cursor still names a row that exists,
        // but it was issued by a different table.
        let source = MemorySource::with_records(records);
        store.build(&source, &criteria, &SourceHealth::new(3)).await.unwrap();
        let err = fetch_page(db.pool(), &hash, Some(&issued), 2).await.unwrap_err();
        assert_eq!(*err, ErrorKind::CursorInvalid);

        let fresh = fetch_page(db.pool(), &hash, None, 2).await.unwrap();
        let next = fetch_page(db.pool(), &hash, fresh.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(next.items.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 3]);
    }
}
