//! Last-applied filter per session.
//!
//! Records what a session asked for, not whether it is materialized: setting
//! the active filter never builds anything, and the stored hash may point at
//! a buffer that has since been evicted. Callers restoring a session should
//! treat `NotFound` on that hash as "refresh again".

use crate::Database;
use crate::criteria::{FilterCriteria, FilterHash};
use crate::error::{ErrorKind, Result};
use crate::models::ActiveRow;
use crate::registry::Registry;
use exn::ResultExt;
use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;

/// Session key used when the caller doesn't distinguish sessions.
pub const DEFAULT_SESSION: &str = "default";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveFilter {
    pub session: String,
    pub hash: FilterHash,
    pub criteria: FilterCriteria,
    pub updated_at: OffsetDateTime,
}

/// Wire shape of an [`ActiveFilter`]: criteria in their raw form.
#[derive(Serialize)]
pub struct ActiveFilterView<'a> {
    pub session: &'a str,
    pub hash: &'a FilterHash,
    pub criteria: crate::criteria::RawCriteria,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
impl ActiveFilter {
    pub fn view(&self) -> ActiveFilterView<'_> {
        ActiveFilterView {
            session: &self.session,
            hash: &self.hash,
            criteria: self.criteria.to_raw(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActiveFilterStore {
    pool: SqlitePool,
    registry: Registry,
}
impl ActiveFilterStore {
    /// Shares the registry's clock so `updated_at` is strictly increasing
    /// alongside buffer access times.
    pub fn new(db: &Database, registry: Registry) -> Self {
        Self { pool: db.pool().clone(), registry }
    }

    /// Store `criteria` as the session's active filter. Last write wins.
    pub async fn set(&self, session: &str, criteria: &FilterCriteria) -> Result<ActiveFilter> {
        let active = ActiveFilter {
            session: session.to_string(),
            hash: criteria.hash(),
            criteria: criteria.clone(),
            updated_at: self.registry.now()?,
        };
        let row = ActiveRow::try_from(&active)?;
        sqlx::query(include_str!("../queries/upsert_active_filter.sql"))
            .bind(row.session)
            .bind(row.hash)
            .bind(row.criteria)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(active)
    }

    pub async fn get(&self, session: &str) -> Result<Option<ActiveFilter>> {
        let row: Option<ActiveRow> = sqlx::query_as(include_str!("../queries/get_active_filter.sql"))
            .bind(session)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(ActiveFilter::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{NsfwMode, SortDirection, SortField};

    async fn store() -> (Database, ActiveFilterStore) {
        let db = Database::connect_in_memory().await.unwrap();
        let store = ActiveFilterStore::new(&db, Registry::from(&db));
        (db, store)
    }

    #[tokio::test]
    async fn test_get_without_set() {
        let (_db, store) = store().await;
        assert_eq!(store.get(DEFAULT_SESSION).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (_db, store) = store().await;
        let criteria = FilterCriteria::new(SortField::CreatedAt, SortDirection::Desc)
            .with_file_types(["png", "jpg"])
            .with_nsfw(NsfwMode::SfwOnly);
        let set = store.set(DEFAULT_SESSION, &criteria).await.unwrap();
        let got = store.get(DEFAULT_SESSION).await.unwrap().unwrap();
        assert_eq!(got, set);
        assert_eq!(got.hash, criteria.hash());
        assert_eq!(got.criteria, criteria);
    }

    #[tokio::test]
    async fn test_last_write_wins_per_session() {
        let (_db, store) = store().await;
        let first = FilterCriteria::default();
        let second = FilterCriteria::new(SortField::Score, SortDirection::Asc);
        store.set(DEFAULT_SESSION, &first).await.unwrap();
        store.set("other", &first).await.unwrap();
        let latest = store.set(DEFAULT_SESSION, &second).await.unwrap();
        assert_eq!(store.get(DEFAULT_SESSION).await.unwrap().unwrap(), latest);
        assert_eq!(store.get("other").await.unwrap().unwrap().criteria, first);
    }

    #[test]
    fn test_view_serializes_raw_criteria() {
        let active = ActiveFilter {
            session: DEFAULT_SESSION.to_string(),
            hash: FilterCriteria::default().hash(),
            criteria: FilterCriteria::default(),
            updated_at: time::macros::datetime!(2024-05-01 12:00 UTC),
        };
        let json = serde_json::to_value(active.view()).unwrap();
        assert_eq!(json["criteria"]["sort"], "created_at");
        assert_eq!(json["updated_at"], "2024-05-01T12:00:00Z");
        assert_eq!(json["hash"], active.hash.as_str());
    }
}
