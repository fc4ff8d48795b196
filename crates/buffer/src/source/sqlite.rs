use super::RecordStream;
use crate::Database;
use crate::criteria::{FilterCriteria, NsfwMode};
use crate::models::MediaRow;
use crate::record::MediaRecord;
use crate::source::RecordSource;
use crate::source::error::{ErrorKind, Result};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::StreamExt;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;

const COLUMNS: &str = "id, path, file_name, file_type, file_size, created_at, modified_at, score, nsfw";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS media (
        id          INTEGER PRIMARY KEY,
        path        TEXT NOT NULL,
        file_name   TEXT NOT NULL,
        file_type   TEXT NOT NULL,
        file_size   INTEGER NOT NULL,
        created_at  INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        score       INTEGER,
        nsfw        BOOLEAN NOT NULL DEFAULT FALSE
    );
    CREATE INDEX IF NOT EXISTS media_created_at ON media (created_at);
"#;

/// Record source backed by a `media` table in a SQLite database.
///
/// Usually the same database the buffer registry lives in, but nothing
/// requires that.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    name: String,
    pool: SqlitePool,
}
impl From<&Database> for SqliteSource {
    fn from(db: &Database) -> Self {
        Self::new("sqlite", db.pool().clone())
    }
}

fn map_sqlx_error(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            ErrorKind::Unavailable(err.to_string())
        },
        _ => ErrorKind::Query,
    }
}

impl SqliteSource {
    pub fn new(name: impl Into<String>, pool: SqlitePool) -> Self {
        Self { name: name.into(), pool }
    }

    /// Create the `media` table if it doesn't exist yet.
    #[instrument(skip(self), fields(source = %self.name))]
    pub async fn create_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await.or_raise(|| ErrorKind::Query)?;
        Ok(())
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: &MediaRecord) -> Result<()> {
        let row = MediaRow::from(record);
        sqlx::query(
            r#"
                INSERT OR REPLACE INTO media
                    (id, path, file_name, file_type, file_size, created_at, modified_at, score, nsfw)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id)
        .bind(row.path)
        .bind(row.file_name)
        .bind(row.file_type)
        .bind(row.file_size)
        .bind(row.created_at)
        .bind(row.modified_at)
        .bind(row.score)
        .bind(row.nsfw)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(&e))?;
        Ok(())
    }

    /// Translate criteria into a `SELECT` over the `media` table.
    ///
    /// Predicates mirror [`FilterCriteria::matches`] and the `ORDER BY`
    /// mirrors [`FilterCriteria::compare`]; both sides must stay in step.
    fn select(projection: &str, criteria: &FilterCriteria, ordered: bool) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT {projection} FROM media WHERE 1 = 1"));
        if !criteria.file_types().is_empty() {
            builder.push(" AND lower(ltrim(trim(file_type), '.')) IN (");
            let mut separated = builder.separated(", ");
            for file_type in criteria.file_types() {
                separated.push_bind(file_type.clone());
            }
            separated.push_unseparated(")");
        }
        let (start, end) = criteria.date_range();
        if let Some(start) = start {
            builder.push(" AND created_at >= ").push_bind(start.unix_timestamp());
        }
        if let Some(end) = end {
            builder.push(" AND created_at <= ").push_bind(end.unix_timestamp());
        }
        match criteria.nsfw() {
            NsfwMode::All => {},
            NsfwMode::SfwOnly => {
                builder.push(" AND nsfw = FALSE");
            },
            NsfwMode::NsfwOnly => {
                builder.push(" AND nsfw = TRUE");
            },
        }
        let (min, max) = criteria.score_range();
        if let Some(min) = min {
            builder.push(" AND score >= ").push_bind(min);
        }
        if let Some(max) = max {
            builder.push(" AND score <= ").push_bind(max);
        }
        if !ordered {
            return builder;
        }
        let column = criteria.sort().column();
        let direction = criteria.direction().sql();
        // Both identifiers come from closed enums, never from user input.
        builder.push(format!(" ORDER BY {column} IS NULL, {column} {direction}, id {direction}"));
        builder
    }
}

#[async_trait]
impl RecordSource for SqliteSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn query<'a>(&'a self, criteria: &'a FilterCriteria) -> RecordStream<'a> {
        let mut builder = Self::select(COLUMNS, criteria, true);
        Box::pin(stream! {
            let mut rows = builder.build_query_as::<MediaRow>().fetch(&self.pool);
            while let Some(row) = rows.next().await {
                match row {
                    Ok(row) => yield MediaRecord::try_from(row),
                    Err(err) => {
                        let kind = map_sqlx_error(&err);
                        yield Err(err).or_raise(|| kind);
                        break;
                    },
                }
            }
        })
    }

    async fn count(&self, criteria: &FilterCriteria) -> Result<u64> {
        let (count,): (i64,) = Self::select("COUNT(*)", criteria, false)
            .build_query_as::<(i64,)>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(&e))?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("count"))
    }
}
