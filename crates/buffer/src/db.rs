//! Database connection and pool management.
//!
//! One SQLite database holds the buffer registry, the active filter state and
//! every materialized buffer table. Buffer tables come and go with every
//! build, so the file is created with incremental auto-vacuum and the
//! registry hands freed pages back through [`reclaim_free_pages`] whenever
//! it drops one.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// Readers keep paginating while a build holds the single writer.
const MAX_CONNECTIONS: u32 = 5;

/// Database connection pool for the buffer store.
///
/// Cloning is cheap; every clone shares the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Per-connection PRAGMAs; a page cache set on one connection
            // says nothing about the others.
            .after_connect(|conn, meta| Box::pin(async move {
                Self::apply_pragmas(conn, meta).await
            }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect to the buffer database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, None).await
    }

    /// Connect to a private in-memory database, gone once the pool closes.
    ///
    /// Builds, pages and registry writes all queue on its one connection,
    /// which is fine for tests and throwaway buffers but serializes readers
    /// behind a running build.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // Every extra connection would open its own empty database.
        Self::new(options, Some(1)).await
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // Page reads run against a snapshot while a build appends.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            // A buffer lost to a power cut is rebuilt from the source anyway.
            .synchronous(SqliteSynchronous::Normal)
            // PRAGMA busy_timeout = 5000ms
            // Buffer builds hold the single WAL writer for a whole batch
            // insert, so concurrent registry writes need to wait it out.
            .busy_timeout(std::time::Duration::from_millis(5000))
            // Only takes effect on a new file. Pages are released by
            // `reclaim_free_pages`, not on every commit.
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Incremental)
    }

    /// PRAGMAs without a `SqliteConnectOptions` setter.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
                PRAGMA mmap_size = 33554432;
                PRAGMA analysis_limit = 1000;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Create or upgrade the registry and active filter tables.
    #[instrument("performing database migrations")]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wait for outstanding connections and close the pool.
    pub async fn close(&self) {
        // Keyset indexes on fresh buffer tables have no statistics yet.
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

/// Return the free pages left behind by dropped buffer tables to the file
/// system.
pub(crate) async fn reclaim_free_pages(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA incremental_vacuum").execute(pool).await.or_raise(|| ErrorKind::Database)?;
    Ok(())
}
